use crate::net::channel::{Channel, SendfileKeepAlive};
use crate::net::endpoint::EndpointShared;
use crate::net::pool::SyncStack;
use crate::net::support::{
    SocketError, SocketEvent, OP_READ, OP_REGISTER, OP_UNREGISTER, OP_WRITE,
};
use concurrent_queue::ConcurrentQueue;
use flue::logging;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAKER_TOKEN: Token = Token(0);

/// Interval between timeout sweeps while the selector stays busy.
const SWEEP_INTERVAL_MS: u64 = 1000;

/// Bytes moved per sendfile call before readiness is rechecked.
const SENDFILE_CHUNK: u64 = 8 * 1024 * 1024;

/// (channel, interest ops) value object shuttled through the events
/// queue. Pooled; ownership passes to the queue and back to the cache
/// after the poller applies it.
pub struct PollerEvent {
    channel: Option<Arc<Channel>>,
    ops: u8,
}

impl PollerEvent {
    fn new() -> PollerEvent {
        PollerEvent {
            channel: None,
            ops: 0,
        }
    }

    fn reset(&mut self) {
        self.channel = None;
        self.ops = 0;
    }
}

/// The producer-facing half of the poller: the MPSC event queue, the
/// wake-up counter and the selector waker. Shared by the acceptor, the
/// workers and closing channels.
pub struct PollerHandle {
    queue: ConcurrentQueue<PollerEvent>,
    wakeup_counter: AtomicI64,
    waker: Waker,
    close: AtomicBool,
    event_cache: SyncStack<PollerEvent>,
}

impl PollerHandle {
    /// Enqueues an event and wakes the selector if the poller is parked
    /// in a blocking select (counter at the -1 sentinel).
    pub fn add_event(&self, channel: Arc<Channel>, ops: u8) {
        let mut event = self.event_cache.pop().unwrap_or_else(PollerEvent::new);
        event.channel = Some(channel);
        event.ops = ops;

        if self.queue.push(event).is_err() {
            // Queue closed during shutdown; the final drain handles the rest.
            return;
        }

        if self.wakeup_counter.fetch_add(1, Ordering::AcqRel) == -1 {
            let _ = self.waker.wake();
        }
    }

    /// Marks the poller for shutdown and wakes it.
    pub fn request_close(&self) {
        self.close.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }
}

struct Registration {
    channel: Arc<Channel>,
    /// True while the fd is present in the selector.
    armed: bool,
}

/// The poller owns the selector; it is the only thread that registers or
/// mutates selection interest. Everyone else influences interest solely
/// through the events queue.
pub struct Poller {
    poll: Poll,
    events: Events,
    handle: Arc<PollerHandle>,
    endpoint: Arc<EndpointShared>,
    channels: hashbrown::HashMap<usize, Registration>,
    ready: Vec<(usize, bool, bool)>,
    next_expiration: u64,
    log: logging::Logger,
}

impl Poller {
    pub fn new(endpoint: Arc<EndpointShared>) -> io::Result<(Poller, Arc<PollerHandle>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let handle = Arc::new(PollerHandle {
            queue: ConcurrentQueue::unbounded(),
            wakeup_counter: AtomicI64::new(0),
            waker,
            close: AtomicBool::new(false),
            event_cache: SyncStack::new(endpoint.config.event_cache),
        });

        let log = endpoint.log.new(logging::o!("thread" => "poller"));

        Ok((
            Poller {
                poll,
                events: Events::with_capacity(1024),
                handle: Arc::clone(&handle),
                endpoint,
                channels: hashbrown::HashMap::new(),
                ready: Vec::new(),
                next_expiration: 0,
                log,
            },
            handle,
        ))
    }

    /// Main loop; runs on the dedicated poller thread until close.
    pub fn run(&mut self) {
        let selector_timeout = Duration::from_millis(self.endpoint.config.selector_timeout_ms);

        loop {
            let has_events = self.drain_events();

            if self.handle.is_closing() {
                // Give every open connection a STOP dispatch before the
                // final teardown.
                self.sweep_timeouts(0, false);
                break;
            }

            let pending = self.handle.wakeup_counter.swap(-1, Ordering::AcqRel);
            let timeout = if pending > 0 {
                Duration::from_millis(0)
            } else {
                selector_timeout
            };

            let select = self.poll.poll(&mut self.events, Some(timeout));
            self.handle.wakeup_counter.store(0, Ordering::Release);

            if let Err(err) = select {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "selector failure"; "error" => %err);
                continue;
            }

            self.ready.clear();
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.ready
                    .push((event.token().0, event.is_readable(), event.is_writable()));
            }

            let key_count = self.ready.len();
            let batch = std::mem::take(&mut self.ready);
            for (token, readable, writable) in &batch {
                self.process_key(*token, *readable, *writable);
            }
            self.ready = batch;

            self.sweep_timeouts(key_count, has_events);
        }

        self.shutdown();
    }

    /// Applies queued registration and interest events. Returns true if
    /// any event was consumed.
    fn drain_events(&mut self) -> bool {
        let mut consumed = false;

        while let Ok(mut event) = self.handle.queue.pop() {
            consumed = true;

            let channel = event.channel.take();
            let ops = event.ops;
            event.reset();
            self.handle.event_cache.push(event);

            let Some(channel) = channel else { continue };
            let token = channel.token().0;

            if ops & OP_REGISTER != 0 {
                if channel.is_closed() {
                    continue;
                }

                channel.set_interest(OP_READ);
                self.channels.insert(
                    token,
                    Registration {
                        channel: Arc::clone(&channel),
                        armed: false,
                    },
                );

                if let Err(err) = self.arm(token) {
                    logging::warn!(self.log, "channel registration failed";
                                   "channel" => token, "error" => %err);
                    self.cancel_key(&channel);
                }
            } else if ops & OP_UNREGISTER != 0 {
                // The fd is gone; epoll dropped it with the close.
                self.channels.remove(&token);
            } else {
                if !self.channels.contains_key(&token) {
                    channel.close();
                    continue;
                }

                channel.or_interest(ops);
                if let Err(err) = self.arm(token) {
                    logging::warn!(self.log, "interest update failed";
                                   "channel" => token, "error" => %err);
                    self.cancel_key(&channel);
                }
            }
        }

        consumed
    }

    /// Synchronizes the selector registration with the channel's interest
    /// bits. Zero interest removes the fd from the selector.
    fn arm(&mut self, token: usize) -> io::Result<()> {
        let registration = match self.channels.get_mut(&token) {
            Some(registration) => registration,
            None => return Ok(()),
        };

        let ops = registration.channel.interest() & (OP_READ | OP_WRITE);
        let fd = registration.channel.fd();
        let registry = self.poll.registry();

        if ops == 0 {
            if registration.armed {
                registry.deregister(&mut SourceFd(&fd))?;
                registration.armed = false;
            }
            return Ok(());
        }

        let interest = match (ops & OP_READ != 0, ops & OP_WRITE != 0) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            _ => Interest::WRITABLE,
        };

        if registration.armed {
            registry.reregister(&mut SourceFd(&fd), Token(token), interest)?;
        } else {
            registry.register(&mut SourceFd(&fd), Token(token), interest)?;
            registration.armed = true;
        }

        Ok(())
    }

    fn process_key(&mut self, token: usize, readable: bool, writable: bool) {
        let channel = match self.channels.get(&token) {
            Some(registration) => Arc::clone(&registration.channel),
            None => return,
        };

        if channel.is_closed() {
            self.cancel_key(&channel);
            return;
        }

        // Send-file transfers are driven inline by the poller.
        if writable && channel.sendfile().is_some() {
            self.process_sendfile(&channel);
            return;
        }

        let mut ready_ops = 0u8;
        if readable {
            ready_ops |= OP_READ;
        }
        if writable {
            ready_ops |= OP_WRITE;
        }

        // Threads parked on completion gates take precedence over worker
        // dispatch: readiness belongs to the blocked operation.
        let gated = channel.gate_waits() & ready_ops;
        if gated != 0 {
            channel.clear_interest(gated);
            let _ = self.arm(token);
            channel.open_gate(gated);
            ready_ops &= !gated;
            if ready_ops == 0 {
                return;
            }
        }

        // Clear ready interest so the worker owns read/write until it
        // re-arms through the events queue.
        channel.clear_interest(ready_ops);
        if let Err(err) = self.arm(token) {
            logging::warn!(self.log, "interest clear failed";
                           "channel" => token, "error" => %err);
            self.cancel_key(&channel);
            return;
        }

        if ready_ops & OP_READ != 0
            && !self
                .endpoint
                .workers()
                .dispatch(Arc::clone(&channel), SocketEvent::OpenRead)
        {
            self.cancel_key(&channel);
            return;
        }

        if ready_ops & OP_WRITE != 0
            && !channel.is_closed()
            && !self
                .endpoint
                .workers()
                .dispatch(Arc::clone(&channel), SocketEvent::OpenWrite)
        {
            self.cancel_key(&channel);
        }
    }

    fn process_sendfile(&mut self, channel: &Arc<Channel>) {
        let token = channel.token().0;
        let outcome = self.transfer_sendfile(channel);

        match outcome {
            Ok(Some(keep_alive)) => {
                // Transfer complete.
                *channel.sendfile() = None;
                channel.clear_interest(OP_WRITE);
                let _ = self.arm(token);

                match keep_alive {
                    SendfileKeepAlive::None => self.cancel_key(channel),
                    SendfileKeepAlive::Pipelined => {
                        if !self
                            .endpoint
                            .workers()
                            .dispatch(Arc::clone(channel), SocketEvent::OpenRead)
                        {
                            self.cancel_key(channel);
                        }
                    }
                    SendfileKeepAlive::Open => {
                        channel.or_interest(OP_READ);
                        if self.arm(token).is_err() {
                            self.cancel_key(channel);
                        }
                    }
                }
            }
            Ok(None) => {
                // Socket is full; stay armed for WRITE.
                channel.or_interest(OP_WRITE);
                if self.arm(token).is_err() {
                    self.cancel_key(channel);
                }
            }
            Err(err) => {
                logging::debug!(self.log, "sendfile failed";
                                "channel" => token, "error" => ?err);
                self.cancel_key(channel);
            }
        }
    }

    /// Moves file bytes to the socket. Ok(Some(disposition)) on
    /// completion, Ok(None) when the socket stopped accepting data.
    fn transfer_sendfile(
        &self,
        channel: &Arc<Channel>,
    ) -> Result<Option<SendfileKeepAlive>, SocketError> {
        let mut guard = channel.sendfile();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(Some(SendfileKeepAlive::Open)),
        };

        if state.file.is_none() {
            state.file = Some(File::open(&state.path).map_err(SocketError::from)?);
        }

        let now = self.endpoint.clock.millis();

        let uses_tls = channel.io().tls.is_some();
        if uses_tls {
            // Encrypted connections cannot use the zero-copy path; pump
            // the file through the engine instead.
            return self.transfer_sendfile_tls(channel, state, now);
        }

        use std::os::unix::io::AsRawFd;
        let file_fd = state.file.as_ref().expect("Sendfile must have open file").as_raw_fd();
        let sock_fd = channel.fd();

        while state.remaining > 0 {
            let mut offset = state.pos as libc::off_t;
            let count = state.remaining.min(SENDFILE_CHUNK) as usize;

            let written =
                unsafe { libc::sendfile(sock_fd, file_fd, &mut offset, count) };

            if written < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(err.into()),
                };
            }

            if written == 0 {
                return Err(SocketError::Io(io::ErrorKind::WriteZero));
            }

            state.pos += written as u64;
            state.remaining -= written as u64;
            channel.touch_write(now);
        }

        Ok(Some(state.keep_alive))
    }

    fn transfer_sendfile_tls(
        &self,
        channel: &Arc<Channel>,
        state: &mut crate::net::channel::SendfileData,
        now: u64,
    ) -> Result<Option<SendfileKeepAlive>, SocketError> {
        use std::io::{Read, Seek, SeekFrom};

        let mut io = channel.io();
        let crate::net::channel::ChannelIo { stream, tls, .. } = &mut *io;
        let sock = stream.as_mut().ok_or(SocketError::Eof)?;
        let engine = tls.as_mut().ok_or(SocketError::Eof)?;

        let file = state.file.as_mut().expect("Sendfile must have open file");
        let mut chunk = [0u8; 16 * 1024];

        while state.remaining > 0 {
            file.seek(SeekFrom::Start(state.pos)).map_err(SocketError::from)?;
            let want = state.remaining.min(chunk.len() as u64) as usize;
            let got = file.read(&mut chunk[..want]).map_err(SocketError::from)?;

            if got == 0 {
                return Err(SocketError::Eof);
            }

            match engine.write(sock, &chunk[..got]) {
                Ok(count) => {
                    state.pos += count as u64;
                    state.remaining -= count as u64;
                    channel.touch_write(now);

                    if count < got && !engine.flush(sock)? {
                        return Ok(None);
                    }
                }
                Err(SocketError::Wait) => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        if !engine.flush(sock)? {
            return Ok(None);
        }

        Ok(Some(state.keep_alive))
    }

    /// Throttled idle/read/write timeout sweep. Iterates over a snapshot
    /// of the token set so concurrent cancellation cannot upset it.
    fn sweep_timeouts(&mut self, key_count: usize, has_events: bool) {
        let now = self.endpoint.clock.millis();
        let closing = self.handle.is_closing();

        if self.next_expiration > 0
            && (key_count > 0 || has_events)
            && now < self.next_expiration
            && !closing
        {
            return;
        }

        self.next_expiration = now + SWEEP_INTERVAL_MS;

        let tokens: Vec<usize> = self.channels.keys().copied().collect();

        for token in tokens {
            let channel = match self.channels.get(&token) {
                Some(registration) => Arc::clone(&registration.channel),
                None => continue,
            };

            if channel.is_closed() {
                self.cancel_key(&channel);
                continue;
            }

            if closing {
                if !self
                    .endpoint
                    .workers()
                    .dispatch(Arc::clone(&channel), SocketEvent::Stop)
                {
                    self.cancel_key(&channel);
                }
                continue;
            }

            let interest = channel.interest();
            let mut expired = false;

            if interest & OP_READ != 0 {
                let timeout = channel.read_timeout();
                if timeout > 0 && now.saturating_sub(channel.last_read()) > timeout {
                    expired = true;
                }
            }

            if !expired && interest & OP_WRITE != 0 {
                let timeout = channel.write_timeout();
                if timeout > 0 && now.saturating_sub(channel.last_write()) > timeout {
                    expired = true;
                }
            }

            if !expired {
                continue;
            }

            logging::debug!(self.log, "connection timed out";
                            "channel" => token,
                            "idle" => now.saturating_sub(channel.last_read()));

            channel.set_error(SocketError::Timeout);
            channel.set_interest(0);
            let _ = self.arm(token);

            // A gate-parked thread observes the error through its open
            // gate; everything else goes through the worker pool.
            if channel.gate_waits() != 0 {
                channel.open_gate(OP_READ | OP_WRITE);
                continue;
            }

            if !self
                .endpoint
                .workers()
                .dispatch(Arc::clone(&channel), SocketEvent::Error)
            {
                self.cancel_key(&channel);
            }
        }
    }

    /// Removes the registration and closes the wrapper.
    fn cancel_key(&mut self, channel: &Arc<Channel>) {
        if let Some(registration) = self.channels.remove(&channel.token().0) {
            if registration.armed {
                let _ = self
                    .poll
                    .registry()
                    .deregister(&mut SourceFd(&registration.channel.fd()));
            }
        }

        channel.close();
    }

    /// Post-loop teardown: close every connection, drain leftover events,
    /// release the stop latch.
    fn shutdown(&mut self) {
        logging::info!(self.log, "poller stopping";
                       "connections" => self.channels.len());

        let registrations: Vec<Arc<Channel>> = self
            .channels
            .drain()
            .map(|(_, registration)| registration.channel)
            .collect();

        for channel in registrations {
            channel.close();
        }

        self.handle.queue.close();
        while let Ok(mut event) = self.handle.queue.pop() {
            if let Some(channel) = event.channel.take() {
                channel.close();
            }
        }

        self.handle.event_cache.clear();
        self.endpoint.stop_latch().count_down();
    }
}
