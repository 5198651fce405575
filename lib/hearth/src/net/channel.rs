use crate::net::buffer::ByteBuffer;
use crate::net::endpoint::EndpointShared;
use crate::net::support::{SocketError, SocketResult, OP_READ, OP_UNREGISTER, OP_WRITE};
use crate::net::tls::TlsEngine;
use flue::logging;
use flue::sync::Flag;
use mio::Token;
use std::fs::File;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Keep-alive disposition once a send-file transfer completes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendfileKeepAlive {
    /// Close the connection.
    None,
    /// The next request is already buffered; process it directly.
    Pipelined,
    /// Re-register for READ and wait for the next request.
    Open,
}

/// State of an in-flight zero-copy file transfer, attached to the channel
/// and consumed by the poller when the socket is write-ready.
pub struct SendfileData {
    pub path: PathBuf,
    pub file: Option<File>,
    pub pos: u64,
    pub remaining: u64,
    pub keep_alive: SendfileKeepAlive,
}

/// The mutable half of a connection: socket, TLS session and the two
/// application buffers. Guarded by a mutex that is effectively
/// uncontended, since the poller clears interest before dispatch and only
/// one worker owns a connection at a time.
pub struct ChannelIo {
    pub stream: Option<TcpStream>,
    pub tls: Option<TlsEngine>,
    pub read_buffer: ByteBuffer,
    pub write_buffer: ByteBuffer,
}

impl ChannelIo {
    /// True once the TLS handshake (if any) no longer stands between the
    /// socket and the protocol handler.
    #[inline]
    pub fn handshake_complete(&self) -> bool {
        match &self.tls {
            Some(engine) => !engine.is_handshaking(),
            None => true,
        }
    }
}

/// Per-connection wrapper. Created at accept, reset between keep-alive
/// requests, closed by the application, a timeout, or endpoint stop.
pub struct Channel {
    id: u64,
    token: Token,
    fd: RawFd,
    peer: SocketAddr,
    endpoint: Weak<EndpointShared>,
    self_ref: Weak<Channel>,

    io: Mutex<ChannelIo>,

    /// Interest ops the wrapper wants armed; the selector registration
    /// mirrors a subset of this.
    interest: AtomicU8,
    /// Ops a thread is parked on via the completion gates.
    gate_waits: AtomicU8,
    read_gate: Flag,
    write_gate: Flag,

    last_read: AtomicU64,
    last_write: AtomicU64,
    read_timeout: AtomicU64,
    write_timeout: AtomicU64,

    keep_alive_left: AtomicI32,
    error: Mutex<Option<SocketError>>,
    closed: AtomicBool,

    sendfile: Mutex<Option<SendfileData>>,

    log: logging::Logger,
}

impl Channel {
    pub fn open(
        endpoint: &Arc<EndpointShared>,
        token: Token,
        stream: TcpStream,
        tls: Option<TlsEngine>,
        read_buffer: ByteBuffer,
        write_buffer: ByteBuffer,
    ) -> Arc<Channel> {
        let now = endpoint.clock.millis();
        let config = &endpoint.config;
        let fd = stream.as_raw_fd();
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("Static address parses"));

        let channel = Arc::new_cyclic(|self_ref| Channel {
            id: token.0 as u64,
            token,
            fd,
            peer,
            endpoint: Arc::downgrade(endpoint),
            self_ref: self_ref.clone(),
            io: Mutex::new(ChannelIo {
                stream: Some(stream),
                tls,
                read_buffer,
                write_buffer,
            }),
            interest: AtomicU8::new(0),
            gate_waits: AtomicU8::new(0),
            read_gate: Flag::new(),
            write_gate: Flag::new(),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            read_timeout: AtomicU64::new(config.connection_timeout_ms),
            write_timeout: AtomicU64::new(config.connection_timeout_ms),
            keep_alive_left: AtomicI32::new(config.max_keep_alive_requests),
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
            sendfile: Mutex::new(None),
            log: endpoint.log.new(logging::o!("channel" => token.0)),
        });

        logging::debug!(channel.log, "channel opened"; "peer" => %peer);

        channel
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }

    /// Non-owning backref to the endpoint; None once it is gone.
    #[inline]
    pub fn endpoint(&self) -> Option<Arc<EndpointShared>> {
        self.endpoint.upgrade()
    }

    #[inline]
    pub fn io(&self) -> MutexGuard<'_, ChannelIo> {
        self.io.lock().expect("Channel io lock poisoned")
    }

    #[inline]
    pub fn sendfile(&self) -> MutexGuard<'_, Option<SendfileData>> {
        self.sendfile.lock().expect("Channel sendfile lock poisoned")
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---- interest ops ----------------------------------------------------

    #[inline]
    pub fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_interest(&self, ops: u8) {
        self.interest.store(ops, Ordering::Release);
    }

    #[inline]
    pub fn or_interest(&self, ops: u8) -> u8 {
        self.interest.fetch_or(ops, Ordering::AcqRel) | ops
    }

    #[inline]
    pub fn clear_interest(&self, ops: u8) -> u8 {
        self.interest.fetch_and(!ops, Ordering::AcqRel) & !ops
    }

    // ---- timeout accounting ----------------------------------------------

    #[inline]
    pub fn touch_read(&self, now: u64) {
        self.last_read.fetch_max(now, Ordering::AcqRel);
    }

    #[inline]
    pub fn touch_write(&self, now: u64) {
        self.last_write.fetch_max(now, Ordering::AcqRel);
    }

    #[inline]
    pub fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_write(&self) -> u64 {
        self.last_write.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_timeout(&self) -> u64 {
        self.read_timeout.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_read_timeout(&self, millis: u64) {
        self.read_timeout.store(millis, Ordering::Release);
    }

    #[inline]
    pub fn write_timeout(&self) -> u64 {
        self.write_timeout.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_write_timeout(&self, millis: u64) {
        self.write_timeout.store(millis, Ordering::Release);
    }

    /// Decrements the keep-alive budget; returns the remaining count.
    /// Negative configured budgets mean unlimited and stay negative.
    #[inline]
    pub fn consume_keep_alive(&self) -> i32 {
        let left = self.keep_alive_left.load(Ordering::Acquire);
        if left < 0 {
            return left;
        }
        self.keep_alive_left.fetch_sub(1, Ordering::AcqRel) - 1
    }

    // ---- error slot ------------------------------------------------------

    pub fn set_error(&self, error: SocketError) {
        let mut slot = self.error.lock().expect("Channel error lock poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn error(&self) -> Option<SocketError> {
        *self.error.lock().expect("Channel error lock poisoned")
    }

    // ---- I/O -------------------------------------------------------------

    /// Reads once into the read buffer. Returns the byte count; `Wait`
    /// when the socket has nothing (non-blocking), `Eof` on peer close.
    /// With `block` set, parks on the selector pool up to the read
    /// timeout.
    pub fn fill(&self, io: &mut ChannelIo, block: bool) -> SocketResult<usize> {
        if let Some(error) = self.error() {
            return Err(error);
        }

        let deadline = self.deadline(self.read_timeout());

        loop {
            match Self::fill_once(io) {
                Ok(count) => {
                    if let Some(endpoint) = self.endpoint.upgrade() {
                        self.touch_read(endpoint.clock.millis());
                    }
                    return Ok(count);
                }
                Err(SocketError::Wait) if block => {
                    self.block_on(OP_READ, deadline)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn fill_once(io: &mut ChannelIo) -> SocketResult<usize> {
        let ChannelIo {
            stream,
            tls,
            read_buffer,
            ..
        } = io;

        let stream = stream.as_mut().ok_or(SocketError::Eof)?;

        if read_buffer.free_capacity() == 0 {
            return Err(SocketError::Io(std::io::ErrorKind::Other));
        }

        match tls {
            Some(engine) => {
                let count = engine.read(stream, read_buffer.write_slice())?;
                read_buffer.move_tail(count);
                if count == 0 {
                    return Err(SocketError::Wait);
                }
                Ok(count)
            }
            None => {
                let count = read_buffer.ingress(&mut *stream).map_err(SocketError::from)?;
                if count == 0 {
                    return Err(SocketError::Eof);
                }
                Ok(count)
            }
        }
    }

    /// Pushes the write buffer to the socket. Returns true once drained.
    /// With `block` set, parks up to the write timeout until it drains.
    pub fn flush(&self, io: &mut ChannelIo, block: bool) -> SocketResult<bool> {
        if let Some(error) = self.error() {
            return Err(error);
        }

        let deadline = self.deadline(self.write_timeout());

        loop {
            match Self::flush_once(io) {
                Ok(true) => {
                    if let Some(endpoint) = self.endpoint.upgrade() {
                        self.touch_write(endpoint.clock.millis());
                    }
                    return Ok(true);
                }
                Ok(false) => {
                    if let Some(endpoint) = self.endpoint.upgrade() {
                        self.touch_write(endpoint.clock.millis());
                    }
                    if !block {
                        return Ok(false);
                    }
                    self.block_on(OP_WRITE, deadline)?;
                }
                Err(SocketError::Wait) => {
                    if !block {
                        return Ok(false);
                    }
                    self.block_on(OP_WRITE, deadline)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn flush_once(io: &mut ChannelIo) -> SocketResult<bool> {
        let ChannelIo {
            stream,
            tls,
            write_buffer,
            ..
        } = io;

        let stream = stream.as_mut().ok_or(SocketError::Eof)?;

        match tls {
            Some(engine) => {
                while !write_buffer.is_empty() {
                    let count = engine.write(stream, write_buffer.read_slice())?;
                    write_buffer.move_head(count);
                    if count == 0 {
                        break;
                    }
                }

                if !write_buffer.is_empty() {
                    return Ok(false);
                }

                engine.flush(stream)
            }
            None => match write_buffer.egress(&mut *stream) {
                Ok(_) => Ok(write_buffer.is_empty()),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }

    fn deadline(&self, timeout: u64) -> Duration {
        if timeout == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_millis(timeout)
        }
    }

    /// Parks the calling worker until the socket is ready for `ops`.
    /// Prefers a pooled secondary selector; falls back to re-arming
    /// interest through the poller and waiting on the completion gate.
    fn block_on(&self, ops: u8, timeout: Duration) -> SocketResult<()> {
        if self.is_closed() {
            return Err(SocketError::Eof);
        }

        let endpoint = self.endpoint.upgrade().ok_or(SocketError::Eof)?;

        match endpoint.selector_pool.get().map_err(SocketError::from)? {
            Some(selector) => {
                let result = selector.wait(self.fd, ops, timeout);
                endpoint.selector_pool.put(selector);
                result
            }
            None => {
                let gate = if ops & OP_READ != 0 {
                    &self.read_gate
                } else {
                    &self.write_gate
                };

                gate.reset();
                self.gate_waits.fetch_or(ops, Ordering::AcqRel);

                let this = self.self_ref.upgrade().ok_or(SocketError::Eof)?;
                endpoint.poller().add_event(this, ops);

                if !gate.await_open(timeout) {
                    self.gate_waits.fetch_and(!ops, Ordering::AcqRel);
                    return Err(SocketError::Timeout);
                }

                if self.is_closed() {
                    return Err(SocketError::Eof);
                }

                Ok(())
            }
        }
    }

    /// Ops a thread is gate-parked on; consumed by the poller, which opens
    /// the gate instead of dispatching a worker.
    #[inline]
    pub fn gate_waits(&self) -> u8 {
        self.gate_waits.load(Ordering::Acquire)
    }

    /// Opens the completion gate for `ops` and clears the wait bits.
    pub fn open_gate(&self, ops: u8) {
        self.gate_waits.fetch_and(!ops, Ordering::AcqRel);
        if ops & OP_READ != 0 {
            self.read_gate.open();
        }
        if ops & OP_WRITE != 0 {
            self.write_gate.open();
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Resets per-request state between keep-alive requests. The wrapper
    /// instance itself stays bound to the connection.
    pub fn next_request(&self, io: &mut ChannelIo) {
        io.read_buffer.compact();
        io.write_buffer.clear();

        if let Some(endpoint) = self.endpoint.upgrade() {
            self.set_read_timeout(endpoint.config.keep_alive_timeout());
        }
    }

    /// Closes the connection and releases every resource attached to it.
    /// Idempotent; safe to call from any thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let endpoint = self.endpoint.upgrade();

        {
            let mut io = self.io();

            // Best-effort close-notify before the socket goes away.
            let ChannelIo { stream, tls, .. } = &mut *io;
            if let (Some(engine), Some(sock)) = (tls.as_mut(), stream.as_mut()) {
                engine.start_close();
                let _ = engine.flush(sock);
            }

            if let Some(stream) = io.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }

            io.tls = None;

            if let Some(endpoint) = &endpoint {
                let mut read_buffer = std::mem::replace(&mut io.read_buffer, ByteBuffer::new(0));
                let mut write_buffer = std::mem::replace(&mut io.write_buffer, ByteBuffer::new(0));
                read_buffer.clear();
                write_buffer.clear();
                endpoint.release_buffers(read_buffer, write_buffer);
            }
        }

        *self.sendfile() = None;

        // Wake any thread parked on a completion gate so it observes the
        // closed state.
        self.open_gate(OP_READ | OP_WRITE);

        if let Some(endpoint) = endpoint {
            endpoint.connections.remove(&self.token.0);
            endpoint.connection_limit.count_down();

            if let Some(this) = self.self_ref.upgrade() {
                // Every close path funnels through here, so per-connection
                // protocol state is dropped no matter who initiated it.
                endpoint.handler().release(&this);
                endpoint.poller().add_event(this, OP_UNREGISTER);
            }

            logging::debug!(self.log, "channel closed";
                            "live" => endpoint.connections.len());
        } else {
            logging::debug!(self.log, "channel closed");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The stream, if still present, closes here; registration in any
        // epoll set dies with the fd.
        logging::trace!(self.log, "channel dropped"; "id" => self.id);
    }
}
