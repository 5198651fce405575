use crate::net::channel::{Channel, ChannelIo};
use crate::net::endpoint::EndpointShared;
use crate::net::pool::SyncStack;
use crate::net::support::{SocketEvent, SocketState, OP_READ, OP_WRITE};
use crate::net::tls::HandshakeStatus;
use crossbeam_channel::{Receiver, Sender};
use flue::logging;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Protocol entry point invoked from worker threads. Implementations keep
/// whatever per-connection state they need (the HTTP/1.1 handler keeps a
/// processor per token).
pub trait SocketHandler: Send + Sync {
    fn process(&self, channel: &Arc<Channel>, event: SocketEvent) -> SocketState;

    /// The connection is gone; drop per-connection state.
    fn release(&self, channel: &Arc<Channel>);

    /// Endpoint stop; drop caches.
    fn stop(&self);
}

/// Pooled task parameterized by (wrapper, event).
pub struct SocketProcessor {
    channel: Option<Arc<Channel>>,
    event: SocketEvent,
}

impl SocketProcessor {
    fn new() -> SocketProcessor {
        SocketProcessor {
            channel: None,
            event: SocketEvent::OpenRead,
        }
    }

    fn reset(&mut self) {
        self.channel = None;
        self.event = SocketEvent::OpenRead;
    }
}

enum WorkerMessage {
    Process(SocketProcessor),
    Shutdown,
}

/// Bounded set of worker threads consuming socket-processor tasks.
pub struct WorkerPool {
    tx: Sender<WorkerMessage>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    processor_cache: Arc<SyncStack<SocketProcessor>>,
    thread_count: usize,
}

impl WorkerPool {
    pub fn start(endpoint: &Arc<EndpointShared>) -> WorkerPool {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        let processor_cache = Arc::new(SyncStack::new(endpoint.config.processor_cache));
        let thread_count = endpoint.config.worker_threads.max(1);

        let mut threads = Vec::with_capacity(thread_count);

        for index in 0..thread_count {
            let rx = rx.clone();
            let endpoint = Arc::clone(endpoint);
            let cache = Arc::clone(&processor_cache);
            let log = endpoint.log.new(logging::o!("thread" => format!("worker-{}", index)));

            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || worker_loop(rx, endpoint, cache, log))
                .expect("Worker thread spawn failed");

            threads.push(handle);
        }

        WorkerPool {
            tx,
            threads: Mutex::new(threads),
            processor_cache,
            thread_count,
        }
    }

    /// Submits a task. False means the pool is no longer accepting work
    /// and the caller must cancel the key itself.
    pub fn dispatch(&self, channel: Arc<Channel>, event: SocketEvent) -> bool {
        let mut processor = self
            .processor_cache
            .pop()
            .unwrap_or_else(SocketProcessor::new);

        processor.channel = Some(channel);
        processor.event = event;

        self.tx.send(WorkerMessage::Process(processor)).is_ok()
    }

    /// Stops every worker and drains the caches.
    pub fn stop(&self) {
        for _ in 0..self.thread_count {
            let _ = self.tx.send(WorkerMessage::Shutdown);
        }

        let mut threads = self.threads.lock().expect("WorkerPool lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        self.processor_cache.clear();
    }
}

fn worker_loop(
    rx: Receiver<WorkerMessage>,
    endpoint: Arc<EndpointShared>,
    cache: Arc<SyncStack<SocketProcessor>>,
    log: logging::Logger,
) {
    while let Ok(message) = rx.recv() {
        let mut processor = match message {
            WorkerMessage::Process(processor) => processor,
            WorkerMessage::Shutdown => break,
        };

        if let Some(channel) = processor.channel.take() {
            let event = processor.event;

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                run_processor(&endpoint, &channel, event, &log)
            }));

            if outcome.is_err() {
                logging::error!(log, "processor panicked; closing connection";
                                "channel" => channel.token().0);
                endpoint.handler().release(&channel);
                channel.close();
            }
        }

        processor.reset();
        cache.push(processor);
    }
}

/// Runs one dispatched event against the connection: finish the TLS
/// handshake if one is pending, then hand the socket to the protocol
/// handler and act on the returned state.
fn run_processor(
    endpoint: &Arc<EndpointShared>,
    channel: &Arc<Channel>,
    event: SocketEvent,
    log: &logging::Logger,
) {
    if channel.is_closed() && event != SocketEvent::Stop {
        return;
    }

    // Error-ish events skip the handshake; the handler sees them even on
    // a half-open connection.
    let drives_handshake = matches!(event, SocketEvent::OpenRead | SocketEvent::OpenWrite);

    if drives_handshake {
        let status = {
            let mut io = channel.io();
            if io.handshake_complete() {
                HandshakeStatus::Complete
            } else {
                let ChannelIo { stream, tls, .. } = &mut *io;
                match (tls.as_mut(), stream.as_mut()) {
                    (Some(engine), Some(sock)) => engine.handshake(sock),
                    _ => HandshakeStatus::Failed,
                }
            }
        };

        match status {
            HandshakeStatus::Complete => {}
            HandshakeStatus::NeedRead => {
                endpoint.poller().add_event(Arc::clone(channel), OP_READ);
                return;
            }
            HandshakeStatus::NeedWrite => {
                endpoint.poller().add_event(Arc::clone(channel), OP_WRITE);
                return;
            }
            HandshakeStatus::Failed => {
                logging::debug!(log, "tls handshake failed";
                                "channel" => channel.token().0);
                run_processor(endpoint, channel, SocketEvent::ConnectFail, log);
                return;
            }
        }
    }

    let state = endpoint.handler().process(channel, event);

    match state {
        SocketState::Open => {
            // Keep-alive: hand the channel back to the poller for the
            // next request.
            endpoint.poller().add_event(Arc::clone(channel), OP_READ);
        }
        SocketState::Long | SocketState::AsyncEnd | SocketState::Suspended => {
            // Left deregistered; the protocol re-registers when it needs
            // more I/O.
        }
        SocketState::Sendfile => {
            endpoint.poller().add_event(Arc::clone(channel), OP_WRITE);
        }
        SocketState::Upgrading | SocketState::Upgraded => {
            // Only the HTTP/2 preface is recognized; with no upgrade
            // handler installed the connection ends here.
            logging::debug!(log, "protocol upgrade requested; no upgrade handler";
                            "channel" => channel.token().0);
            endpoint.handler().release(channel);
            channel.close();
        }
        SocketState::Closed => {
            endpoint.handler().release(channel);
            channel.close();
        }
    }
}
