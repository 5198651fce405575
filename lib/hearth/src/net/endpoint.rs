use crate::config::EndpointConfig;
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState, LifecycleSupport};
use crate::net::acceptor::Acceptor;
use crate::net::buffer::ByteBuffer;
use crate::net::channel::Channel;
use crate::net::poller::{Poller, PollerHandle};
use crate::net::pool::SyncStack;
use crate::net::selector_pool::SelectorPool;
use crate::net::tls::{TlsContext, TlsError};
use crate::net::worker::{SocketHandler, WorkerPool};
use dashmap::DashMap;
use flue::logging;
use flue::sync::{CountDownLatch, Gate, LimitLatch};
use flue::time::Clock;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
pub enum EndpointError {
    Bind(io::ErrorKind, String),
    InheritedNotListening,
    Tls(TlsError),
    Address(String),
    Lifecycle(LifecycleError),
}

impl From<TlsError> for EndpointError {
    fn from(err: TlsError) -> Self {
        EndpointError::Tls(err)
    }
}

impl From<LifecycleError> for EndpointError {
    fn from(err: LifecycleError) -> Self {
        EndpointError::Lifecycle(err)
    }
}

/// State shared between the endpoint and its threads. Channels hold a
/// non-owning reference back to this.
pub struct EndpointShared {
    pub config: EndpointConfig,
    pub log: logging::Logger,
    pub clock: Clock,

    /// Live connections by token. Entries are added by the acceptor and
    /// removed by channel close.
    pub connections: DashMap<usize, Arc<Channel>>,
    pub connection_limit: LimitLatch,
    pub paused: Gate,
    pub selector_pool: SelectorPool,
    /// Set once during bind when TLS is enabled.
    pub tls: OnceLock<TlsContext>,
    pub next_token: AtomicUsize,

    running: AtomicBool,
    handler: Arc<dyn SocketHandler>,
    poller: Mutex<Option<Arc<PollerHandle>>>,
    workers: Mutex<Option<Arc<WorkerPool>>>,
    stop_latch: Mutex<Arc<CountDownLatch>>,
    buffer_cache: SyncStack<(ByteBuffer, ByteBuffer)>,
}

impl EndpointShared {
    #[inline]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn poller(&self) -> Arc<PollerHandle> {
        self.poller
            .lock()
            .expect("Endpoint poller lock poisoned")
            .as_ref()
            .expect("Poller not started")
            .clone()
    }

    pub fn workers(&self) -> Arc<WorkerPool> {
        self.workers
            .lock()
            .expect("Endpoint worker lock poisoned")
            .as_ref()
            .expect("Worker pool not started")
            .clone()
    }

    #[inline]
    pub fn handler(&self) -> &Arc<dyn SocketHandler> {
        &self.handler
    }

    pub fn stop_latch(&self) -> Arc<CountDownLatch> {
        self.stop_latch
            .lock()
            .expect("Endpoint latch lock poisoned")
            .clone()
    }

    /// Buffer pair for a new channel, from the pool or freshly sized.
    pub fn take_buffers(&self) -> (ByteBuffer, ByteBuffer) {
        self.buffer_cache.pop().unwrap_or_else(|| {
            (
                ByteBuffer::new(self.config.max_http_header_size + self.config.app_read_buf_size),
                ByteBuffer::new(self.config.app_write_buf_size),
            )
        })
    }

    pub fn release_buffers(&self, read: ByteBuffer, write: ByteBuffer) {
        self.buffer_cache.push((read, write));
    }
}

/// The connection-handling endpoint: one acceptor thread, one poller
/// thread, a bounded worker pool, and the pools and latches that tie
/// their resource accounting together.
pub struct Endpoint {
    shared: Arc<EndpointShared>,
    lifecycle: LifecycleSupport,
    listener: Mutex<Option<TcpListener>>,
    acceptor_thread: Mutex<Option<JoinHandle<()>>>,
    poller_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    log: logging::Logger,
}

impl Endpoint {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: EndpointConfig,
        handler: Arc<dyn SocketHandler>,
        log: L,
    ) -> Endpoint {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "endpoint")),
            None => logging::null_logger(),
        };

        let shared = Arc::new(EndpointShared {
            connection_limit: LimitLatch::new(config.max_connections),
            selector_pool: SelectorPool::new(config.selector_pool_size),
            buffer_cache: SyncStack::new(config.buffer_pool),
            connections: DashMap::new(),
            paused: Gate::new(true),
            clock: Clock::new(),
            tls: OnceLock::new(),
            next_token: AtomicUsize::new(1),
            running: AtomicBool::new(false),
            handler,
            poller: Mutex::new(None),
            workers: Mutex::new(None),
            stop_latch: Mutex::new(Arc::new(CountDownLatch::new(0))),
            log: log.clone(),
            config,
        });

        Endpoint {
            shared,
            lifecycle: LifecycleSupport::new(),
            listener: Mutex::new(None),
            acceptor_thread: Mutex::new(None),
            poller_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
            log,
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    /// The bound address; useful when the port was configured as 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("Endpoint addr lock poisoned")
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Binds (or adopts) the listening socket and builds the TLS context.
    /// Fatal failures here leave the endpoint FAILED.
    pub fn bind(&self) -> Result<(), EndpointError> {
        let config = &self.shared.config;

        if config.ssl_enabled {
            let ssl = config.ssl.as_ref().ok_or_else(|| {
                EndpointError::Address("ssl_enabled without an [ssl] section".to_string())
            })?;

            let context = TlsContext::from_config(ssl)?;
            let _ = self.shared.tls.set(context);
        }

        let listener = if config.inherit_listener {
            adopt_inherited_listener()?
        } else {
            bind_listener(config)?
        };

        listener
            .set_nonblocking(true)
            .map_err(|err| EndpointError::Bind(err.kind(), "set_nonblocking".to_string()))?;

        *self.local_addr.lock().expect("Endpoint addr lock poisoned") = listener.local_addr().ok();
        *self.listener.lock().expect("Endpoint listener lock poisoned") = Some(listener);

        logging::info!(self.log, "endpoint bound";
                       "address" => ?self.local_addr());

        Ok(())
    }

    fn spawn_threads(&self) -> Result<(), EndpointError> {
        let shared = &self.shared;

        *shared
            .stop_latch
            .lock()
            .expect("Endpoint latch lock poisoned") = Arc::new(CountDownLatch::new(1));

        let (mut poller, handle) = Poller::new(Arc::clone(shared))
            .map_err(|err| EndpointError::Bind(err.kind(), "selector".to_string()))?;

        *shared.poller.lock().expect("Endpoint poller lock poisoned") = Some(handle);

        let workers = Arc::new(WorkerPool::start(shared));
        *shared.workers.lock().expect("Endpoint worker lock poisoned") = Some(workers);

        shared.running.store(true, Ordering::Release);
        shared.paused.open();

        let poller_handle = std::thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || poller.run())
            .map_err(|err| EndpointError::Bind(err.kind(), "poller thread".to_string()))?;

        *self
            .poller_thread
            .lock()
            .expect("Endpoint thread lock poisoned") = Some(poller_handle);

        let listener = self
            .listener
            .lock()
            .expect("Endpoint listener lock poisoned")
            .as_ref()
            .expect("Endpoint must be bound before start")
            .try_clone()
            .map_err(|err| EndpointError::Bind(err.kind(), "listener clone".to_string()))?;

        let acceptor = Acceptor::new(Arc::clone(shared), listener);
        let acceptor_handle = std::thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(|err| EndpointError::Bind(err.kind(), "acceptor thread".to_string()))?;

        *self
            .acceptor_thread
            .lock()
            .expect("Endpoint thread lock poisoned") = Some(acceptor_handle);

        Ok(())
    }

    /// Suspends accepting; established connections continue to be served.
    pub fn pause(&self) {
        logging::info!(self.log, "endpoint paused");
        self.shared.paused.close();
    }

    pub fn resume(&self) {
        logging::info!(self.log, "endpoint resumed");
        self.shared.paused.open();
    }

    pub fn is_paused(&self) -> bool {
        !self.shared.paused.is_open()
    }

    fn halt(&self) {
        let shared = &self.shared;

        shared.running.store(false, Ordering::Release);
        // Unblock an acceptor stuck on a full endpoint or a closed gate.
        shared.connection_limit.release_all();
        shared.paused.open();

        let stop_latch = shared.stop_latch();
        shared.poller().request_close();

        let bound = Duration::from_millis(
            shared.config.selector_timeout_ms + shared.config.stop_latch_grace_ms,
        );
        if !stop_latch.await_timeout(bound) {
            logging::warn!(self.log, "poller stop latch timed out"; "bound_ms" => bound.as_millis() as u64);
        }

        shared.handler.stop();
        shared.workers().stop();

        if let Some(handle) = self
            .poller_thread
            .lock()
            .expect("Endpoint thread lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        if let Some(handle) = self
            .acceptor_thread
            .lock()
            .expect("Endpoint thread lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        // Whatever survived the poller teardown is forced closed here.
        let leftovers: Vec<Arc<Channel>> = shared
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in leftovers {
            channel.close();
        }

        shared.buffer_cache.clear();
        shared.selector_pool.close();

        logging::info!(self.log, "endpoint stopped";
                       "connections" => shared.connections.len());
    }
}

impl Lifecycle for Endpoint {
    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn init(&self) -> Result<(), LifecycleError> {
        if let Err(err) = self.bind() {
            self.lifecycle.fail();
            return Err(LifecycleError::Failed(format!("{:?}", err)));
        }

        self.lifecycle.advance(LifecycleState::Initialized)
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::StartingPrep)?;
        self.lifecycle.advance(LifecycleState::Starting)?;

        if let Err(err) = self.spawn_threads() {
            self.lifecycle.fail();
            return Err(LifecycleError::Failed(format!("{:?}", err)));
        }

        self.lifecycle.advance(LifecycleState::Started)
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::StoppingPrep)?;
        self.lifecycle.advance(LifecycleState::Stopping)?;

        self.halt();

        self.lifecycle.advance(LifecycleState::Stopped)
    }

    fn destroy(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::Destroying)?;

        *self.listener.lock().expect("Endpoint listener lock poisoned") = None;

        self.lifecycle.advance(LifecycleState::Destroyed)
    }
}

fn bind_listener(config: &EndpointConfig) -> Result<TcpListener, EndpointError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr: SocketAddr = format!("{}:{}", config.address, config.port)
        .parse()
        .map_err(|_| EndpointError::Address(format!("{}:{}", config.address, config.port)))?;

    let bind = || -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(config.so_reuse_address)?;
        socket.bind(&addr.into())?;
        socket.listen(config.accept_count as i32)?;
        Ok(socket.into())
    };

    bind().map_err(|err| EndpointError::Bind(err.kind(), addr.to_string()))
}

/// Adopts a pre-bound listening socket on fd 3 (LISTEN_FDS convention).
/// Refuses anything that is not a listening stream socket.
fn adopt_inherited_listener() -> Result<TcpListener, EndpointError> {
    const INHERITED_FD: RawFd = 3;

    let sock_type = getsockopt_int(INHERITED_FD, libc::SO_TYPE)
        .map_err(|err| EndpointError::Bind(err.kind(), "inherited fd".to_string()))?;

    if sock_type != libc::SOCK_STREAM {
        return Err(EndpointError::InheritedNotListening);
    }

    let accepting = getsockopt_int(INHERITED_FD, libc::SO_ACCEPTCONN)
        .map_err(|err| EndpointError::Bind(err.kind(), "inherited fd".to_string()))?;

    if accepting == 0 {
        return Err(EndpointError::InheritedNotListening);
    }

    Ok(unsafe { TcpListener::from_raw_fd(INHERITED_FD) })
}

fn getsockopt_int(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(value)
}