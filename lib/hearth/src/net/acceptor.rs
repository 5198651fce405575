use crate::net::channel::Channel;
use crate::net::endpoint::EndpointShared;
use crate::net::support::OP_REGISTER;
use flue::logging;
use mio::Token;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// How long one listener readiness wait lasts; bounds how quickly the
/// acceptor notices stop and pause.
const ACCEPT_POLL_MS: i32 = 500;

/// Accepts new connections, applies socket options, binds a channel
/// wrapper and hands it to the poller. One instance per acceptor thread.
pub struct Acceptor {
    endpoint: Arc<EndpointShared>,
    listener: TcpListener,
    log: logging::Logger,
}

impl Acceptor {
    pub fn new(endpoint: Arc<EndpointShared>, listener: TcpListener) -> Acceptor {
        let log = endpoint.log.new(logging::o!("thread" => "acceptor"));

        Acceptor {
            endpoint,
            listener,
            log,
        }
    }

    pub fn run(&self) {
        logging::info!(self.log, "acceptor running";
                       "address" => ?self.listener.local_addr().ok());

        'outer: while self.endpoint.running() {
            // PAUSED parks the acceptor on the gate.
            if !self.endpoint.paused.is_open() {
                self.endpoint.paused.await_open(Duration::from_millis(500));
                continue;
            }

            // Admission control: one permit per live connection.
            if !self.endpoint.connection_limit.count_up_or_await() {
                // Latch released for shutdown.
                continue;
            }

            // Hold the permit while waiting for a connection, bounded so
            // stop and pause stay prompt.
            loop {
                if !self.endpoint.running() {
                    self.endpoint.connection_limit.count_down();
                    break 'outer;
                }

                if !self.endpoint.paused.is_open() {
                    self.endpoint.connection_limit.count_down();
                    continue 'outer;
                }

                match poll_readable(self.listener.as_raw_fd(), ACCEPT_POLL_MS) {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(err) => {
                        logging::warn!(self.log, "listener poll failed"; "error" => %err);
                        self.endpoint.connection_limit.count_down();
                        continue 'outer;
                    }
                }
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    logging::trace!(self.log, "connection accepted"; "peer" => %peer);

                    if !self.set_options(&stream) {
                        // Configuration failure closes the socket and
                        // releases the permit; counts never leak.
                        drop(stream);
                        self.endpoint.connection_limit.count_down();
                        continue;
                    }

                    if let Err(err) = self.register(stream) {
                        logging::warn!(self.log, "channel setup failed"; "error" => ?err);
                        self.endpoint.connection_limit.count_down();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.endpoint.connection_limit.count_down();
                }
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    self.endpoint.connection_limit.count_down();
                }
            }
        }

        logging::info!(self.log, "acceptor stopped");
    }

    /// Applies the configured socket options to an accepted stream.
    fn set_options(&self, stream: &TcpStream) -> bool {
        let config = &self.endpoint.config;

        let result: io::Result<()> = (|| {
            stream.set_nonblocking(true)?;

            let sock = socket2::SockRef::from(stream);
            sock.set_nodelay(config.tcp_no_delay)?;
            sock.set_keepalive(config.so_keep_alive)?;

            if config.so_linger_secs >= 0 {
                sock.set_linger(Some(Duration::from_secs(config.so_linger_secs as u64)))?;
            }

            if let Some(size) = config.rcv_buf_size {
                sock.set_recv_buffer_size(size)?;
            }

            if let Some(size) = config.snd_buf_size {
                sock.set_send_buffer_size(size)?;
            }

            Ok(())
        })();

        match result {
            Ok(()) => true,
            Err(err) => {
                logging::warn!(self.log, "socket option setup failed"; "error" => %err);
                false
            }
        }
    }

    /// Wraps the stream in a channel, records it in the connection map
    /// and enqueues a REGISTER event for the poller.
    fn register(&self, stream: TcpStream) -> Result<(), crate::net::tls::TlsError> {
        let endpoint = &self.endpoint;

        let tls = match endpoint.tls.get() {
            Some(context) => Some(context.new_engine()?),
            None => None,
        };

        let token = Token(endpoint.next_token.fetch_add(1, Ordering::AcqRel));
        let (read_buffer, write_buffer) = endpoint.take_buffers();

        let channel = Channel::open(endpoint, token, stream, tls, read_buffer, write_buffer);

        endpoint.connections.insert(token.0, Arc::clone(&channel));
        endpoint.poller().add_event(channel, OP_REGISTER);

        Ok(())
    }
}

/// Waits for the listener to become readable, up to `timeout_ms`.
fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(rc > 0)
}
