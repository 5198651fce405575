//! Strongly-typed configuration records. The endpoint accepts these as
//! plain values; the server binary deserializes them from TOML.

use serde_derive::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Bind address for the listener.
    pub address: String,
    pub port: u16,

    /// Listen backlog handed to the kernel; absorbs accept bursts while
    /// the connection-count latch is at its limit.
    pub accept_count: u32,
    /// Capacity of the connection-count latch.
    pub max_connections: usize,

    /// Read timeout once a request is in flight, milliseconds.
    pub connection_timeout_ms: u64,
    /// Idle timeout between keep-alive requests; -1 uses the connection
    /// timeout.
    pub keep_alive_timeout_ms: i64,
    /// Requests served per connection before it is closed; -1 is
    /// unlimited.
    pub max_keep_alive_requests: i32,

    /// Upper bound on the poller's blocking select, milliseconds.
    pub selector_timeout_ms: u64,
    /// Recorded only; there is no portable thread-priority control on
    /// this stack.
    pub poller_thread_priority: i32,
    /// Extra time granted to the poller stop latch beyond the selector
    /// timeout.
    pub stop_latch_grace_ms: u64,

    /// Bound of the socket-processor / protocol-processor caches.
    pub processor_cache: usize,
    /// Bound of the poller-event cache.
    pub event_cache: usize,
    /// Bound of the channel buffer-pair cache.
    pub buffer_pool: usize,

    pub app_read_buf_size: usize,
    pub app_write_buf_size: usize,
    /// Recorded only; all buffers are heap allocations here.
    pub direct_buffer: bool,

    /// Budget for request line + headers + leading blank lines.
    pub max_http_header_size: usize,
    /// Fail a request with an unparseable header instead of skipping the
    /// line.
    pub reject_illegal_header: bool,
    /// Largest request body buffered for the container.
    pub max_post_size: usize,
    /// Largest unread body remainder drained before keep-alive reuse.
    pub max_swallow_size: usize,

    pub worker_threads: usize,
    /// Cap on pooled blocking selectors.
    pub selector_pool_size: usize,

    /// Adopt a pre-bound listening socket on fd 3 instead of binding.
    pub inherit_listener: bool,

    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    /// Seconds; negative disables linger.
    pub so_linger_secs: i32,
    pub so_reuse_address: bool,
    pub rcv_buf_size: Option<usize>,
    pub snd_buf_size: Option<usize>,

    pub ssl_enabled: bool,
    pub ssl: Option<SslConfig>,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            address: "0.0.0.0".to_string(),
            port: 8080,
            accept_count: 100,
            max_connections: 8192,
            connection_timeout_ms: 60_000,
            keep_alive_timeout_ms: -1,
            max_keep_alive_requests: 100,
            selector_timeout_ms: 1000,
            poller_thread_priority: 5,
            stop_latch_grace_ms: 500,
            processor_cache: 200,
            event_cache: 500,
            buffer_pool: 500,
            app_read_buf_size: 8192,
            app_write_buf_size: 8192,
            direct_buffer: false,
            max_http_header_size: 8192,
            reject_illegal_header: true,
            max_post_size: 2 * 1024 * 1024,
            max_swallow_size: 2 * 1024 * 1024,
            worker_threads: 16,
            selector_pool_size: 32,
            inherit_listener: false,
            tcp_no_delay: true,
            so_keep_alive: false,
            so_linger_secs: -1,
            so_reuse_address: true,
            rcv_buf_size: None,
            snd_buf_size: None,
            ssl_enabled: false,
            ssl: None,
        }
    }
}

impl EndpointConfig {
    /// The effective keep-alive idle timeout.
    #[inline]
    pub fn keep_alive_timeout(&self) -> u64 {
        if self.keep_alive_timeout_ms < 0 {
            self.connection_timeout_ms
        } else {
            self.keep_alive_timeout_ms as u64
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SslConfig {
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
    /// Accepted for config compatibility; encrypted PEM keys are not
    /// supported and a set password fails TLS init.
    #[serde(default)]
    pub key_password: Option<String>,
    /// Enabled protocol versions, e.g. ["TLSv1.2", "TLSv1.3"]. Empty
    /// enables both.
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub client_auth: ClientAuth,
    /// Trust roots for client certificates.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    Required,
}
