//! Connection-handling core of a servlet-style HTTP/1.1 application
//! server: an event-driven socket endpoint (acceptor, poller, worker
//! pool), a resumable HTTP/1.1 input parser, and a hierarchical container
//! pipeline the parsed requests are dispatched into.

pub mod config;
pub mod container;
pub mod http;
pub mod lifecycle;
pub mod net;
