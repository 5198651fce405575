//! The NIO-style endpoint: acceptor, poller, worker dispatch, channel
//! wrappers and the pools that recycle them.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod endpoint;
pub mod poller;
pub mod pool;
pub mod selector_pool;
pub mod support;
pub mod tls;
pub mod worker;
