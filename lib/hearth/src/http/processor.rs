//! The HTTP/1.1 protocol processor: drives the input parser against the
//! channel, pulls the body through the filter chain, dispatches into the
//! container pipeline and serializes the response. One processor per
//! connection, recycled through a bounded cache.

use crate::config::EndpointConfig;
use crate::container::Container;
use crate::http::filters::{BodyReader, FilterChain, FilterKind};
use crate::http::input::{InputBuffer, InputChannel};
use crate::http::request::{reason_phrase, Request, Response};
use crate::net::buffer::ByteBuffer;
use crate::net::channel::{Channel, ChannelIo, SendfileData, SendfileKeepAlive};
use crate::net::pool::SyncStack;
use crate::net::support::{
    ParseError, ParseResult, SocketError, SocketEvent, SocketResult, SocketState, OP_READ, OP_WRITE,
};
use crate::net::worker::SocketHandler;
use dashmap::DashMap;
use flue::logging;
use std::sync::Arc;

/// Parser/filter view of a locked channel.
struct ChannelInput<'a> {
    channel: &'a Arc<Channel>,
    io: &'a mut ChannelIo,
}

impl InputChannel for ChannelInput<'_> {
    fn buffer(&mut self) -> &mut ByteBuffer {
        &mut self.io.read_buffer
    }

    fn fill_buffer(&mut self, block: bool) -> SocketResult<usize> {
        self.channel.fill(self.io, block)
    }

    fn set_read_timeout(&mut self, millis: u64) {
        self.channel.set_read_timeout(millis);
    }
}

impl BodyReader for ChannelInput<'_> {
    fn read(&mut self, dst: &mut [u8]) -> ParseResult<usize> {
        loop {
            let buffered = self.io.read_buffer.drain_into(dst);
            if buffered > 0 {
                return Ok(buffered);
            }

            // Past the headers the absolute parse indices are dead, so a
            // drained buffer can be rewound to reclaim space.
            self.io.read_buffer.clear();

            // Body reads block through the selector pool.
            self.channel
                .fill(self.io, true)
                .map_err(ParseError::Transport)?;
        }
    }
}

pub struct Http11Processor {
    input: InputBuffer,
    filters: FilterChain,
    request: Request,
    response: Response,
    /// True once this connection has completed a request.
    kept_alive: bool,
}

impl Http11Processor {
    pub fn new(config: &EndpointConfig) -> Http11Processor {
        Http11Processor {
            input: InputBuffer::new(config.max_http_header_size, config.reject_illegal_header),
            filters: FilterChain::new(),
            request: Request::new(),
            response: Response::new(),
            kept_alive: false,
        }
    }

    /// Full reset so the processor can serve another connection.
    pub fn recycle(&mut self, config: &EndpointConfig) {
        self.input = InputBuffer::new(config.max_http_header_size, config.reject_illegal_header);
        self.filters.recycle();
        self.request.recycle();
        self.response.recycle();
        self.kept_alive = false;
    }

    pub fn process(
        &mut self,
        handler: &Http11ConnectionHandler,
        channel: &Arc<Channel>,
        event: SocketEvent,
    ) -> SocketState {
        match event {
            SocketEvent::OpenRead => self.service(handler, channel),
            SocketEvent::OpenWrite => self.flush_pending(channel),
            SocketEvent::Error | SocketEvent::Timeout => {
                logging::debug!(channel.log(), "connection errored";
                                "error" => ?channel.error());
                SocketState::Closed
            }
            SocketEvent::Disconnect | SocketEvent::Stop | SocketEvent::ConnectFail => {
                SocketState::Closed
            }
        }
    }

    /// OPEN_WRITE with no sendfile in flight: push out whatever is left.
    fn flush_pending(&mut self, channel: &Arc<Channel>) -> SocketState {
        let mut io = channel.io();

        match channel.flush(&mut io, false) {
            Ok(true) => SocketState::Open,
            Ok(false) => {
                drop(io);
                if let Some(endpoint) = channel.endpoint() {
                    endpoint.poller().add_event(Arc::clone(channel), OP_WRITE);
                }
                SocketState::Long
            }
            Err(_) => SocketState::Closed,
        }
    }

    fn service(&mut self, handler: &Http11ConnectionHandler, channel: &Arc<Channel>) -> SocketState {
        let config = &handler.config;
        let mut io = channel.io();

        loop {
            // Request line, resumable.
            {
                let mut input = ChannelInput { channel, io: &mut io };
                match self.input.parse_request_line(
                    &mut self.request,
                    &mut input,
                    self.kept_alive,
                    config.connection_timeout_ms,
                    config.keep_alive_timeout(),
                ) {
                    Ok(true) => {}
                    Ok(false) => {
                        if self.input.phase() == -1 {
                            return SocketState::Upgrading;
                        }
                        return self.park_for_read(channel);
                    }
                    Err(error) => return self.fail(channel, &mut io, error),
                }
            }

            // Headers, resumable.
            {
                let mut input = ChannelInput { channel, io: &mut io };
                match self.input.parse_headers(&mut self.request, &mut input) {
                    Ok(true) => {}
                    Ok(false) => return self.park_for_read(channel),
                    Err(error) => return self.fail(channel, &mut io, error),
                }
            }

            self.request.remote_addr = Some(channel.peer());

            // Wire the body filters from the headers.
            let status = match self.prepare_request(config) {
                Ok(()) => None,
                Err(status) => Some(status),
            };

            if let Some(status) = status {
                return self.fail_with_status(channel, &mut io, status);
            }

            // Pull the body through the filter chain before dispatch.
            if let Err(status) = self.read_body(channel, &mut io, config) {
                return self.fail_with_status(channel, &mut io, status);
            }

            // Keep-alive bookkeeping: protocol default, Connection
            // header, and the per-connection request budget.
            let mut keep_alive = self.request.wants_keep_alive();
            if channel.consume_keep_alive() == 0 {
                keep_alive = false;
            }

            // Container dispatch.
            if let Err(err) = handler.engine.invoke(&mut self.request, &mut self.response) {
                logging::warn!(channel.log(), "pipeline failure"; "error" => ?err);
                if !self.response.is_committed() {
                    self.response.recycle();
                    let _ = self.response.set_status(500);
                }
                keep_alive = false;
            }

            // Send-file handoff: write the head here, let the poller move
            // the file bytes.
            if let Some(plan) = self.response.take_sendfile_plan() {
                return self.start_sendfile(channel, &mut io, plan, keep_alive);
            }

            if self.write_response(channel, &mut io, keep_alive).is_err() {
                return SocketState::Closed;
            }

            // Drain whatever the handler left unread so the connection
            // can be reused.
            {
                let mut input = ChannelInput { channel, io: &mut io };
                if self
                    .filters
                    .end(&mut input, config.max_swallow_size)
                    .is_err()
                {
                    return SocketState::Closed;
                }
            }

            if !keep_alive {
                return SocketState::Closed;
            }

            // Reset for the next request on this connection.
            channel.next_request(&mut io);
            self.input.next_request(&io.read_buffer);
            self.request.recycle();
            self.response.recycle();
            self.filters.recycle();
            self.kept_alive = true;

            if io.read_buffer.is_empty() {
                return SocketState::Open;
            }
            // Pipelined request already buffered; keep going.
        }
    }

    /// More input needed: re-register READ and go LONG.
    fn park_for_read(&self, channel: &Arc<Channel>) -> SocketState {
        if let Some(endpoint) = channel.endpoint() {
            endpoint.poller().add_event(Arc::clone(channel), OP_READ);
        }
        SocketState::Long
    }

    /// Activates body filters from the parsed headers. Errors carry the
    /// status to answer with.
    fn prepare_request(&mut self, config: &EndpointConfig) -> Result<(), u16> {
        match self.request.protocol.as_str() {
            "HTTP/1.1" | "HTTP/1.0" | "" => {}
            _ => return Err(505),
        }

        if self.request.is_chunked() {
            self.filters.activate(FilterKind::Chunked);
            return Ok(());
        }

        match self.request.headers.get_str("content-length") {
            Some(raw) => {
                let length: u64 = raw.trim().parse().map_err(|_| 400u16)?;
                if length > config.max_post_size as u64 {
                    return Err(413);
                }
                if length > 0 {
                    self.filters.activate(FilterKind::Identity(length));
                } else {
                    self.filters.activate(FilterKind::Void);
                }
            }
            None => self.filters.activate(FilterKind::Void),
        }

        Ok(())
    }

    /// Buffers the whole body for the container, bounded by
    /// max_post_size.
    fn read_body(
        &mut self,
        channel: &Arc<Channel>,
        io: &mut ChannelIo,
        config: &EndpointConfig,
    ) -> Result<(), u16> {
        let mut scratch = [0u8; 8192];

        loop {
            let mut input = ChannelInput {
                channel,
                io: &mut *io,
            };
            match self.filters.read_body(&mut input, &mut scratch) {
                Ok(0) => return Ok(()),
                Ok(count) => {
                    if self.request.body.len() + count > config.max_post_size {
                        return Err(413);
                    }
                    self.request.body.extend_from_slice(&scratch[..count]);
                }
                Err(ParseError::Transport(SocketError::Timeout)) => return Err(408),
                Err(_) => return Err(400),
            }
        }
    }

    fn start_sendfile(
        &mut self,
        channel: &Arc<Channel>,
        io: &mut ChannelIo,
        plan: crate::http::request::SendfilePlan,
        keep_alive: bool,
    ) -> SocketState {
        let disposition = if !keep_alive {
            SendfileKeepAlive::None
        } else if !io.read_buffer.is_empty() {
            SendfileKeepAlive::Pipelined
        } else {
            SendfileKeepAlive::Open
        };

        // Head first, through the ordinary buffered path.
        if self
            .write_head(channel, io, keep_alive, plan.length)
            .is_err()
        {
            return SocketState::Closed;
        }
        self.response.commit();

        *channel.sendfile() = Some(SendfileData {
            path: plan.path,
            file: None,
            pos: plan.pos,
            remaining: plan.length,
            keep_alive: disposition,
        });

        // The poller owns the socket from here; prime the next request
        // state for the keep-alive dispositions.
        if keep_alive {
            channel.next_request(io);
            self.input.next_request(&io.read_buffer);
            self.request.recycle();
            self.response.recycle();
            self.filters.recycle();
            self.kept_alive = true;
        }

        SocketState::Sendfile
    }

    /// Serializes head + buffered body with a blocking flush.
    fn write_response(
        &mut self,
        channel: &Arc<Channel>,
        io: &mut ChannelIo,
        keep_alive: bool,
    ) -> SocketResult<()> {
        // HTTP/0.9: body only, then close.
        if self.request.protocol.is_empty() {
            let body = self.response.body().to_vec();
            buffer_write(channel, io, &body)?;
            channel.flush(io, true)?;
            self.response.commit();
            return Ok(());
        }

        let length = self.response.body_len() as u64;
        self.write_head(channel, io, keep_alive, length)?;

        let body = self.response.body().to_vec();
        buffer_write(channel, io, &body)?;
        channel.flush(io, true)?;
        self.response.commit();

        Ok(())
    }

    fn write_head(
        &mut self,
        channel: &Arc<Channel>,
        io: &mut ChannelIo,
        keep_alive: bool,
        content_length: u64,
    ) -> SocketResult<()> {
        let head = build_head(&self.response, keep_alive, content_length);
        buffer_write(channel, io, &head)?;
        channel.flush(io, true)?;
        Ok(())
    }

    /// Parse failure: answer with the mapped status and close. Transport
    /// EOF gets no response; nobody is listening.
    fn fail(&mut self, channel: &Arc<Channel>, io: &mut ChannelIo, error: ParseError) -> SocketState {
        match error {
            ParseError::Transport(SocketError::Eof) | ParseError::Transport(SocketError::Wait) => {
                SocketState::Closed
            }
            other => {
                logging::debug!(channel.log(), "request parse failed"; "error" => ?other);
                self.fail_with_status(channel, io, other.status())
            }
        }
    }

    fn fail_with_status(
        &mut self,
        channel: &Arc<Channel>,
        io: &mut ChannelIo,
        status: u16,
    ) -> SocketState {
        // The request may have died before the protocol was parsed;
        // error responses always go out as HTTP/1.1.
        self.request.protocol = "HTTP/1.1".to_string();

        self.response.recycle();
        let _ = self.response.set_status(status);
        let _ = self
            .response
            .write(format!("{} {}\n", status, reason_phrase(status)).as_bytes());

        // Best effort; the connection closes either way.
        let _ = self.write_response(channel, io, false);
        SocketState::Closed
    }
}

/// Copies bytes into the write buffer, flushing (blocking) whenever it
/// fills.
fn buffer_write(channel: &Arc<Channel>, io: &mut ChannelIo, mut data: &[u8]) -> SocketResult<()> {
    while !data.is_empty() {
        let free = io.write_buffer.free_capacity();

        if free == 0 {
            channel.flush(io, true)?;
            continue;
        }

        let count = free.min(data.len());
        io.write_buffer.put(&data[..count]);
        data = &data[count..];
    }

    Ok(())
}

/// Status line and headers. Content-Length and Connection are owned by
/// the processor; handler-set copies are dropped.
fn build_head(response: &Response, keep_alive: bool, content_length: u64) -> Vec<u8> {
    let status = response.status();
    let mut head = Vec::with_capacity(256);

    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.to_string().as_bytes());
    head.push(b' ');
    head.extend_from_slice(reason_phrase(status).as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in response.headers().iter() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value);
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"Content-Length: ");
    head.extend_from_slice(content_length.to_string().as_bytes());
    head.extend_from_slice(b"\r\n");

    if keep_alive {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// Protocol entry point registered with the endpoint: keeps one
/// processor per live connection plus a recycled cache.
pub struct Http11ConnectionHandler {
    engine: Arc<Container>,
    config: EndpointConfig,
    processors: DashMap<usize, Http11Processor>,
    recycled: SyncStack<Http11Processor>,
    log: logging::Logger,
}

impl Http11ConnectionHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        engine: Arc<Container>,
        config: EndpointConfig,
        log: L,
    ) -> Http11ConnectionHandler {
        let log = logging::child_of(log).new(logging::o!("component" => "http11"));

        Http11ConnectionHandler {
            engine,
            processors: DashMap::new(),
            recycled: SyncStack::new(config.processor_cache),
            config,
            log,
        }
    }
}

impl SocketHandler for Http11ConnectionHandler {
    fn process(&self, channel: &Arc<Channel>, event: SocketEvent) -> SocketState {
        let token = channel.token().0;

        // Take the processor out of the map for the duration of the
        // call; dispatch is serial per connection.
        let mut processor = self
            .processors
            .remove(&token)
            .map(|(_, processor)| processor)
            .or_else(|| self.recycled.pop())
            .unwrap_or_else(|| Http11Processor::new(&self.config));

        let state = processor.process(self, channel, event);

        match state {
            SocketState::Closed | SocketState::Upgrading | SocketState::Upgraded => {
                processor.recycle(&self.config);
                self.recycled.push(processor);
            }
            _ => {
                self.processors.insert(token, processor);
            }
        }

        logging::trace!(self.log, "processed"; "channel" => token, "state" => ?state);
        state
    }

    fn release(&self, channel: &Arc<Channel>) {
        if let Some((_, mut processor)) = self.processors.remove(&channel.token().0) {
            processor.recycle(&self.config);
            self.recycled.push(processor);
        }
    }

    fn stop(&self) {
        self.processors.clear();
        self.recycled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_shape() {
        let mut response = Response::new();
        response.set_status(200).unwrap();
        response.set_header("content-type", "text/plain").unwrap();

        let head = build_head(&response, true, 5);
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_head_close_and_owned_headers() {
        let mut response = Response::new();
        response.set_status(404).unwrap();
        // Handler-set copies of owned headers are dropped.
        response.set_header("content-length", "999").unwrap();
        response.set_header("connection", "keep-alive").unwrap();

        let head = build_head(&response, false, 9);
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!text.contains("999"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
