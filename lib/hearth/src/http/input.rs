//! Incremental request-line and header parsing over the connection's read
//! buffer. Every state lives in plain fields indexed by a phase value, so
//! resuming after a short read is just re-entering the function; no byte
//! is ever discarded until the headers are committed.

use crate::http::request::Request;
use crate::net::buffer::ByteBuffer;
use crate::net::support::{ParseError, ParseResult, SocketError, SocketResult};

/// The 24-byte HTTP/2 client connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const SP: u8 = b' ';
const HT: u8 = b'\t';

/// What the parser reads from. Production wraps the channel; tests feed
/// canned bytes.
pub trait InputChannel {
    fn buffer(&mut self) -> &mut ByteBuffer;

    /// One read into the buffer's free space. `Wait` when a non-blocking
    /// socket has nothing.
    fn fill_buffer(&mut self, block: bool) -> SocketResult<usize>;

    fn set_read_timeout(&mut self, millis: u64);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderParseStatus {
    HaveMoreHeaders,
    NeedMoreData,
    Done,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HeaderParseState {
    Start,
    Name,
    ValueStart,
    Value,
    MultiLine,
    SkipLine,
}

/// Cursor state for the header currently being assembled.
#[derive(Debug, Default, Copy, Clone)]
struct HeaderData {
    name_start: usize,
    name_end: usize,
    /// First byte of the value; MAX until the first significant byte.
    start: usize,
    /// In-place compaction cursor for the value bytes.
    real_pos: usize,
    /// One past the last non-whitespace value byte.
    last_significant: usize,
}

pub struct InputBuffer {
    header_size_limit: usize,
    reject_illegal_header: bool,

    pub parsing_request_line: bool,
    phase: i8,
    start_pos: usize,
    question_pos: Option<usize>,
    prev_chr: u8,
    chr: u8,

    pub parsing_header: bool,
    header_state: HeaderParseState,
    header: HeaderData,

    /// First body byte once the headers are done.
    end: usize,
}

impl InputBuffer {
    pub fn new(header_size_limit: usize, reject_illegal_header: bool) -> InputBuffer {
        InputBuffer {
            header_size_limit,
            reject_illegal_header,
            parsing_request_line: true,
            phase: 0,
            start_pos: 0,
            question_pos: None,
            prev_chr: 0,
            chr: 0,
            parsing_header: false,
            header_state: HeaderParseState::Start,
            header: HeaderData::default(),
            end: 0,
        }
    }

    /// The phase of the request-line machine; -1 after an HTTP/2 preface
    /// match.
    #[inline]
    pub fn phase(&self) -> i8 {
        self.phase
    }

    /// First body byte; valid once `parse_headers` returned true.
    #[inline]
    pub fn body_start(&self) -> usize {
        self.end
    }

    /// Resets the machine for the next request on the same connection.
    /// The caller has compacted the buffer, so indexing restarts at its
    /// current head.
    pub fn next_request(&mut self, buffer: &ByteBuffer) {
        self.parsing_request_line = true;
        self.phase = 0;
        self.start_pos = buffer.head();
        self.question_pos = None;
        self.prev_chr = 0;
        self.chr = 0;
        self.parsing_header = false;
        self.header_state = HeaderParseState::Start;
        self.header = HeaderData::default();
        self.end = 0;
    }

    // ---- request line ----------------------------------------------------

    /// Parses the request line as far as the available bytes allow.
    /// Returns false when more data is needed; with phase -1 that means
    /// an HTTP/2 preface was recognized and the caller should switch
    /// protocols.
    pub fn parse_request_line(
        &mut self,
        request: &mut Request,
        io: &mut dyn InputChannel,
        kept_alive: bool,
        connection_timeout: u64,
        keep_alive_timeout: u64,
    ) -> ParseResult<bool> {
        if !self.parsing_request_line {
            return Ok(true);
        }

        loop {
            match self.phase {
                0 => {
                    // Skip blank CR/LF lines ahead of the request line.
                    if kept_alive {
                        io.set_read_timeout(keep_alive_timeout);
                    }

                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        if byte == CR || byte == LF {
                            continue;
                        }

                        io.buffer().unread(1);
                        self.start_pos = io.buffer().head();
                        self.prev_chr = 0;
                        self.chr = 0;
                        // First request byte: the in-flight timeout takes
                        // over from the keep-alive timeout.
                        io.set_read_timeout(connection_timeout);
                        self.phase = 1;
                        break;
                    }
                }
                1 => {
                    // HTTP/2 preface detection at byte 0 of a fresh
                    // connection; everything else drops straight through.
                    if kept_alive || self.start_pos != 0 {
                        self.phase = 2;
                        continue;
                    }

                    let buffer = io.buffer();
                    let available = buffer.tail().min(HTTP2_PREFACE.len());

                    if &buffer.filled()[..available] != &HTTP2_PREFACE[..available] {
                        self.phase = 2;
                        continue;
                    }

                    if available == HTTP2_PREFACE.len() {
                        self.phase = -1;
                        return Ok(false);
                    }

                    if !self.fill(io, false)? {
                        return Ok(false);
                    }
                }
                2 => {
                    // Method token.
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        if byte == SP || byte == HT {
                            let head = io.buffer().head();
                            request.method = self.take_str(io, self.start_pos, head - 1);
                            self.phase = 3;
                            break;
                        }

                        if !is_token_byte(byte) {
                            return Err(ParseError::InvalidMethod);
                        }
                    }
                }
                3 => {
                    // Whitespace between method and target.
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        if byte != SP && byte != HT {
                            io.buffer().unread(1);
                            self.start_pos = io.buffer().head();
                            self.question_pos = None;
                            self.prev_chr = 0;
                            self.phase = 4;
                            break;
                        }
                    }
                }
                4 => {
                    // Request target. LF (optionally preceded by CR) with
                    // no protocol is HTTP/0.9.
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        self.prev_chr = self.chr;
                        self.chr = byte;

                        if byte == LF {
                            let head = io.buffer().head();
                            let target_end = if self.prev_chr == CR { head - 2 } else { head - 1 };
                            self.commit_target(request, io, target_end)?;
                            request.protocol.clear();
                            self.phase = 7;
                            break;
                        }

                        if self.prev_chr == CR {
                            // CR inside the target must be CRLF.
                            return Err(ParseError::InvalidRequestTarget);
                        }

                        if byte == CR {
                            continue;
                        }

                        if byte == SP || byte == HT {
                            let head = io.buffer().head();
                            self.commit_target(request, io, head - 1)?;
                            self.phase = 5;
                            break;
                        }

                        if byte == b'?' && self.question_pos.is_none() {
                            self.question_pos = Some(io.buffer().head() - 1);
                            continue;
                        }

                        if byte < 0x20 || byte == 0x7f {
                            return Err(ParseError::InvalidRequestTarget);
                        }
                    }
                }
                5 => {
                    // Whitespace between target and protocol.
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        if byte != SP && byte != HT {
                            io.buffer().unread(1);
                            self.start_pos = io.buffer().head();
                            self.prev_chr = 0;
                            self.chr = 0;
                            self.phase = 6;
                            break;
                        }
                    }
                }
                6 => {
                    // Protocol token, CRLF terminated.
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(false),
                        };

                        self.prev_chr = self.chr;
                        self.chr = byte;

                        if byte == LF {
                            let head = io.buffer().head();
                            let protocol_end =
                                if self.prev_chr == CR { head - 2 } else { head - 1 };
                            let protocol = self.take_str(io, self.start_pos, protocol_end);

                            if protocol.is_empty() {
                                // Trailing whitespace then CRLF: HTTP/0.9.
                                request.protocol.clear();
                            } else if is_http_protocol(&protocol) {
                                request.protocol = protocol;
                            } else {
                                return Err(ParseError::InvalidProtocol);
                            }

                            self.phase = 7;
                            break;
                        }

                        if self.prev_chr == CR {
                            return Err(ParseError::InvalidProtocol);
                        }

                        if byte == CR {
                            continue;
                        }

                        if !is_protocol_byte(byte) {
                            return Err(ParseError::InvalidProtocol);
                        }
                    }
                }
                7 => {
                    // Complete; hand over to the header machine. An
                    // HTTP/0.9 request carries no headers at all.
                    self.parsing_request_line = false;
                    if request.protocol.is_empty() {
                        self.parsing_header = false;
                        self.end = io.buffer().head();
                    } else {
                        self.parsing_header = true;
                        self.header_state = HeaderParseState::Start;
                    }
                    self.prev_chr = 0;
                    self.chr = 0;
                    return Ok(true);
                }
                _ => return Ok(false),
            }
        }
    }

    fn commit_target(
        &mut self,
        request: &mut Request,
        io: &mut dyn InputChannel,
        target_end: usize,
    ) -> ParseResult<()> {
        if target_end <= self.start_pos {
            return Err(ParseError::InvalidRequestTarget);
        }

        match self.question_pos {
            Some(question) => {
                request.uri = self.take_str(io, self.start_pos, question);
                request.query = self.take_str(io, question + 1, target_end);
            }
            None => {
                request.uri = self.take_str(io, self.start_pos, target_end);
                request.query.clear();
            }
        }

        Ok(())
    }

    // ---- headers ---------------------------------------------------------

    /// Parses headers until the terminating blank line. Returns false
    /// when more data is needed.
    pub fn parse_headers(
        &mut self,
        request: &mut Request,
        io: &mut dyn InputChannel,
    ) -> ParseResult<bool> {
        while self.parsing_header {
            let status = self.parse_header(request, io)?;

            if status == HeaderParseStatus::NeedMoreData {
                return Ok(false);
            }

            // The budget covers everything consumed so far, terminator
            // included.
            if io.buffer().head() > self.header_size_limit {
                return Err(ParseError::HeaderTooLarge);
            }

            if status == HeaderParseStatus::Done {
                self.parsing_header = false;
                self.end = io.buffer().head();
            }
        }

        Ok(true)
    }

    fn parse_header(
        &mut self,
        request: &mut Request,
        io: &mut dyn InputChannel,
    ) -> ParseResult<HeaderParseStatus> {
        loop {
            match self.header_state {
                HeaderParseState::Start => {
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(HeaderParseStatus::NeedMoreData),
                        };

                        self.prev_chr = self.chr;
                        self.chr = byte;

                        if byte == CR && self.prev_chr != CR {
                            continue;
                        }

                        if byte == LF {
                            return Ok(HeaderParseStatus::Done);
                        }

                        // A stray CR steps back two bytes so the name
                        // machine sees it and routes the line to skip or
                        // reject.
                        if self.prev_chr == CR {
                            io.buffer().unread(2);
                        } else {
                            io.buffer().unread(1);
                        }

                        self.prev_chr = 0;
                        self.chr = 0;
                        self.header = HeaderData::default();
                        self.header.name_start = io.buffer().head();
                        self.header_state = HeaderParseState::Name;
                        break;
                    }
                }
                HeaderParseState::Name => {
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(HeaderParseStatus::NeedMoreData),
                        };

                        if byte == b':' {
                            self.header.name_end = io.buffer().head() - 1;
                            self.header.start = usize::MAX;
                            self.header_state = HeaderParseState::ValueStart;
                            break;
                        }

                        if !is_token_byte(byte) {
                            if self.reject_illegal_header {
                                return Err(ParseError::InvalidHeader);
                            }
                            self.header_state = HeaderParseState::SkipLine;
                            break;
                        }

                        // Lowercase in place for case-insensitive lookup.
                        if byte.is_ascii_uppercase() {
                            let head = io.buffer().head();
                            io.buffer().filled_mut()[head - 1] = byte + 32;
                        }
                    }
                }
                HeaderParseState::ValueStart => {
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(HeaderParseStatus::NeedMoreData),
                        };

                        if byte == SP || byte == HT {
                            continue;
                        }

                        io.buffer().unread(1);
                        self.prev_chr = 0;
                        self.chr = 0;
                        self.header_state = HeaderParseState::Value;
                        break;
                    }
                }
                HeaderParseState::Value => {
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(HeaderParseStatus::NeedMoreData),
                        };

                        if byte == CR {
                            continue;
                        }

                        if byte == LF {
                            self.header_state = HeaderParseState::MultiLine;
                            break;
                        }

                        if self.header.start == usize::MAX {
                            let head = io.buffer().head();
                            self.header.start = head - 1;
                            self.header.real_pos = head - 1;
                            self.header.last_significant = head - 1;
                        }

                        let real_pos = self.header.real_pos;
                        io.buffer().filled_mut()[real_pos] = byte;
                        self.header.real_pos += 1;

                        if byte != SP && byte != HT {
                            self.header.last_significant = self.header.real_pos;
                        }
                    }
                }
                HeaderParseState::MultiLine => {
                    // Peek one byte: SP/HT continues the value on a folded
                    // line, anything else commits the header.
                    let byte = match self.peek_byte(io)? {
                        Some(byte) => byte,
                        None => return Ok(HeaderParseStatus::NeedMoreData),
                    };

                    if byte == SP || byte == HT {
                        if self.header.start != usize::MAX {
                            // One folding space; trimmed again if the
                            // continuation turns out empty.
                            let real_pos = self.header.real_pos;
                            io.buffer().filled_mut()[real_pos] = SP;
                            self.header.real_pos += 1;
                        }
                        self.header_state = HeaderParseState::ValueStart;
                        continue;
                    }

                    self.commit_header(request, io);
                    self.header_state = HeaderParseState::Start;
                    self.prev_chr = 0;
                    self.chr = 0;
                    return Ok(HeaderParseStatus::HaveMoreHeaders);
                }
                HeaderParseState::SkipLine => {
                    loop {
                        let byte = match self.next_byte(io)? {
                            Some(byte) => byte,
                            None => return Ok(HeaderParseStatus::NeedMoreData),
                        };

                        if byte == LF {
                            self.header_state = HeaderParseState::Start;
                            self.prev_chr = 0;
                            self.chr = 0;
                            return Ok(HeaderParseStatus::HaveMoreHeaders);
                        }
                    }
                }
            }
        }
    }

    fn commit_header(&mut self, request: &mut Request, io: &mut dyn InputChannel) {
        let buffer = io.buffer();
        let name = buffer.filled()[self.header.name_start..self.header.name_end].to_vec();

        let value = if self.header.start == usize::MAX {
            Vec::new()
        } else {
            buffer.filled()[self.header.start..self.header.last_significant].to_vec()
        };

        request
            .headers
            .add(String::from_utf8_lossy(&name).into_owned(), value);
    }

    // ---- byte plumbing ---------------------------------------------------

    fn next_byte(&mut self, io: &mut dyn InputChannel) -> ParseResult<Option<u8>> {
        loop {
            if let Some(byte) = io.buffer().get() {
                return Ok(Some(byte));
            }

            if !self.fill(io, false)? {
                return Ok(None);
            }
        }
    }

    fn peek_byte(&mut self, io: &mut dyn InputChannel) -> ParseResult<Option<u8>> {
        loop {
            {
                let buffer = io.buffer();
                if buffer.len() > 0 {
                    return Ok(Some(buffer.read_slice()[0]));
                }
            }

            if !self.fill(io, false)? {
                return Ok(None);
            }
        }
    }

    /// Reads more bytes. Enforces the cumulative header budget: once the
    /// buffer has accumulated the limit and the parser still needs data,
    /// the request is over budget.
    pub fn fill(&mut self, io: &mut dyn InputChannel, block: bool) -> ParseResult<bool> {
        if (self.parsing_header || self.parsing_request_line)
            && io.buffer().tail() >= self.header_size_limit
        {
            return Err(ParseError::HeaderTooLarge);
        }

        match io.fill_buffer(block) {
            Ok(count) => Ok(count > 0),
            Err(SocketError::Wait) => Ok(false),
            Err(err) => Err(ParseError::Transport(err)),
        }
    }

    fn take_str(&self, io: &mut dyn InputChannel, from: usize, to: usize) -> String {
        String::from_utf8_lossy(&io.buffer().filled()[from..to]).into_owned()
    }
}

#[inline]
fn is_token_byte(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
        || byte.is_ascii_alphanumeric()
}

#[inline]
fn is_protocol_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'/' || byte == b'.'
}

/// "HTTP/" DIGIT "." DIGIT
fn is_http_protocol(protocol: &str) -> bool {
    let bytes = protocol.as_bytes();
    bytes.len() == 8
        && &bytes[..5] == b"HTTP/"
        && bytes[5].is_ascii_digit()
        && bytes[6] == b'.'
        && bytes[7].is_ascii_digit()
}
