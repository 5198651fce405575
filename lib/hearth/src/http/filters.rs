//! Request body decoding as a chain of input filters. The active filters
//! stack bottom-up over the raw socket reader; callers always read from
//! the last active filter.

use crate::net::support::{ParseError, ParseResult, SocketError};
use std::io;

/// The layer a filter reads encoded bytes from: either the raw socket
/// reader or the next filter down the active chain. Reads block until at
/// least one byte is available.
pub trait BodyReader {
    fn read(&mut self, dst: &mut [u8]) -> ParseResult<usize>;
}

pub trait InputFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decoded body bytes into `dst`; Ok(0) is end of body.
    fn read_body(&mut self, lower: &mut dyn BodyReader, dst: &mut [u8]) -> ParseResult<usize>;

    /// Consumes whatever the request body still holds so the connection
    /// can be reused. Returns the swallowed byte count.
    fn end(&mut self, lower: &mut dyn BodyReader, max_swallow: usize) -> ParseResult<usize>;

    fn recycle(&mut self);
}

/// No body is expected; reads report an immediate end.
pub struct VoidFilter;

impl InputFilter for VoidFilter {
    fn name(&self) -> &'static str {
        "void"
    }

    fn read_body(&mut self, _lower: &mut dyn BodyReader, _dst: &mut [u8]) -> ParseResult<usize> {
        Ok(0)
    }

    fn end(&mut self, _lower: &mut dyn BodyReader, _max_swallow: usize) -> ParseResult<usize> {
        Ok(0)
    }

    fn recycle(&mut self) {}
}

/// Content-Length delimited body.
pub struct IdentityFilter {
    remaining: u64,
}

impl IdentityFilter {
    pub fn new() -> IdentityFilter {
        IdentityFilter { remaining: 0 }
    }
}

impl InputFilter for IdentityFilter {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn read_body(&mut self, lower: &mut dyn BodyReader, dst: &mut [u8]) -> ParseResult<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let want = dst.len().min(self.remaining as usize);
        let count = lower.read(&mut dst[..want])?;
        self.remaining -= count as u64;
        Ok(count)
    }

    fn end(&mut self, lower: &mut dyn BodyReader, max_swallow: usize) -> ParseResult<usize> {
        let mut swallowed = 0usize;
        let mut scratch = [0u8; 4096];

        while self.remaining > 0 {
            if swallowed >= max_swallow {
                return Err(ParseError::Transport(SocketError::Io(
                    io::ErrorKind::InvalidData,
                )));
            }

            let want = scratch.len().min(self.remaining as usize);
            let count = lower.read(&mut scratch[..want])?;
            self.remaining -= count as u64;
            swallowed += count;
        }

        Ok(swallowed)
    }

    fn recycle(&mut self) {
        self.remaining = 0;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ChunkState {
    Header,
    Data,
    DataCr,
    Trailer,
    End,
}

/// Transfer-Encoding: chunked. Trailing headers are swallowed.
pub struct ChunkedFilter {
    state: ChunkState,
    chunk_remaining: u64,
}

impl ChunkedFilter {
    pub fn new() -> ChunkedFilter {
        ChunkedFilter {
            state: ChunkState::Header,
            chunk_remaining: 0,
        }
    }

    fn next_byte(lower: &mut dyn BodyReader) -> ParseResult<u8> {
        let mut byte = [0u8; 1];
        let count = lower.read(&mut byte)?;
        if count == 0 {
            return Err(ParseError::Transport(SocketError::Eof));
        }
        Ok(byte[0])
    }

    fn bad_chunk() -> ParseError {
        ParseError::Transport(SocketError::Io(io::ErrorKind::InvalidData))
    }

    /// Parses "SIZE[;ext]CRLF". Leaves the size in chunk_remaining.
    fn parse_chunk_header(&mut self, lower: &mut dyn BodyReader) -> ParseResult<()> {
        let mut size: u64 = 0;
        let mut digits = 0usize;
        let mut in_extension = false;

        loop {
            let byte = Self::next_byte(lower)?;

            match byte {
                b'\r' => {
                    if Self::next_byte(lower)? != b'\n' {
                        return Err(Self::bad_chunk());
                    }
                    break;
                }
                b'\n' => break,
                b';' => in_extension = true,
                _ if in_extension => {}
                _ => {
                    let digit = match byte {
                        b'0'..=b'9' => byte - b'0',
                        b'a'..=b'f' => byte - b'a' + 10,
                        b'A'..=b'F' => byte - b'A' + 10,
                        _ => return Err(Self::bad_chunk()),
                    };

                    digits += 1;
                    if digits > 16 {
                        return Err(Self::bad_chunk());
                    }

                    size = (size << 4) | digit as u64;
                }
            }
        }

        if digits == 0 {
            return Err(Self::bad_chunk());
        }

        self.chunk_remaining = size;
        self.state = if size == 0 {
            ChunkState::Trailer
        } else {
            ChunkState::Data
        };

        Ok(())
    }

    /// Consumes trailer lines up to and including the blank terminator.
    fn swallow_trailers(&mut self, lower: &mut dyn BodyReader) -> ParseResult<()> {
        let mut line_len = 0usize;

        loop {
            let byte = Self::next_byte(lower)?;

            match byte {
                b'\n' => {
                    if line_len == 0 {
                        self.state = ChunkState::End;
                        return Ok(());
                    }
                    line_len = 0;
                }
                b'\r' => {}
                _ => line_len += 1,
            }
        }
    }
}

impl InputFilter for ChunkedFilter {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn read_body(&mut self, lower: &mut dyn BodyReader, dst: &mut [u8]) -> ParseResult<usize> {
        loop {
            match self.state {
                ChunkState::Header => self.parse_chunk_header(lower)?,
                ChunkState::Data => {
                    if self.chunk_remaining == 0 {
                        self.state = ChunkState::DataCr;
                        continue;
                    }

                    let want = dst.len().min(self.chunk_remaining as usize);
                    let count = lower.read(&mut dst[..want])?;
                    self.chunk_remaining -= count as u64;
                    return Ok(count);
                }
                ChunkState::DataCr => {
                    let byte = Self::next_byte(lower)?;
                    match byte {
                        b'\r' => {
                            if Self::next_byte(lower)? != b'\n' {
                                return Err(Self::bad_chunk());
                            }
                        }
                        b'\n' => {}
                        _ => return Err(Self::bad_chunk()),
                    }
                    self.state = ChunkState::Header;
                }
                ChunkState::Trailer => self.swallow_trailers(lower)?,
                ChunkState::End => return Ok(0),
            }
        }
    }

    fn end(&mut self, lower: &mut dyn BodyReader, max_swallow: usize) -> ParseResult<usize> {
        let mut swallowed = 0usize;
        let mut scratch = [0u8; 4096];

        while self.state != ChunkState::End {
            if swallowed >= max_swallow {
                return Err(ParseError::Transport(SocketError::Io(
                    io::ErrorKind::InvalidData,
                )));
            }

            let count = self.read_body(lower, &mut scratch)?;
            if count == 0 {
                break;
            }
            swallowed += count;
        }

        Ok(swallowed)
    }

    fn recycle(&mut self) {
        self.state = ChunkState::Header;
        self.chunk_remaining = 0;
    }
}

/// Which filter a request activates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FilterKind {
    Void,
    Identity(u64),
    Chunked,
}

const VOID: usize = 0;
const IDENTITY: usize = 1;
const CHUNKED: usize = 2;

/// The per-connection filter set with its active stack. Callers read
/// from the last active filter, which pulls through the ones below it.
pub struct FilterChain {
    filters: Vec<Option<Box<dyn InputFilter>>>,
    active: Vec<usize>,
}

impl FilterChain {
    pub fn new() -> FilterChain {
        FilterChain {
            filters: vec![
                Some(Box::new(VoidFilter)),
                Some(Box::new(IdentityFilter::new())),
                Some(Box::new(ChunkedFilter::new())),
            ],
            active: Vec::new(),
        }
    }

    /// Index of the last active filter, -1 when none are active.
    pub fn last_active(&self) -> isize {
        self.active.len() as isize - 1
    }

    pub fn activate(&mut self, kind: FilterKind) {
        match kind {
            FilterKind::Void => self.active.push(VOID),
            FilterKind::Identity(length) => {
                if let Some(filter) = &mut self.filters[IDENTITY] {
                    // Prime the content-length budget directly.
                    *filter = Box::new(IdentityFilter { remaining: length });
                }
                self.active.push(IDENTITY);
            }
            FilterKind::Chunked => {
                if let Some(filter) = &mut self.filters[CHUNKED] {
                    *filter = Box::new(ChunkedFilter::new());
                }
                self.active.push(CHUNKED);
            }
        }
    }

    /// Reads decoded body bytes through the active stack.
    pub fn read_body(&mut self, raw: &mut dyn BodyReader, dst: &mut [u8]) -> ParseResult<usize> {
        self.read_from(self.last_active(), raw, dst)
    }

    fn read_from(
        &mut self,
        level: isize,
        raw: &mut dyn BodyReader,
        dst: &mut [u8],
    ) -> ParseResult<usize> {
        if level < 0 {
            return raw.read(dst);
        }

        let slot = self.active[level as usize];
        let mut filter = self.filters[slot]
            .take()
            .expect("Input filter taken re-entrantly");

        let result = filter.read_body(
            &mut ChainLayer {
                chain: self,
                level: level - 1,
                raw,
            },
            dst,
        );

        self.filters[slot] = Some(filter);
        result
    }

    /// Finishes the request body on the last active filter.
    pub fn end(&mut self, raw: &mut dyn BodyReader, max_swallow: usize) -> ParseResult<usize> {
        let level = self.last_active();
        if level < 0 {
            return Ok(0);
        }

        let slot = self.active[level as usize];
        let mut filter = self.filters[slot]
            .take()
            .expect("Input filter taken re-entrantly");

        let result = filter.end(
            &mut ChainLayer {
                chain: self,
                level: level - 1,
                raw,
            },
            max_swallow,
        );

        self.filters[slot] = Some(filter);
        result
    }

    pub fn recycle(&mut self) {
        self.active.clear();
        for filter in self.filters.iter_mut().flatten() {
            filter.recycle();
        }
    }
}

struct ChainLayer<'a> {
    chain: &'a mut FilterChain,
    level: isize,
    raw: &'a mut dyn BodyReader,
}

impl BodyReader for ChainLayer<'_> {
    fn read(&mut self, dst: &mut [u8]) -> ParseResult<usize> {
        self.chain.read_from(self.level, self.raw, dst)
    }
}
