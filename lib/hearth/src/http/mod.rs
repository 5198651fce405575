//! HTTP/1.1 wire handling: the resumable input parser, the request body
//! filter chain, and the per-connection processor that drives parsed
//! requests into the container pipeline.

pub mod filters;
pub mod input;
pub mod processor;
pub mod request;

#[cfg(test)]
pub(crate) mod testing {
    use crate::net::buffer::ByteBuffer;
    use crate::net::support::{SocketError, SocketResult};
    use std::cmp::min;

    use super::input::InputChannel;

    /// Feeds canned bytes in configurable chunk sizes; `chunk == 1`
    /// exercises byte-at-a-time resumption.
    pub struct MockInput {
        data: Vec<u8>,
        served: usize,
        chunk: usize,
        pub buffer: ByteBuffer,
        pub read_timeout: u64,
        pub eof_when_drained: bool,
    }

    impl MockInput {
        pub fn new(data: &[u8], chunk: usize, capacity: usize) -> MockInput {
            MockInput {
                data: data.to_vec(),
                served: 0,
                chunk,
                buffer: ByteBuffer::new(capacity),
                read_timeout: 0,
                eof_when_drained: false,
            }
        }
    }

    impl InputChannel for MockInput {
        fn buffer(&mut self) -> &mut ByteBuffer {
            &mut self.buffer
        }

        fn fill_buffer(&mut self, _block: bool) -> SocketResult<usize> {
            if self.served == self.data.len() {
                if self.eof_when_drained {
                    return Err(SocketError::Eof);
                }
                return Err(SocketError::Wait);
            }

            let count = min(
                min(self.chunk, self.data.len() - self.served),
                self.buffer.free_capacity(),
            );

            if count == 0 {
                return Err(SocketError::Wait);
            }

            self.buffer
                .put(&self.data[self.served..self.served + count]);
            self.served += count;
            Ok(count)
        }

        fn set_read_timeout(&mut self, millis: u64) {
            self.read_timeout = millis;
        }
    }
}
