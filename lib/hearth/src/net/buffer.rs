use std::io;

/// A fixed-capacity byte buffer with independent read and write positions.
/// Data lives in `[head, tail)`; free capacity is `[tail, capacity)`. The
/// head can be marked and rewound, which the HTTP parser relies on to
/// resume mid-token after a short read.
pub struct ByteBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    mark: Option<usize>,
}

impl ByteBuffer {
    #[inline]
    pub fn new(size: usize) -> ByteBuffer {
        ByteBuffer {
            data: vec![0; size].into_boxed_slice(),
            head: 0,
            tail: 0,
            mark: None,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.tail
    }

    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Advance the head past consumed data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(self.head + count <= self.tail);
        self.head += count;
    }

    /// Rewind the head. Used by the parser to push bytes back.
    #[inline]
    pub fn unread(&mut self, count: usize) {
        debug_assert!(count <= self.head);
        self.head -= count;
    }

    /// Advance the tail past freshly written data.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());
        self.tail += count;
    }

    /// Remember the current head so it can be restored with `rewind`.
    #[inline]
    pub fn mark(&mut self) {
        self.mark = Some(self.head);
    }

    #[inline]
    pub fn rewind(&mut self) {
        if let Some(mark) = self.mark.take() {
            self.head = mark;
        }
    }

    /// Slice containing unread data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// The whole backing store up to the tail. The parser edits committed
    /// bytes in place (lowercasing, value compaction) through this.
    #[inline]
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.tail]
    }

    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.tail]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.mark = None;
    }

    /// Moves unread data to the front of the buffer, reclaiming consumed
    /// space. Any mark is dropped.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
        self.mark = None;
    }

    /// Pops one byte off the head.
    #[inline]
    pub fn get(&mut self) -> Option<u8> {
        if self.head < self.tail {
            let byte = self.data[self.head];
            self.head += 1;
            Some(byte)
        } else {
            None
        }
    }

    /// Copies unread bytes into `dst`, consuming them.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len());
        dst[..count].copy_from_slice(&self.data[self.head..self.head + count]);
        self.head += count;
        count
    }

    /// Appends bytes at the tail. Panics if they do not fit; callers check
    /// `free_capacity` first.
    pub fn put(&mut self, src: &[u8]) {
        assert!(src.len() <= self.free_capacity(), "ByteBuffer overrun");
        self.data[self.tail..self.tail + src.len()].copy_from_slice(src);
        self.tail += src.len();
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the head. Stops at would-block; errors on a zero-length write.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while self.head < self.tail {
            let count = writer.write(&self.data[self.head..self.tail])?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.head += count;
        }

        Ok(orig_len - self.len())
    }

    /// Read once from the supplied reader into the free capacity. Returns
    /// the byte count; 0 signals EOF from the reader.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        if self.free_capacity() == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
        }

        let count = reader.read(&mut self.data[self.tail..])?;
        self.tail += count;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..2048).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = ByteBuffer::new(4096);

        loop {
            match buffer.ingress(&mut channel) {
                Ok(_) => continue,
                Err(err) => {
                    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
        }

        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_sink = [0u8; 0];

        let mut buffer = ByteBuffer::new(64);
        buffer.put(&[1]);

        let result = buffer.egress(&mut zero_sink[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_buffer_overrun() {
        let mock_data = vec![7u8; 128];

        let mut buffer = ByteBuffer::new(64);
        buffer.ingress(&mock_data[..]).unwrap();

        let result = buffer.ingress(&mock_data[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_mark_rewind() {
        let mut buffer = ByteBuffer::new(16);
        buffer.put(b"abcdef");

        assert_eq!(buffer.get(), Some(b'a'));
        buffer.mark();
        assert_eq!(buffer.get(), Some(b'b'));
        assert_eq!(buffer.get(), Some(b'c'));

        buffer.rewind();
        assert_eq!(buffer.get(), Some(b'b'));
    }

    #[test]
    fn test_unread_steps_back() {
        let mut buffer = ByteBuffer::new(16);
        buffer.put(b"xy");

        assert_eq!(buffer.get(), Some(b'x'));
        assert_eq!(buffer.get(), Some(b'y'));
        buffer.unread(2);
        assert_eq!(buffer.get(), Some(b'x'));
    }

    #[test]
    fn test_compact_reclaims_space() {
        let mut buffer = ByteBuffer::new(8);
        buffer.put(b"12345678");
        buffer.move_head(6);

        buffer.compact();

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.free_capacity(), 6);
        assert_eq!(buffer.read_slice(), b"78");
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = ByteBuffer::new(64);

        buffer.ingress(&mut cursor).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut out = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut out).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&out.get_ref()[..], &[1, 2, 3]);
    }
}
