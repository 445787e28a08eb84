use std::cmp::min;
use std::io;

/// A fixed-capacity byte FIFO. Data is appended at the tail and consumed from
/// the head; both cursors wrap around the backing storage. Writes beyond the
/// free space and reads beyond the available data return short counts.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Remaining free space in the buffer.
    #[inline]
    pub fn space(&self) -> usize {
        self.data.len() - self.len
    }

    /// Appends as much of `data` as fits, returning the number of bytes
    /// taken. The copy wraps around the end of storage in two segments.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = min(data.len(), self.space());
        let capacity = self.data.len();
        let tail = (self.head + self.len) % capacity;

        let first = min(count, capacity - tail);
        self.data[tail..tail + first].copy_from_slice(&data[..first]);
        self.data[..count - first].copy_from_slice(&data[first..count]);

        self.len += count;
        count
    }

    /// Consumes up to `out.len()` bytes into `out`, returning the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = self.peek(out);
        self.head = (self.head + count) % self.data.len();
        self.len -= count;
        count
    }

    /// Copies up to `out.len()` bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let count = min(out.len(), self.len);
        let capacity = self.data.len();

        let first = min(count, capacity - self.head);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        out[first..count].copy_from_slice(&self.data[..count - first]);

        count
    }

    /// Discards up to `count` bytes, returning the number discarded.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = min(count, self.len);
        self.head = (self.head + count) % self.data.len();
        self.len -= count;
        count
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Reads from the supplied reader into the free space until the buffer is
    /// full, the reader would block, or the stream ends. A closed stream
    /// surfaces as `UnexpectedEof` so that callers can tear the owner down.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.space() > 0 {
            let capacity = self.data.len();
            let tail = (self.head + self.len) % capacity;
            let run = if tail >= self.head || self.len == 0 {
                capacity - tail
            } else {
                self.head - tail
            };
            let run = min(run, self.space());

            match reader.read(&mut self.data[tail..tail + run]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.len += count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Writes buffered data to the supplied writer until the buffer is empty
    /// or the writer would block. A zero-length write surfaces as `WriteZero`.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while self.len > 0 {
            let capacity = self.data.len();
            let run = min(self.len, capacity - self.head);

            match writer.write(&self.data[self.head..self.head + run]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.head = (self.head + count) % capacity;
                    self.len -= count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockStream {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockStream {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockStream {
            MockStream {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockStream {
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

    impl io::Write for MockStream {
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
    fn test_write_read_short_counts() {
        let mut buffer = Buffer::new(8);

        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.space(), 2);

        // Only the free space is taken.
        assert_eq!(buffer.write(&[7, 8, 9]), 2);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.write(&[10]), 0);

        let mut out = [0u8; 16];
        assert_eq!(buffer.read(&mut out), 8);
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buffer = Buffer::new(8);
        buffer.write(&[1, 2, 3]);

        let mut out = [0u8; 2];
        assert_eq!(buffer.peek(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_skip() {
        let mut buffer = Buffer::new(8);
        buffer.write(&[1, 2, 3, 4]);

        assert_eq!(buffer.skip(2), 2);

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(&out[..2], &[3, 4]);
        assert_eq!(buffer.skip(5), 0);
    }

    #[test]
    fn test_wrap_around() {
        let mut buffer = Buffer::new(4);
        let mut out = [0u8; 4];

        buffer.write(&[1, 2, 3]);
        assert_eq!(buffer.read(&mut out[..2]), 2);

        // Head is now at offset 2, the next write wraps.
        assert_eq!(buffer.write(&[4, 5, 6]), 3);
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn test_ingress_egress_roundtrip() {
        let mock_data: Vec<_> = (0..96).map(|item| item as u8).collect();
        let mut stream = MockStream::new(mock_data.clone(), 7, usize::max_value());

        let mut buffer = Buffer::new(128);
        let received = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, mock_data.len());
        assert_eq!(buffer.len(), mock_data.len());

        let mut sink = MockStream::new(Vec::new(), 5, usize::max_value());
        let sent = buffer.egress(&mut sink).unwrap();

        assert_eq!(sent, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.data, mock_data);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data: Vec<_> = (0..64).map(|item| item as u8).collect();
        let mut stream = MockStream::new(mock_data, 16, usize::max_value());

        let mut buffer = Buffer::new(32);
        let received = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, 32);
        assert_eq!(buffer.space(), 0);
    }

    #[test]
    fn test_ingress_eof() {
        let mut buffer = Buffer::new(8);
        let result = buffer.ingress(&b""[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_would_block_retains_tail() {
        let mut buffer = Buffer::new(16);
        buffer.write(&[9u8; 10]);

        let mut sink = MockStream::new(Vec::new(), 4, 4);
        let sent = buffer.egress(&mut sink).unwrap();

        assert_eq!(sent, 4);
        assert_eq!(buffer.len(), 6);
    }
}
