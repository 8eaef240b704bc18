use std::collections::VecDeque;
use std::io;

use crate::net::chunk::Chunk;
use crate::net::chunkpool::ChunkPool;

/// A dynamically sized FIFO byte queue backed by pooled fixed-size chunks. Data is
/// appended at the tail chunk and consumed from the head chunk; chunks drained to
/// empty are returned to the pool immediately, so an idle connection holds no
/// allocation beyond this shell.
pub struct Buffer {
    chunks: VecDeque<Chunk>,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer { chunks: VecDeque::new() }
    }

    /// The number of bytes currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::remaining_data).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn clear(&mut self, pool: &mut ChunkPool) {
        while let Some(chunk) = self.chunks.pop_front() {
            pool.reclaim(chunk);
        }
    }

    /// Read in data from the supplied reader until it blocks or has nothing left.
    /// Loop-drains across multiple chunks so a large ready payload is fully
    /// absorbed in one call rather than waiting for another readiness event.
    pub fn ingress<R: io::Read>(&mut self, pool: &mut ChunkPool, reader: &mut R) -> io::Result<usize> {
        let mut total = 0usize;

        loop {
            if self.chunks.back().map_or(true, |c| c.capacity() == 0) {
                self.chunks.push_back(pool.alloc());
            }

            let chunk = self.chunks.back_mut().expect("chunk just pushed");

            match reader.read(chunk.writeable_slice()) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    chunk.expand(n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write the contents of the buffer to the supplied writer, reclaiming drained
    /// chunks back into the pool as it goes.
    pub fn egress<W: io::Write>(&mut self, pool: &mut ChunkPool, writer: &mut W) -> io::Result<usize> {
        let mut total = 0usize;

        loop {
            let chunk = match self.chunks.front_mut() {
                Some(chunk) if chunk.remaining_data() > 0 => chunk,
                _ => return Ok(total),
            };

            match writer.write(chunk.readable_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    chunk.advance(n);
                    total += n;

                    if chunk.remaining_data() == 0 {
                        let drained = self.chunks.pop_front().expect("front chunk just drained");
                        pool.reclaim(drained);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Copies out the first `len` bytes without consuming them, for peeking at a
    /// header before committing to reading a whole frame. Returns `None` if fewer
    /// than `len` bytes are currently queued.
    pub fn peek(&self, len: usize) -> Option<Vec<u8>> {
        if self.len() < len {
            return None;
        }

        let mut out = Vec::with_capacity(len);
        for chunk in &self.chunks {
            if out.len() == len {
                break;
            }
            let slice = chunk.readable_slice();
            let take = (len - out.len()).min(slice.len());
            out.extend_from_slice(&slice[..take]);
        }
        Some(out)
    }

    /// Consumes and returns exactly `len` bytes as an owned, contiguous buffer.
    /// Panics if fewer than `len` bytes are queued; callers must check `len()`
    /// (or use `peek`) first.
    pub fn drain(&mut self, pool: &mut ChunkPool, len: usize) -> Vec<u8> {
        assert!(self.len() >= len, "drain requested more data than is queued");

        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let remaining_needed = len - out.len();
            let chunk = self.chunks.front_mut().expect("buffer has enough data");
            let avail = chunk.remaining_data();
            let take = remaining_needed.min(avail);

            out.extend_from_slice(chunk.read(take));

            if chunk.remaining_data() == 0 {
                let drained = self.chunks.pop_front().expect("front chunk just drained");
                pool.reclaim(drained);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk, max_size }
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
    fn roundtrip_across_chunk_boundaries() {
        let mock_data: Vec<_> = (0..20000u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());
        let mut pool = ChunkPool::new();
        let mut buffer = Buffer::new();

        let result = buffer.ingress(&mut pool, &mut channel);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), mock_data.len());

        channel.clear();
        let sent = buffer.egress(&mut pool, &mut channel).unwrap();

        assert_eq!(sent, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn egress_error_on_zero_write() {
        let mut zero_vec: Vec<u8> = vec![];
        let mut pool = ChunkPool::new();
        let mut buffer = Buffer::new();

        let mut chunk = pool.alloc();
        chunk.write(&[1]);
        buffer.chunks.push_back(chunk);

        let result = buffer.egress(&mut pool, &mut (&mut zero_vec[..]));
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn peek_and_drain_respect_chunk_boundaries() {
        let mut pool = ChunkPool::new();
        let mut buffer = Buffer::new();
        let mut src = io::Cursor::new((0..10000u32).map(|i| i as u8).collect::<Vec<u8>>());

        buffer.ingress(&mut pool, &mut src).unwrap();

        let peeked = buffer.peek(11).unwrap();
        assert_eq!(peeked.len(), 11);
        assert_eq!(buffer.len(), 10000);

        let drained = buffer.drain(&mut pool, 11);
        assert_eq!(drained, peeked);
        assert_eq!(buffer.len(), 10000 - 11);
    }

    #[test]
    fn peek_returns_none_when_insufficient_data() {
        let buffer = Buffer::new();
        assert!(buffer.peek(1).is_none());
    }
}
