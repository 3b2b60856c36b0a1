//! Buffer Slices
//!
//! A message received from the transport is an ordered list of
//! reference-counted buffers. Slicing hands out views into those buffers
//! instead of copying bytes.

use bytes::{Buf, Bytes, BytesMut};

use super::decoder::WireError;

/// Ordered list of non-empty byte buffers forming one logical byte string.
#[derive(Debug, Clone, Default)]
pub struct BufferSlice {
    bufs: Vec<Bytes>,
    len: usize,
}

impl BufferSlice {
    /// Create an empty slice.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bufs: Vec::new(),
            len: 0,
        }
    }

    /// Split `bytes` into buffers of at most `max_len` bytes each.
    ///
    /// The pieces share the original allocation.
    #[must_use]
    pub fn chunked(bytes: &Bytes, max_len: usize) -> Self {
        let max_len = max_len.max(1);
        let mut slice = Self::new();
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + max_len).min(bytes.len());
            slice.push(bytes.slice(start..end));
            start = end;
        }
        slice
    }

    /// Append a buffer; empty buffers are dropped.
    pub fn push(&mut self, buf: Bytes) {
        if !buf.is_empty() {
            self.len += buf.len();
            self.bufs.push(buf);
        }
    }

    /// Total length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying buffers.
    #[must_use]
    pub fn buffers(&self) -> &[Bytes] {
        &self.bufs
    }

    /// Flatten into one contiguous buffer, copying only when there is more
    /// than one underlying buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self.bufs.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut out = BytesMut::with_capacity(self.len);
                for buf in many {
                    out.extend_from_slice(buf);
                }
                out.freeze()
            }
        }
    }

    /// CRC32C over all bytes.
    #[must_use]
    pub fn crc32c(&self) -> u32 {
        self.bufs
            .iter()
            .fold(0, |crc, buf| crc32c::crc32c_append(crc, buf))
    }

    pub(crate) fn cursor(&self) -> Cursor<'_> {
        Cursor {
            bufs: &self.bufs,
            idx: 0,
            pos: 0,
            remaining: self.len,
        }
    }
}

impl From<Bytes> for BufferSlice {
    fn from(buf: Bytes) -> Self {
        let mut slice = Self::new();
        slice.push(buf);
        slice
    }
}

impl From<Vec<Bytes>> for BufferSlice {
    fn from(bufs: Vec<Bytes>) -> Self {
        bufs.into_iter().collect()
    }
}

impl FromIterator<Bytes> for BufferSlice {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut slice = Self::new();
        for buf in iter {
            slice.push(buf);
        }
        slice
    }
}

impl IntoIterator for BufferSlice {
    type Item = Bytes;
    type IntoIter = std::vec::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.bufs.into_iter()
    }
}

/// Read position over a [`BufferSlice`].
///
/// Implements [`Buf`] so prost's varint and key decoders work across buffer
/// boundaries.
pub(crate) struct Cursor<'a> {
    bufs: &'a [Bytes],
    idx: usize,
    pos: usize,
    remaining: usize,
}

impl Cursor<'_> {
    /// Take the next `n` bytes as views into the underlying buffers.
    pub(crate) fn take_views(&mut self, n: usize) -> Result<BufferSlice, WireError> {
        self.ensure(n)?;
        let mut views = BufferSlice::new();
        let mut left = n;
        while left > 0 {
            let buf = &self.bufs[self.idx];
            let take = (buf.len() - self.pos).min(left);
            views.push(buf.slice(self.pos..self.pos + take));
            self.advance(take);
            left -= take;
        }
        Ok(views)
    }

    /// Take the next `n` bytes contiguously. Zero-copy when they sit in one
    /// buffer, copied otherwise.
    pub(crate) fn take_bytes(&mut self, n: usize) -> Result<Bytes, WireError> {
        self.ensure(n)?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        if n <= self.chunk().len() {
            let bytes = self.bufs[self.idx].slice(self.pos..self.pos + n);
            self.advance(n);
            return Ok(bytes);
        }
        Ok(self.take_views(n)?.to_bytes())
    }

    /// Skip `n` bytes.
    pub(crate) fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.ensure(n)?;
        self.advance(n);
        Ok(())
    }

    const fn ensure(&self, n: usize) -> Result<(), WireError> {
        if n > self.remaining {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining,
            });
        }
        Ok(())
    }
}

impl Buf for Cursor<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.bufs.get(self.idx).map_or(&[], |buf| &buf[self.pos..])
    }

    fn advance(&mut self, cnt: usize) {
        let mut cnt = cnt.min(self.remaining);
        self.remaining -= cnt;
        while cnt > 0 {
            let available = self.bufs[self.idx].len() - self.pos;
            if cnt < available {
                self.pos += cnt;
                cnt = 0;
            } else {
                cnt -= available;
                self.idx += 1;
                self.pos = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffers_are_dropped() {
        let slice = BufferSlice::from(vec![
            Bytes::new(),
            Bytes::from_static(b"ab"),
            Bytes::new(),
            Bytes::from_static(b"c"),
        ]);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice.buffers().len(), 2);
    }

    #[test]
    fn chunked_shares_allocation_and_preserves_content() {
        let data = Bytes::from_static(b"hello world");
        let slice = BufferSlice::chunked(&data, 4);
        assert_eq!(slice.buffers().len(), 3);
        assert_eq!(slice.to_bytes(), data);
    }

    #[test]
    fn to_bytes_single_buffer_is_zero_copy() {
        let data = Bytes::from_static(b"payload");
        let slice = BufferSlice::from(data.clone());
        assert_eq!(slice.to_bytes().as_ptr(), data.as_ptr());
    }

    #[test]
    fn crc32c_spans_buffers() {
        let data = Bytes::from_static(b"123456789");
        let whole = BufferSlice::from(data.clone()).crc32c();
        let split = BufferSlice::chunked(&data, 2).crc32c();
        assert_eq!(whole, split);
        // Standard CRC32C check value.
        assert_eq!(whole, 0xE306_9283);
    }

    #[test]
    fn cursor_take_views_across_buffers() {
        let slice = BufferSlice::chunked(&Bytes::from_static(b"abcdefgh"), 3);
        let mut cursor = slice.cursor();
        cursor.skip(2).unwrap();
        let views = cursor.take_views(4).unwrap();
        assert_eq!(views.buffers().len(), 2);
        assert_eq!(&views.to_bytes()[..], b"cdef");
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.chunk(), b"gh");
    }

    #[test]
    fn cursor_take_past_end_is_truncated() {
        let slice = BufferSlice::from(Bytes::from_static(b"abc"));
        let mut cursor = slice.cursor();
        let err = cursor.take_bytes(4).unwrap_err();
        assert!(matches!(
            err,
            WireError::Truncated {
                needed: 4,
                available: 3
            }
        ));
    }
}
