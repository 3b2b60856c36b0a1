//! Range Arithmetic
//!
//! Offsets and lengths follow the storage convention: a negative offset
//! counts back from the end of the object and a negative length reads to
//! the end.

/// A requested byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    /// First byte; negative values count from the end.
    pub offset: i64,
    /// Byte count; negative reads to the end, zero reads nothing.
    pub length: i64,
}

impl RangeRequest {
    /// The whole object.
    pub const FULL: Self = Self {
        offset: 0,
        length: -1,
    };

    /// Create a range request.
    #[must_use]
    pub const fn new(offset: i64, length: i64) -> Self {
        Self { offset, length }
    }

    /// Whether this covers the entire object.
    #[must_use]
    pub const fn is_full_object(&self) -> bool {
        self.offset == 0 && self.length < 0
    }

    /// Offset and wire length for a stream that started at the absolute
    /// offset `start` and has already delivered `seen` bytes. A wire length
    /// of zero reads to the end.
    #[must_use]
    pub const fn resume_from(&self, start: i64, seen: i64) -> (i64, i64) {
        let length = if self.length > 0 {
            self.length - seen
        } else {
            0
        };
        (start + seen, length)
    }
}

/// Where a read starts and how many bytes it will deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    /// Absolute offset of the first byte.
    pub start: i64,
    /// Bytes the read will deliver.
    pub remaining: i64,
}

/// Resolve a request against the object size.
#[must_use]
pub fn resolve_range(request: RangeRequest, size: i64) -> ResolvedRange {
    let start = if request.offset < 0 {
        (size + request.offset).max(0)
    } else {
        request.offset
    };
    let available = (size - start).max(0);
    let remaining = match request.length {
        0 => 0,
        n if n < 0 => available,
        n => n.min(available),
    };
    ResolvedRange { start, remaining }
}

/// Hands out read ids for ranges on one stream, starting at 1.
#[derive(Debug, Clone)]
pub struct ReadIdGenerator {
    next: i64,
}

impl Default for ReadIdGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl ReadIdGenerator {
    /// Create a generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused id.
    pub const fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
