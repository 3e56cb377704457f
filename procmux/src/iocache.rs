//! Growable byte cache for accumulating partial reads.
//!
//! A [`ByteCache`] sits between a non-blocking channel and the frame decoder:
//! each readiness event appends whatever the channel has into the free space,
//! and [`ByteCache::extract_frame`] pulls out complete delimiter-terminated
//! payloads. A single read may carry zero, one or many frames, and a frame may
//! span several reads, so callers loop on `extract_frame` after every read.
//!
//! Growth is explicit and capped: the cache never allocates beyond its
//! maximum, so a peer cannot force unbounded memory use.
//!
//! # Example
//!
//! ```
//! use procmux::iocache::ByteCache;
//!
//! let mut cache = ByteCache::new(16, 64);
//! let mut input: &[u8] = b"a=1\n\nb=2\n";
//! cache.read_from(&mut input).unwrap();
//!
//! assert_eq!(cache.extract_frame(b"\n\n"), Some(&b"a=1"[..]));
//! assert_eq!(cache.extract_frame(b"\n\n"), None);
//! assert_eq!(cache.size(), 4);
//! ```

use std::io::{self, Read};

use crate::error::{MuxError, Result};

/// Largest buffer a cache may grow to unless configured otherwise (64 MiB).
pub const MAX_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Starting capacity used by [`ByteCache::default`].
pub const DEFAULT_CACHE_SIZE: usize = 8 * 1024;

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    if let [byte] = needle {
        return haystack.iter().position(|b| b == byte);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Bounded growable buffer with a read cursor and a write cursor.
///
/// Invariants: `read <= scan <= write <= capacity <= max_capacity`.
/// The unread region is `buf[read..write]`; free space is everything else,
/// reclaimed by compaction before each read.
#[derive(Debug)]
pub struct ByteCache {
    buf: Vec<u8>,
    read: usize,
    write: usize,
    /// Where the next delimiter search starts; bytes before it are known
    /// not to begin a delimiter.
    scan: usize,
    max_capacity: usize,
}

impl ByteCache {
    /// Create a cache with `initial_size` bytes of capacity and a ceiling of
    /// `max_size`. The initial size is clamped to the ceiling.
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        let capacity = initial_size.min(max_size);
        Self {
            buf: vec![0; capacity],
            read: 0,
            write: 0,
            scan: 0,
            max_capacity: max_size,
        }
    }

    /// Create a cache with the default 64 MiB ceiling.
    pub fn with_capacity(initial_size: usize) -> Self {
        Self::new(initial_size, MAX_CACHE_SIZE)
    }

    /// Unread bytes currently buffered.
    pub fn size(&self) -> usize {
        self.write - self.read
    }

    /// Free space: how many bytes the next read can accept.
    pub fn available(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Current allocated capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Grow capacity by `additional` bytes.
    ///
    /// Fails with [`MuxError::CapacityExceeded`] and leaves the cache untouched
    /// if the result would exceed the ceiling.
    pub fn grow(&mut self, additional: usize) -> Result<()> {
        let requested = self
            .capacity()
            .checked_add(additional)
            .filter(|&n| n <= self.max_capacity)
            .ok_or(MuxError::CapacityExceeded {
                requested: self.capacity().saturating_add(additional),
                max: self.max_capacity,
            })?;
        self.buf.resize(requested, 0);
        Ok(())
    }

    /// Double the capacity, capped at the ceiling. Returns the new capacity.
    ///
    /// Fails only when the cache is already at its ceiling.
    pub fn double(&mut self) -> Result<usize> {
        let headroom = self.max_capacity.saturating_sub(self.capacity());
        if headroom == 0 {
            return Err(MuxError::CapacityExceeded {
                requested: self.capacity().saturating_mul(2).max(1),
                max: self.max_capacity,
            });
        }
        self.grow(self.capacity().max(1).min(headroom))?;
        Ok(self.capacity())
    }

    /// Perform one read from `source` into the free space.
    ///
    /// `Ok(0)` means the peer closed the channel, except when there is no
    /// free space at all, in which case nothing is read; check
    /// [`available`](Self::available) first. `WouldBlock` and `Interrupted`
    /// errors are transient and leave the cache unchanged.
    pub fn read_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        self.compact();
        if self.write == self.buf.len() {
            return Ok(0);
        }
        let n = source.read(&mut self.buf[self.write..])?;
        self.write += n;
        Ok(n)
    }

    /// Append bytes directly. Fails if they do not fit in the free space.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(MuxError::CapacityExceeded {
                requested: self.size() + data.len(),
                max: self.capacity(),
            });
        }
        self.compact();
        self.buf[self.write..self.write + data.len()].copy_from_slice(data);
        self.write += data.len();
        Ok(())
    }

    /// Pull the next complete frame out of the unread region.
    ///
    /// Returns the payload (without the delimiter) and advances the read
    /// cursor past payload and delimiter, or `None` if no complete frame is
    /// buffered yet. The delimiter should be the same on every call.
    pub fn extract_frame(&mut self, delimiter: &[u8]) -> Option<&[u8]> {
        if delimiter.is_empty() {
            return None;
        }
        let from = self.scan.max(self.read);
        match find_subsequence(&self.buf[from..self.write], delimiter) {
            Some(offset) => {
                let start = self.read;
                let end = from + offset;
                self.read = end + delimiter.len();
                self.scan = self.read;
                if self.read == self.write {
                    // Drained: rewind so the next read lands at the front.
                    self.read = 0;
                    self.write = 0;
                    self.scan = 0;
                }
                Some(&self.buf[start..end])
            }
            None => {
                self.scan = self
                    .write
                    .saturating_sub(delimiter.len() - 1)
                    .max(self.read);
                None
            }
        }
    }

    /// Drop all buffered bytes. Capacity is kept.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.scan = 0;
    }

    fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        self.buf.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.scan -= self.read;
        self.read = 0;
    }
}

impl Default for ByteCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    const DELIM: &[u8] = b"\x01\0\0";

    fn framed(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for payload in payloads {
            out.extend_from_slice(payload);
            out.extend_from_slice(DELIM);
        }
        out
    }

    #[test]
    fn new_cache_is_empty() {
        let cache = ByteCache::new(32, 128);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.available(), 32);
        assert_eq!(cache.capacity(), 32);
        assert_eq!(cache.max_capacity(), 128);
        assert!(cache.is_empty());
    }

    #[test]
    fn initial_size_is_clamped_to_ceiling() {
        let cache = ByteCache::new(1024, 100);
        assert_eq!(cache.capacity(), 100);
    }

    #[test]
    fn frames_come_out_in_order() {
        let mut cache = ByteCache::new(64, 64);
        let data = framed(&[b"first", b"second", b"", b"third"]);
        cache.read_from(&mut &data[..]).unwrap();

        let before = cache.size();
        assert_eq!(cache.extract_frame(DELIM), Some(&b"first"[..]));
        assert_eq!(cache.size(), before - 5 - DELIM.len());
        assert_eq!(cache.extract_frame(DELIM), Some(&b"second"[..]));
        assert_eq!(cache.extract_frame(DELIM), Some(&b""[..]));
        assert_eq!(cache.extract_frame(DELIM), Some(&b"third"[..]));
        assert_eq!(cache.extract_frame(DELIM), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut cache = ByteCache::new(64, 64);
        cache.read_from(&mut &b"job_id=7\0comm"[..]).unwrap();
        assert_eq!(cache.extract_frame(DELIM), None);
        assert_eq!(cache.size(), 13);

        cache.read_from(&mut &b"and=true\x01\0"[..]).unwrap();
        assert_eq!(cache.extract_frame(DELIM), None);

        cache.read_from(&mut &b"\0"[..]).unwrap();
        assert_eq!(
            cache.extract_frame(DELIM),
            Some(&b"job_id=7\0command=true"[..])
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn delimiter_split_across_reads_is_found() {
        let mut cache = ByteCache::new(32, 32);
        for chunk in [&b"x=1\x01"[..], &b"\0"[..], &b"\0y=2\x01\0\0"[..]] {
            cache.read_from(&mut &chunk[..]).unwrap();
        }
        assert_eq!(cache.extract_frame(DELIM), Some(&b"x=1"[..]));
        assert_eq!(cache.extract_frame(DELIM), Some(&b"y=2"[..]));
        assert_eq!(cache.extract_frame(DELIM), None);
    }

    #[test]
    fn byte_at_a_time() {
        let mut cache = ByteCache::new(16, 16);
        let data = framed(&[b"a=1", b"b=2"]);
        let mut frames = Vec::new();
        for byte in &data {
            cache.read_from(&mut &[*byte][..]).unwrap();
            while let Some(frame) = cache.extract_frame(DELIM) {
                frames.push(frame.to_vec());
            }
        }
        assert_eq!(frames, vec![b"a=1".to_vec(), b"b=2".to_vec()]);
    }

    #[test]
    fn compaction_reclaims_consumed_space() {
        let mut cache = ByteCache::new(8, 8);
        cache.read_from(&mut &b"ab\x01\0\0cd"[..]).unwrap();
        assert_eq!(cache.available(), 1);
        assert_eq!(cache.extract_frame(DELIM), Some(&b"ab"[..]));
        assert_eq!(cache.available(), 6);

        cache.read_from(&mut &b"e\x01\0\0"[..]).unwrap();
        assert_eq!(cache.extract_frame(DELIM), Some(&b"cde"[..]));
        assert!(cache.is_empty());
    }

    #[test]
    fn grow_respects_ceiling() {
        let mut cache = ByteCache::new(16, 40);
        cache.grow(16).unwrap();
        assert_eq!(cache.capacity(), 32);

        let err = cache.grow(16).unwrap_err();
        assert!(matches!(
            err,
            MuxError::CapacityExceeded {
                requested: 48,
                max: 40
            }
        ));
        assert_eq!(cache.capacity(), 32);
    }

    #[test]
    fn grow_preserves_buffered_bytes() {
        let mut cache = ByteCache::new(4, 64);
        cache.read_from(&mut &b"k=v\x01"[..]).unwrap();
        assert_eq!(cache.available(), 0);
        cache.double().unwrap();
        cache.read_from(&mut &b"\0\0"[..]).unwrap();
        assert_eq!(cache.extract_frame(DELIM), Some(&b"k=v"[..]));
    }

    #[test]
    fn double_is_capped_at_ceiling() {
        let mut cache = ByteCache::new(24, 40);
        assert_eq!(cache.double().unwrap(), 40);
        assert!(matches!(
            cache.double(),
            Err(MuxError::CapacityExceeded { max: 40, .. })
        ));
        assert_eq!(cache.capacity(), 40);
    }

    #[test]
    fn double_from_zero_capacity() {
        let mut cache = ByteCache::new(0, 8);
        assert_eq!(cache.double().unwrap(), 1);
        assert_eq!(cache.double().unwrap(), 2);
    }

    #[test]
    fn full_cache_reads_nothing() {
        let mut cache = ByteCache::new(4, 4);
        cache.read_from(&mut &b"abcd"[..]).unwrap();
        let mut more: &[u8] = b"ef";
        assert_eq!(cache.read_from(&mut more).unwrap(), 0);
        assert_eq!(more, b"ef");
    }

    #[test]
    fn extend_from_slice_checks_space() {
        let mut cache = ByteCache::new(4, 4);
        cache.extend_from_slice(b"abc").unwrap();
        assert!(cache.extend_from_slice(b"de").is_err());
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn empty_delimiter_never_matches() {
        let mut cache = ByteCache::new(8, 8);
        cache.extend_from_slice(b"abc").unwrap();
        assert_eq!(cache.extract_frame(b""), None);
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn clear_discards_unread_bytes() {
        let mut cache = ByteCache::new(8, 8);
        cache.extend_from_slice(b"abc").unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.available(), 8);
    }

    #[test]
    fn read_from_socket_reports_would_block_and_close() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let mut cache = ByteCache::new(32, 32);

        let err = cache.read_from(&mut &theirs).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(cache.is_empty());

        ours.write_all(b"a=1\x01\0\0").unwrap();
        assert_eq!(cache.read_from(&mut &theirs).unwrap(), 6);
        assert_eq!(cache.extract_frame(DELIM), Some(&b"a=1"[..]));

        drop(ours);
        assert_eq!(cache.read_from(&mut &theirs).unwrap(), 0);
    }

    #[test]
    fn find_subsequence_cases() {
        assert_eq!(find_subsequence(b"abc", b"c"), Some(2));
        assert_eq!(find_subsequence(b"abc", b"bc"), Some(1));
        assert_eq!(find_subsequence(b"abc", b"cd"), None);
        assert_eq!(find_subsequence(b"ab", b"abc"), None);
        assert_eq!(find_subsequence(b"abc", b""), None);
    }
}
