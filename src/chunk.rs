//! Chunk range planning for resumable transfers.
//!
//! A file of size S with chunk size C is covered by ⌈S/C⌉ contiguous,
//! non-overlapping half-open ranges; only the last chunk may be shorter.

/// A single chunk: byte range [start, end) (half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl ChunkSpec {
    /// Length of this chunk in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Builds a chunk plan covering [0, total_size) with fixed-size chunks.
///
/// Returns an empty vec if `total_size` is 0 or `chunk_size` is 0.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    if total_size == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let count = total_size.div_ceil(chunk_size) as usize;
    let mut out = Vec::with_capacity(count);
    let mut offset = 0u64;
    for index in 0..count {
        let end = (offset + chunk_size).min(total_size);
        out.push(ChunkSpec {
            index,
            start: offset,
            end,
        });
        offset = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_exact_multiple() {
        let chunks = plan_chunks(1000, 250);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkSpec { index: 0, start: 0, end: 250 });
        assert_eq!(chunks[3], ChunkSpec { index: 3, start: 750, end: 1000 });
    }

    #[test]
    fn plan_short_tail() {
        let chunks = plan_chunks(10, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].start, 8);
        assert_eq!(chunks[2].end, 10);
        assert_eq!(chunks[2].len(), 2);
    }

    #[test]
    fn plan_single_chunk() {
        let chunks = plan_chunks(100, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 100);
    }

    #[test]
    fn plan_empty_inputs() {
        assert!(plan_chunks(0, 4096).is_empty());
        assert!(plan_chunks(100, 0).is_empty());
    }

    #[test]
    fn plan_is_contiguous_partition() {
        for (size, chunk) in [(1u64, 1u64), (17, 4), (4096, 4096), (100_000, 333)] {
            let chunks = plan_chunks(size, chunk);
            assert_eq!(chunks.len() as u64, size.div_ceil(chunk));
            let mut offset = 0u64;
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i);
                assert_eq!(c.start, offset, "gap or overlap at chunk {}", i);
                assert!(c.end > c.start);
                offset = c.end;
            }
            assert_eq!(offset, size, "ranges must sum to file size");
        }
    }
}
