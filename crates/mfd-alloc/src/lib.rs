#![forbid(unsafe_code)]
//! Mass-storage allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation for directory-track sector maps.
//! 2. **PackAllocator**: coalesced free/allocated regions of one pack.
//! 3. **FixedPool**: chooses which pack satisfies a track request.
//! 4. **DirectoryAllocator**: one-sector-at-a-time allocation of catalog
//!    storage out of reserved directory tracks.

pub mod directory;
pub mod pack;
pub mod pool;

pub use directory::DirectoryAllocator;
pub use pack::{PackAllocator, Region};
pub use pool::{FixedPool, PackInfo, PackSpec, PoolStats, TrackGrant};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u32
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count)
        .chain(0..start.min(count))
        .find(|&idx| !bitmap_get(bitmap, idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 8];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 63);
        assert!(bitmap_get(&bm, 63));
        assert_eq!(bm[7], 0x80);

        // Out-of-range indices are ignored.
        bitmap_set(&mut bm, 64);
        assert!(!bitmap_get(&bm, 64));
    }

    #[test]
    fn bitmap_count_and_find() {
        let mut bm = vec![0u8; 8];
        assert_eq!(bitmap_count_free(&bm, 64), 64);
        for i in 0..5 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_count_free(&bm, 64), 59);
        assert_eq!(bitmap_find_free(&bm, 64, 1), Some(5));
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFFu8; 8];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 64, 10), Some(3));
        bitmap_set(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 64, 10), None);
    }
}
