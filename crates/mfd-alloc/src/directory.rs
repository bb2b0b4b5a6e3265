//! Directory sector allocation.
//!
//! Catalog records (lead items, main items, DAD records) live in directory
//! tracks. Each pack contributes a reserved run of directory tracks at
//! bring-up; further tracks are drawn one at a time from the fixed pool when
//! the reserve runs out. Every directory track carries a 64-bit sector
//! bitmap; sector 0 holds that bitmap and is never handed out. Tracks with
//! at least one free sector are threaded on an availability list.

use crate::pool::{FixedPool, TrackGrant};
use crate::{bitmap_clear, bitmap_count_free, bitmap_find_free, bitmap_get, bitmap_set};
use mfd_error::{MfdError, Result};
use mfd_types::{LdatIndex, SECTORS_PER_TRACK, SectorAddress, TrackId};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error};

type TrackKey = (LdatIndex, TrackId);

#[derive(Debug, Clone)]
struct DirectoryTrack {
    bitmap: [u8; 8],
    /// Part of a pack's bring-up reserve (never returned to the pool).
    reserved: bool,
}

impl DirectoryTrack {
    fn new(reserved: bool) -> Self {
        let mut bitmap = [0_u8; 8];
        bitmap_set(&mut bitmap, 0);
        Self { bitmap, reserved }
    }

    fn free_sectors(&self) -> u32 {
        bitmap_count_free(&self.bitmap, SECTORS_PER_TRACK)
    }
}

/// Tracks directory sectors in use across all packs.
#[derive(Debug, Clone, Default)]
pub struct DirectoryAllocator {
    tracks: BTreeMap<TrackKey, DirectoryTrack>,
    available: VecDeque<TrackKey>,
}

impl DirectoryAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tracks` contiguous tracks on `ldat` as directory reserve.
    pub fn reserve_on_pack(
        &mut self,
        pool: &mut FixedPool,
        ldat: LdatIndex,
        tracks: u64,
    ) -> Result<()> {
        if tracks == 0 {
            return Ok(());
        }
        let pack = pool
            .pack(ldat)
            .ok_or_else(|| MfdError::NotFound(format!("pack {ldat}")))?;
        let start = pack
            .allocator
            .find_larger_unallocated_region(tracks)
            .ok_or(MfdError::NoSpace)?;
        pool.claim(
            TrackGrant {
                ldat,
                device_track: start,
                count: tracks,
            },
            false,
        )?;
        for offset in 0..tracks {
            self.add_track((ldat, TrackId(start.0 + offset)), true);
        }
        debug!(
            ldat = ldat.0,
            start = start.0,
            tracks,
            "directory_reserve"
        );
        Ok(())
    }

    fn add_track(&mut self, key: TrackKey, reserved: bool) {
        self.tracks.insert(key, DirectoryTrack::new(reserved));
        self.available.push_back(key);
    }

    /// Hand out one free directory sector.
    ///
    /// Grows by one pool track when no directory track has a free sector.
    pub fn allocate_sector(&mut self, pool: &mut FixedPool) -> Result<SectorAddress> {
        while let Some(&key) = self.available.front() {
            let track = self.tracks.get_mut(&key).ok_or_else(|| {
                MfdError::Invariant(format!(
                    "availability list names unknown directory track {}/{}",
                    key.0, key.1
                ))
            })?;
            match bitmap_find_free(&track.bitmap, SECTORS_PER_TRACK, 1) {
                Some(sector) => {
                    bitmap_set(&mut track.bitmap, sector);
                    if track.free_sectors() == 0 {
                        self.available.pop_front();
                    }
                    return SectorAddress::new(key.0, key.1, sector)
                        .map_err(|e| MfdError::Invariant(format!("directory address: {e}")));
                }
                None => {
                    self.available.pop_front();
                }
            }
        }

        let grant = pool
            .allocate_fixed_tracks(&[], 1, false)?
            .ok_or(MfdError::NoSpace)?;
        debug!(
            ldat = grant.ldat.0,
            track = grant.device_track.0,
            "directory_track_grown"
        );
        self.add_track((grant.ldat, grant.device_track), false);
        self.allocate_sector(pool)
    }

    /// Return a directory sector.
    ///
    /// A grown (non-reserve) track whose sectors are all free again goes
    /// back to the pool.
    pub fn release_sector(&mut self, pool: &mut FixedPool, addr: SectorAddress) -> Result<()> {
        let (ldat, track_id, sector) = addr.decode().map_err(|e| {
            error!(sector = addr.0, error = %e, "directory_address_undecodable");
            MfdError::Corruption {
                sector: addr.0,
                detail: format!("directory address does not decode: {e}"),
            }
        })?;
        let key = (ldat, track_id);
        let Some(track) = self.tracks.get_mut(&key) else {
            error!(sector = addr.0, "directory_track_unknown");
            return Err(MfdError::Corruption {
                sector: addr.0,
                detail: "sector is not in a directory track".to_owned(),
            });
        };
        if sector == 0 || !bitmap_get(&track.bitmap, sector) {
            error!(sector = addr.0, "directory_sector_not_in_use");
            return Err(MfdError::Corruption {
                sector: addr.0,
                detail: "directory sector is not in use".to_owned(),
            });
        }

        let was_full = track.free_sectors() == 0;
        bitmap_clear(&mut track.bitmap, sector);
        let empty = track.free_sectors() == SECTORS_PER_TRACK - 1;

        if empty && !track.reserved {
            self.tracks.remove(&key);
            self.available.retain(|k| *k != key);
            pool.deallocate_fixed_tracks(
                TrackGrant {
                    ldat,
                    device_track: track_id,
                    count: 1,
                },
                false,
            )?;
            debug!(ldat = ldat.0, track = track_id.0, "directory_track_returned");
        } else if was_full {
            self.available.push_back(key);
        }
        Ok(())
    }

    /// Whether `addr` names an in-use directory sector.
    #[must_use]
    pub fn is_in_use(&self, addr: SectorAddress) -> bool {
        addr.decode().is_ok_and(|(ldat, track, sector)| {
            sector != 0
                && self
                    .tracks
                    .get(&(ldat, track))
                    .is_some_and(|t| bitmap_get(&t.bitmap, sector))
        })
    }

    /// Number of directory tracks currently held.
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Free sectors across all directory tracks.
    #[must_use]
    pub fn free_sector_count(&self) -> u64 {
        self.tracks
            .values()
            .map(|t| u64::from(t.free_sectors()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PackSpec;

    fn pool_with(ldat: u32, tracks: u64) -> FixedPool {
        let mut pool = FixedPool::new();
        pool.add_pack(&PackSpec {
            ldat: LdatIndex(ldat),
            total_tracks: tracks,
            is_fixed: true,
            in_fixed_pool: true,
        })
        .unwrap();
        pool
    }

    #[test]
    fn reserve_claims_pack_tracks() {
        let mut pool = pool_with(1, 100);
        let mut dir = DirectoryAllocator::new();
        dir.reserve_on_pack(&mut pool, LdatIndex(1), 2).unwrap();
        assert_eq!(dir.track_count(), 2);
        assert_eq!(dir.free_sector_count(), 2 * 63);
        assert_eq!(pool.stats().free_tracks, 98);
    }

    #[test]
    fn sectors_are_unique_and_skip_bitmap_sector() {
        let mut pool = pool_with(1, 100);
        let mut dir = DirectoryAllocator::new();
        dir.reserve_on_pack(&mut pool, LdatIndex(1), 1).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..63 {
            let addr = dir.allocate_sector(&mut pool).unwrap();
            let (_, _, sector) = addr.decode().unwrap();
            assert_ne!(sector, 0);
            assert!(seen.insert(addr));
        }
        assert_eq!(dir.free_sector_count(), 0);
        assert_eq!(pool.stats().free_tracks, 99);

        // Reserve exhausted: the next sector grows a track from the pool.
        let grown = dir.allocate_sector(&mut pool).unwrap();
        assert!(seen.insert(grown));
        assert_eq!(dir.track_count(), 2);
        assert_eq!(pool.stats().free_tracks, 98);

        // Emptying the grown track returns it to the pool.
        dir.release_sector(&mut pool, grown).unwrap();
        assert_eq!(dir.track_count(), 1);
        assert_eq!(pool.stats().free_tracks, 99);
    }

    #[test]
    fn released_sector_is_reused() {
        let mut pool = pool_with(1, 10);
        let mut dir = DirectoryAllocator::new();
        dir.reserve_on_pack(&mut pool, LdatIndex(1), 1).unwrap();
        let sectors: Vec<_> = (0..63)
            .map(|_| dir.allocate_sector(&mut pool).unwrap())
            .collect();
        dir.release_sector(&mut pool, sectors[10]).unwrap();
        assert!(!dir.is_in_use(sectors[10]));
        let again = dir.allocate_sector(&mut pool).unwrap();
        assert_eq!(again, sectors[10]);
        assert_eq!(dir.track_count(), 1);
    }

    #[test]
    fn bad_addresses_are_corruption() {
        let mut pool = pool_with(1, 10);
        let mut dir = DirectoryAllocator::new();
        dir.reserve_on_pack(&mut pool, LdatIndex(1), 1).unwrap();
        let addr = dir.allocate_sector(&mut pool).unwrap();

        let undecodable = SectorAddress(1 << 60);
        assert!(dir.release_sector(&mut pool, undecodable).unwrap_err().is_fatal());

        let foreign = SectorAddress::new(LdatIndex(1), TrackId(9), 3).unwrap();
        assert!(dir.release_sector(&mut pool, foreign).unwrap_err().is_fatal());

        dir.release_sector(&mut pool, addr).unwrap();
        assert!(dir.release_sector(&mut pool, addr).unwrap_err().is_fatal());
    }

    #[test]
    fn exhausted_pool_is_no_space() {
        let mut pool = pool_with(1, 1);
        let mut dir = DirectoryAllocator::new();
        dir.reserve_on_pack(&mut pool, LdatIndex(1), 1).unwrap();
        for _ in 0..63 {
            dir.allocate_sector(&mut pool).unwrap();
        }
        assert!(matches!(
            dir.allocate_sector(&mut pool),
            Err(MfdError::NoSpace)
        ));
    }
}
