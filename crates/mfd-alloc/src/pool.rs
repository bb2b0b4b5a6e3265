//! Fixed-pool track allocation across in-service packs.

use crate::pack::PackAllocator;
use mfd_error::{MfdError, Result};
use mfd_types::{LdatIndex, TrackId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Description of a pack being brought into service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpec {
    pub ldat: LdatIndex,
    pub total_tracks: u64,
    /// Fixed (as opposed to removable) pack.
    pub is_fixed: bool,
    /// Whether ordinary file allocations may be drawn from this pack.
    pub in_fixed_pool: bool,
}

/// A known physical volume and its free-space allocator.
#[derive(Debug, Clone)]
pub struct PackInfo {
    pub ldat: LdatIndex,
    pub total_tracks: u64,
    pub is_fixed: bool,
    pub in_fixed_pool: bool,
    pub allocator: PackAllocator,
    /// Tracks currently granted to temporary (uncataloged) files.
    pub temporary_tracks: u64,
}

impl PackInfo {
    #[must_use]
    pub fn from_spec(spec: &PackSpec) -> Self {
        Self {
            ldat: spec.ldat,
            total_tracks: spec.total_tracks,
            is_fixed: spec.is_fixed,
            in_fixed_pool: spec.in_fixed_pool,
            allocator: PackAllocator::new(spec.total_tracks),
            temporary_tracks: 0,
        }
    }
}

/// A contiguous grant of device tracks on one pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackGrant {
    pub ldat: LdatIndex,
    pub device_track: TrackId,
    pub count: u64,
}

/// Aggregate accounting over the fixed pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub packs: usize,
    pub total_tracks: u64,
    pub free_tracks: u64,
    pub temporary_tracks: u64,
}

/// The set of known packs, keyed by LDAT index.
#[derive(Debug, Clone, Default)]
pub struct FixedPool {
    packs: BTreeMap<LdatIndex, PackInfo>,
}

impl FixedPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a pack into service with all tracks free.
    pub fn add_pack(&mut self, spec: &PackSpec) -> Result<()> {
        LdatIndex::new(spec.ldat.0)
            .map_err(|e| MfdError::InvalidRequest(format!("pack ldat: {e}")))?;
        if spec.total_tracks == 0 {
            return Err(MfdError::InvalidRequest(format!(
                "pack {} has no tracks",
                spec.ldat
            )));
        }
        if self.packs.contains_key(&spec.ldat) {
            return Err(MfdError::Exists(format!("pack {}", spec.ldat)));
        }
        self.packs.insert(spec.ldat, PackInfo::from_spec(spec));
        info!(
            ldat = spec.ldat.0,
            total_tracks = spec.total_tracks,
            fixed = spec.is_fixed,
            in_fixed_pool = spec.in_fixed_pool,
            "pack_online"
        );
        Ok(())
    }

    #[must_use]
    pub fn pack(&self, ldat: LdatIndex) -> Option<&PackInfo> {
        self.packs.get(&ldat)
    }

    pub fn packs(&self) -> impl Iterator<Item = &PackInfo> {
        self.packs.values()
    }

    /// Whether `ldat` is a removable (non-fixed) pack.
    #[must_use]
    pub fn is_removable(&self, ldat: LdatIndex) -> bool {
        self.packs.get(&ldat).is_some_and(|p| !p.is_fixed)
    }

    /// Include or exclude a pack from ordinary allocations.
    pub fn set_in_fixed_pool(&mut self, ldat: LdatIndex, in_pool: bool) -> Result<()> {
        let pack = self
            .packs
            .get_mut(&ldat)
            .ok_or_else(|| MfdError::NotFound(format!("pack {ldat}")))?;
        pack.in_fixed_pool = in_pool;
        Ok(())
    }

    /// Grant up to `requested` contiguous tracks.
    ///
    /// Candidates are the packs in `preferred` (when non-empty) or else every
    /// in-service fixed-pool pack, in LDAT order. Policy is first-fit:
    /// 1. the first pack with a free region of exactly `requested` tracks;
    /// 2. the first pack with a larger free region;
    /// 3. the single largest free region on any candidate (a partial grant).
    ///
    /// Returns `Ok(None)` when no candidate has any free track. Callers loop
    /// on partial grants to assemble the remainder.
    pub fn allocate_fixed_tracks(
        &mut self,
        preferred: &[LdatIndex],
        requested: u64,
        temporary: bool,
    ) -> Result<Option<TrackGrant>> {
        if requested == 0 {
            return Err(MfdError::InvalidRequest(
                "cannot allocate 0 tracks".to_owned(),
            ));
        }

        let candidates: Vec<LdatIndex> = self
            .packs
            .values()
            .filter(|p| {
                if preferred.is_empty() {
                    p.in_fixed_pool
                } else {
                    preferred.contains(&p.ldat)
                }
            })
            .map(|p| p.ldat)
            .collect();

        let exact = candidates.iter().find_map(|ldat| {
            self.packs[ldat]
                .allocator
                .find_unallocated_region(requested)
                .map(|start| (*ldat, start, requested))
        });
        let choice = exact
            .or_else(|| {
                candidates.iter().find_map(|ldat| {
                    self.packs[ldat]
                        .allocator
                        .find_larger_unallocated_region(requested)
                        .map(|start| (*ldat, start, requested))
                })
            })
            .or_else(|| {
                candidates
                    .iter()
                    .filter_map(|ldat| {
                        self.packs[ldat]
                            .allocator
                            .find_largest_unallocated_region()
                            .map(|(start, count)| (*ldat, start, count))
                    })
                    .fold(None, |best: Option<(LdatIndex, TrackId, u64)>, c| match best {
                        Some(b) if b.2 >= c.2 => Some(b),
                        _ => Some(c),
                    })
            });

        let Some((ldat, start, count)) = choice else {
            debug!(requested, "fixed_pool_exhausted");
            return Ok(None);
        };

        let grant = TrackGrant {
            ldat,
            device_track: start,
            count,
        };
        self.claim(grant, temporary)?;
        debug!(
            ldat = ldat.0,
            device_track = start.0,
            count,
            requested,
            temporary,
            "fixed_tracks_granted"
        );
        Ok(Some(grant))
    }

    /// Allocate a specific span on a specific pack.
    pub fn claim(&mut self, grant: TrackGrant, temporary: bool) -> Result<()> {
        let pack = self
            .packs
            .get_mut(&grant.ldat)
            .ok_or_else(|| MfdError::NotFound(format!("pack {}", grant.ldat)))?;
        if !pack.allocator.allocate(grant.device_track, grant.count) {
            error!(
                ldat = grant.ldat.0,
                device_track = grant.device_track.0,
                count = grant.count,
                "allocate_span_not_free"
            );
            return Err(MfdError::Invariant(format!(
                "tracks {}+{} on pack {} are not wholly free",
                grant.device_track, grant.count, grant.ldat
            )));
        }
        if temporary {
            pack.temporary_tracks += grant.count;
        }
        Ok(())
    }

    /// Return a previously granted span to its pack.
    pub fn deallocate_fixed_tracks(&mut self, grant: TrackGrant, temporary: bool) -> Result<()> {
        let pack = self
            .packs
            .get_mut(&grant.ldat)
            .ok_or_else(|| MfdError::NotFound(format!("pack {}", grant.ldat)))?;
        if !pack.allocator.release(grant.device_track, grant.count) {
            error!(
                ldat = grant.ldat.0,
                device_track = grant.device_track.0,
                count = grant.count,
                "release_span_not_allocated"
            );
            return Err(MfdError::Invariant(format!(
                "tracks {}+{} on pack {} are not wholly allocated",
                grant.device_track, grant.count, grant.ldat
            )));
        }
        if temporary {
            pack.temporary_tracks = pack.temporary_tracks.saturating_sub(grant.count);
        }
        debug!(
            ldat = grant.ldat.0,
            device_track = grant.device_track.0,
            count = grant.count,
            temporary,
            "fixed_tracks_released"
        );
        Ok(())
    }

    /// Accounting over packs currently in the fixed pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.packs
            .values()
            .filter(|p| p.in_fixed_pool)
            .fold(PoolStats::default(), |mut acc, p| {
                acc.packs += 1;
                acc.total_tracks += p.total_tracks;
                acc.free_tracks += p.allocator.free_track_count();
                acc.temporary_tracks += p.temporary_tracks;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ldat: u32, tracks: u64) -> PackSpec {
        PackSpec {
            ldat: LdatIndex(ldat),
            total_tracks: tracks,
            is_fixed: true,
            in_fixed_pool: true,
        }
    }

    fn pool(sizes: &[(u32, u64)]) -> FixedPool {
        let mut pool = FixedPool::new();
        for &(ldat, tracks) in sizes {
            pool.add_pack(&spec(ldat, tracks)).unwrap();
        }
        pool
    }

    #[test]
    fn add_pack_validates() {
        let mut pool = FixedPool::new();
        assert!(pool.add_pack(&spec(0, 10)).is_err());
        assert!(pool.add_pack(&spec(1, 0)).is_err());
        pool.add_pack(&spec(1, 10)).unwrap();
        assert!(matches!(
            pool.add_pack(&spec(1, 10)),
            Err(MfdError::Exists(_))
        ));
    }

    #[test]
    fn exact_fit_beats_earlier_larger_fit() {
        let mut pool = pool(&[(1, 100), (2, 100)]);
        // Pack 2: leave an exact 7-track hole at [0,7).
        pool.claim(
            TrackGrant {
                ldat: LdatIndex(2),
                device_track: TrackId(7),
                count: 93,
            },
            false,
        )
        .unwrap();
        let grant = pool
            .allocate_fixed_tracks(&[], 7, false)
            .unwrap()
            .unwrap();
        assert_eq!(grant.ldat, LdatIndex(2));
        assert_eq!(grant.device_track, TrackId(0));
        assert_eq!(grant.count, 7);
    }

    #[test]
    fn larger_fit_is_first_in_ldat_order() {
        let mut pool = pool(&[(3, 50), (1, 50)]);
        let grant = pool
            .allocate_fixed_tracks(&[], 10, false)
            .unwrap()
            .unwrap();
        assert_eq!(grant.ldat, LdatIndex(1));
        assert_eq!(grant.count, 10);
    }

    #[test]
    fn partial_grant_takes_largest_region_anywhere() {
        let mut pool = pool(&[(1, 20), (2, 30)]);
        let grant = pool
            .allocate_fixed_tracks(&[], 45, false)
            .unwrap()
            .unwrap();
        assert_eq!(grant.ldat, LdatIndex(2));
        assert_eq!(grant.count, 30);
        let rest = pool
            .allocate_fixed_tracks(&[], 15, false)
            .unwrap()
            .unwrap();
        assert_eq!(rest.ldat, LdatIndex(1));
        assert_eq!(rest.count, 15);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut pool = pool(&[(1, 5)]);
        assert!(pool.allocate_fixed_tracks(&[], 5, false).unwrap().is_some());
        assert!(pool.allocate_fixed_tracks(&[], 1, false).unwrap().is_none());
        assert!(pool.allocate_fixed_tracks(&[], 0, false).is_err());
    }

    #[test]
    fn packs_outside_pool_are_skipped_unless_preferred() {
        let mut pool = pool(&[(1, 10), (2, 10)]);
        pool.set_in_fixed_pool(LdatIndex(1), false).unwrap();
        let grant = pool
            .allocate_fixed_tracks(&[], 4, false)
            .unwrap()
            .unwrap();
        assert_eq!(grant.ldat, LdatIndex(2));
        let grant = pool
            .allocate_fixed_tracks(&[LdatIndex(1)], 4, false)
            .unwrap()
            .unwrap();
        assert_eq!(grant.ldat, LdatIndex(1));
        assert_eq!(pool.stats().packs, 1);
    }

    #[test]
    fn deallocate_restores_free_space_and_temp_accounting() {
        let mut pool = pool(&[(1, 100)]);
        let grant = pool
            .allocate_fixed_tracks(&[], 25, true)
            .unwrap()
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.free_tracks, 75);
        assert_eq!(stats.temporary_tracks, 25);

        pool.deallocate_fixed_tracks(grant, true).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.free_tracks, 100);
        assert_eq!(stats.temporary_tracks, 0);

        // Double release is an invariant violation.
        let err = pool.deallocate_fixed_tracks(grant, true).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn removable_detection() {
        let mut pool = FixedPool::new();
        pool.add_pack(&PackSpec {
            ldat: LdatIndex(9),
            total_tracks: 10,
            is_fixed: false,
            in_fixed_pool: false,
        })
        .unwrap();
        assert!(pool.is_removable(LdatIndex(9)));
        assert!(!pool.is_removable(LdatIndex(1)));
    }
}
