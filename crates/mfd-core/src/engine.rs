//! The allocation and catalog engine.
//!
//! One mutex guards the fixed pool, the directory allocator, the catalog
//! and the extent maps of assigned cycles. Directory writes go through to
//! the sector device before the lock is released; only holds for space
//! drop the lock while a request is in flight.

use crate::config::EngineConfig;
use crate::hold::{AlwaysHold, HoldNotice, HoldObserver};
use crate::request::{
    AssignRequest, Assigned, CatalogRequest, CycleAttributes, FileCycleInfo, FileSetInfo,
    FreeOutcome, FreeRequest, ReserveRequest, TemporaryFile, TemporaryRequest, TrackRequest,
};
use mfd_alloc::{DirectoryAllocator, FixedPool, PackSpec, PoolStats, TrackGrant};
use mfd_block::SectorDevice;
use mfd_catalog::{Catalog, Cataloged, Credentials, CycleSpec, NewCycle, SectorSource};
use mfd_error::{MfdError, Result};
use mfd_extent::{DescriptorChain, FileAllocationEntry, FileExtentMap};
use mfd_ondisk::{DescriptorRecord, FileCycle, FileCycleKind, Granularity};
use mfd_types::{LdatIndex, MAX_FILE_TRACKS, SectorAddress, TrackId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ── Internal state ──────────────────────────────────────────────────────────

/// Lead and main items come from the directory allocator, which grows
/// from the fixed pool.
struct DirectorySectors<'a> {
    directory: &'a mut DirectoryAllocator,
    pool: &'a mut FixedPool,
}

impl SectorSource for DirectorySectors<'_> {
    fn allocate_sector(&mut self) -> Result<SectorAddress> {
        self.directory.allocate_sector(self.pool)
    }

    fn release_sector(&mut self, addr: SectorAddress) -> Result<()> {
        self.directory.release_sector(self.pool, addr)
    }
}

/// Extent map and descriptor chain of a cycle in use.
#[derive(Debug, Default)]
struct OpenCycle {
    map: FileExtentMap,
    chain: DescriptorChain,
    /// Assignments plus creations in progress.
    holders: u32,
}

#[derive(Debug)]
struct EngineState {
    pool: FixedPool,
    directory: DirectoryAllocator,
    catalog: Catalog,
    open: BTreeMap<SectorAddress, OpenCycle>,
}

/// Mass-storage attributes of a cycle.
#[derive(Debug, Clone, Copy)]
struct MassStorage {
    granularity: Granularity,
    initial_reserve: u64,
    max_granules: u64,
    highest_track_written: u64,
}

impl MassStorage {
    fn of(cycle: &FileCycle) -> Result<Self> {
        match &cycle.kind {
            FileCycleKind::MassStorage {
                granularity,
                initial_reserve,
                max_granules,
                highest_track_written,
                ..
            } => Ok(Self {
                granularity: *granularity,
                initial_reserve: *initial_reserve,
                max_granules: *max_granules,
                highest_track_written: *highest_track_written,
            }),
            FileCycleKind::Tape { .. } => Err(MfdError::InvalidRequest(format!(
                "{}*{}({}) is a tape file",
                cycle.qualifier, cycle.filename, cycle.absolute_cycle
            ))),
        }
    }

    fn reserve_tracks(self) -> Result<u64> {
        granules_to_tracks(self.initial_reserve, self.granularity)
    }
}

// ── Granule arithmetic ──────────────────────────────────────────────────────

fn granules_to_tracks(granules: u64, granularity: Granularity) -> Result<u64> {
    granules
        .checked_mul(granularity.tracks_per_granule())
        .ok_or_else(|| MfdError::InvalidRequest(format!("{granules} granules overflow")))
}

/// Granules needed to cover file tracks `0..tracks`.
fn granules_spanning(tracks: u64, granularity: Granularity) -> u64 {
    tracks.div_ceil(granularity.tracks_per_granule())
}

/// Widen `[file_track, file_track+count)` to whole granules.
fn granule_span(
    granularity: Granularity,
    file_track: TrackId,
    count: u64,
) -> Result<(TrackId, u64)> {
    if count == 0 {
        return Err(MfdError::InvalidRequest("track count is zero".to_owned()));
    }
    let end = file_track
        .0
        .checked_add(count)
        .ok_or_else(|| MfdError::InvalidRequest("track span overflows".to_owned()))?;
    let per = granularity.tracks_per_granule();
    let start = file_track.0 / per * per;
    let end = granules_to_tracks(end.div_ceil(per), granularity)?;
    if end > MAX_FILE_TRACKS {
        return Err(MfdError::InvalidRequest(format!(
            "file tracks up to {end} exceed the addressable {MAX_FILE_TRACKS}"
        )));
    }
    Ok((TrackId(start), end - start))
}

/// Refuse a maximum size whose word offsets would not fit 36 bits.
fn check_addressable(max_granules: u64, granularity: Granularity) -> Result<()> {
    let ceiling = granularity.addressable_granules();
    if max_granules > ceiling {
        return Err(MfdError::InvalidRequest(format!(
            "maximum of {max_granules} granules exceeds the addressable {ceiling}"
        )));
    }
    Ok(())
}

// ── Extent helpers ──────────────────────────────────────────────────────────

/// Allocate every hole in `[start, start+count)`.
///
/// Tracks granted before a shortage stay in the map, so a retry only asks
/// for what is still missing.
fn fill_holes(
    pool: &mut FixedPool,
    map: &mut FileExtentMap,
    packs: &[LdatIndex],
    start: TrackId,
    count: u64,
    temporary: bool,
) -> Result<u64> {
    let holes: Vec<FileAllocationEntry> = map
        .file_allocation_entries(start, count)
        .into_iter()
        .filter(|e| e.is_hole())
        .collect();
    let mut granted = 0_u64;
    for hole in holes {
        let mut file_track = hole.file_start.0;
        let mut remaining = hole.count;
        while remaining > 0 {
            let Some(grant) = pool.allocate_fixed_tracks(packs, remaining, temporary)? else {
                debug!(granted, remaining, "fill_holes_short");
                return Err(MfdError::NoSpace);
            };
            if !map.allocated(TrackId(file_track), grant.count, grant.ldat, grant.device_track) {
                pool.deallocate_fixed_tracks(grant, temporary)?;
                return Err(MfdError::Invariant(format!(
                    "grant for file track {file_track} overlaps an existing extent"
                )));
            }
            file_track += grant.count;
            remaining -= grant.count;
            granted += grant.count;
        }
    }
    Ok(granted)
}

/// Release every allocated track in `[start, start+count)`; holes are
/// skipped.
fn release_span(
    pool: &mut FixedPool,
    map: &mut FileExtentMap,
    start: TrackId,
    count: u64,
    temporary: bool,
) -> Result<u64> {
    let mut released = 0_u64;
    for piece in map.file_allocation_entries(start, count) {
        let Some((ldat, device_track)) = piece.location else {
            continue;
        };
        if !map.released(piece.file_start, piece.count) {
            return Err(MfdError::Invariant(format!(
                "file tracks {}+{} vanished during release",
                piece.file_start, piece.count
            )));
        }
        pool.deallocate_fixed_tracks(
            TrackGrant {
                ldat,
                device_track,
                count: piece.count,
            },
            temporary,
        )?;
        released += piece.count;
    }
    Ok(released)
}

fn release_all(pool: &mut FixedPool, map: &FileExtentMap, temporary: bool) -> Result<u64> {
    let mut released = 0_u64;
    for extent in map.extents() {
        pool.deallocate_fixed_tracks(
            TrackGrant {
                ldat: extent.ldat,
                device_track: extent.device_start,
                count: extent.count,
            },
            temporary,
        )?;
        released += extent.count;
    }
    Ok(released)
}

fn not_found(main_item: SectorAddress) -> MfdError {
    MfdError::NotFound(format!("main item {main_item}"))
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Storage allocation and master file directory services.
pub struct Engine {
    state: Mutex<EngineState>,
    device: Arc<dyn SectorDevice>,
    config: EngineConfig,
    terminating: AtomicBool,
    observer: Arc<dyn HoldObserver>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("terminating", &self.terminating.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// An engine with no packs online and an empty catalog.
    pub fn new(config: EngineConfig, device: Arc<dyn SectorDevice>) -> Result<Self> {
        config.validate()?;
        info!(
            max_cycle_range = config.max_cycle_range,
            hold_max_polls = config.hold_max_polls,
            "engine_started"
        );
        Ok(Self {
            state: Mutex::new(EngineState {
                pool: FixedPool::new(),
                directory: DirectoryAllocator::new(),
                catalog: Catalog::new(config.max_cycle_range),
                open: BTreeMap::new(),
            }),
            device,
            config,
            terminating: AtomicBool::new(false),
            observer: Arc::new(AlwaysHold),
        })
    }

    /// Replace the hold observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn HoldObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Packs and lifecycle ─────────────────────────────────────────────────

    /// Add a pack to the pool and carve its directory reserve.
    pub fn bring_pack_online(&self, spec: &PackSpec) -> Result<()> {
        self.check_running()?;
        let mut state = self.state.lock();
        let EngineState {
            pool, directory, ..
        } = &mut *state;
        let reserve = self.config.directory_tracks_per_pack;
        if spec.is_fixed && spec.in_fixed_pool && reserve >= spec.total_tracks {
            return Err(MfdError::InvalidRequest(format!(
                "pack {} has {} tracks, too few for a {reserve}-track directory reserve",
                spec.ldat, spec.total_tracks
            )));
        }
        pool.add_pack(spec)?;
        if spec.is_fixed && spec.in_fixed_pool {
            directory.reserve_on_pack(pool, spec.ldat, reserve)?;
        }
        info!(
            ldat = spec.ldat.0,
            total_tracks = spec.total_tracks,
            fixed = spec.is_fixed,
            "pack_online"
        );
        Ok(())
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    /// Stop accepting requests; held requests give up at their next poll.
    pub fn shutdown(&self) -> Result<()> {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _state = self.state.lock();
        self.device.sync()?;
        info!("engine_shutdown");
        Ok(())
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_terminating() {
            return Err(MfdError::Terminating);
        }
        Ok(())
    }

    // ── Catalog operations ──────────────────────────────────────────────────

    /// Catalog a new cycle and allocate its initial reserve.
    pub fn catalog(&self, req: &CatalogRequest) -> Result<FileCycleInfo> {
        self.check_running()?;
        let cataloged = {
            let mut state = self.state.lock();
            self.create_cycle(
                &mut state,
                &req.qualifier,
                &req.filename,
                req.cycle,
                &req.credentials,
                &req.attributes,
                None,
            )?
        };
        self.allocate_initial_reserve(cataloged.main_item, req.attributes.hold)?;

        let mut state = self.state.lock();
        state.catalog.end_creation(cataloged.main_item);
        close(&mut state, cataloged.main_item);
        let cycle = state
            .catalog
            .cycle(cataloged.main_item)
            .ok_or_else(|| not_found(cataloged.main_item))?;
        Ok(FileCycleInfo::from_cycle(cataloged.main_item, cycle, None))
    }

    /// Assign a cycle to the caller, creating it when asked.
    pub fn assign(&self, req: &AssignRequest) -> Result<Assigned> {
        self.check_running()?;
        if let Some(attributes) = &req.create {
            let cataloged = {
                let mut state = self.state.lock();
                self.create_cycle(
                    &mut state,
                    &req.qualifier,
                    &req.filename,
                    req.cycle,
                    &req.credentials,
                    attributes,
                    Some(req.exclusive),
                )?
            };
            self.allocate_initial_reserve(cataloged.main_item, attributes.hold)?;
            let mut state = self.state.lock();
            state.catalog.end_creation(cataloged.main_item);
            return assigned(&state, cataloged.main_item, true);
        }

        let mut state = self.state.lock();
        let main_item = state.catalog.lookup(
            &req.qualifier,
            &req.filename,
            req.cycle,
            &req.credentials,
            !req.read_only,
        )?;
        if state.catalog.is_being_created(main_item) {
            return Err(MfdError::CycleConflict(format!(
                "{}*{} is still being created",
                req.qualifier, req.filename
            )));
        }
        let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
        if cycle.flags.to_be_dropped {
            return Err(MfdError::NotFound(format!(
                "{}*{} is being deleted",
                req.qualifier, req.filename
            )));
        }
        if cycle.current_assign_count > 0 && (cycle.flags.exclusive_use || req.exclusive) {
            debug!(
                main_item = main_item.0,
                assigned = cycle.current_assign_count,
                "exclusive_assignment_refused"
            );
            return Err(MfdError::ExclusiveUse);
        }
        if cycle.is_mass_storage() {
            self.open_cycle(&mut state, main_item)?;
        }
        let exclusive = req.exclusive;
        state.catalog.update_cycle(main_item, |c| {
            c.current_assign_count += 1;
            c.cumulative_assign_count = c.cumulative_assign_count.saturating_add(1);
            c.flags.exclusive_use |= exclusive;
        })?;
        self.write_catalog(&mut state.catalog)?;
        info!(
            qualifier = %req.qualifier,
            filename = %req.filename,
            main_item = main_item.0,
            exclusive,
            "cycle_assigned"
        );
        assigned(&state, main_item, false)
    }

    /// Give up one assignment.
    ///
    /// The last free makes a tentative cycle permanent (or drops it when
    /// deletion was asked for) and may trim tracks beyond the highest
    /// written one, never below the initial reserve.
    pub fn free(&self, req: &FreeRequest) -> Result<FreeOutcome> {
        self.check_running()?;
        let main_item = req.main_item;
        let mut state = self.state.lock();
        let cycle = state
            .catalog
            .cycle(main_item)
            .cloned()
            .ok_or_else(|| not_found(main_item))?;
        if cycle.current_assign_count == 0 {
            return Err(MfdError::InvalidRequest(format!(
                "main item {main_item} is not assigned"
            )));
        }

        if req.delete {
            state.catalog.mark_to_be_dropped(main_item)?;
        } else if cycle.flags.to_be_cataloged {
            state.catalog.mark_cataloged(main_item)?;
        }
        let remaining = cycle.current_assign_count - 1;
        state.catalog.update_cycle(main_item, |c| {
            c.current_assign_count = remaining;
            if remaining == 0 {
                c.flags.exclusive_use = false;
            }
        })?;

        let dropping = req.delete || cycle.flags.to_be_dropped;
        if remaining > 0 {
            if cycle.is_mass_storage() {
                close(&mut state, main_item);
            }
            self.write_catalog(&mut state.catalog)?;
            return Ok(FreeOutcome::StillAssigned {
                current_assign_count: remaining,
            });
        }

        if dropping {
            let tracks_released = self.discard_cycle(&mut state, main_item)?;
            info!(main_item = main_item.0, tracks_released, "cycle_freed_and_dropped");
            return Ok(FreeOutcome::Dropped { tracks_released });
        }

        let mut tracks_released = 0;
        if cycle.is_mass_storage() {
            let trim = req
                .release_unused_reserve
                .unwrap_or(self.config.release_unused_reserve_on_free);
            if trim {
                tracks_released = trim_unused(&mut state, main_item, MassStorage::of(&cycle)?)?;
            }
            self.commit_cycle(&mut state, main_item)?;
            close(&mut state, main_item);
        } else {
            self.write_catalog(&mut state.catalog)?;
        }
        info!(main_item = main_item.0, tracks_released, "cycle_freed");
        Ok(FreeOutcome::Released { tracks_released })
    }

    /// Delete a cycle now, or once its last assignment is freed.
    pub fn delete(
        &self,
        qualifier: &str,
        filename: &str,
        cycle: CycleSpec,
        creds: &Credentials,
    ) -> Result<FreeOutcome> {
        self.check_running()?;
        let mut state = self.state.lock();
        let main_item = state.catalog.lookup(qualifier, filename, cycle, creds, true)?;
        if state.catalog.is_being_created(main_item) {
            return Err(MfdError::CycleConflict(format!(
                "{qualifier}*{filename} is still being created"
            )));
        }
        let assigned = state
            .catalog
            .cycle(main_item)
            .map_or(0, |c| c.current_assign_count);
        if assigned > 0 {
            state.catalog.mark_to_be_dropped(main_item)?;
            self.write_catalog(&mut state.catalog)?;
            info!(main_item = main_item.0, assigned, "cycle_drop_deferred");
            return Ok(FreeOutcome::StillAssigned {
                current_assign_count: assigned,
            });
        }
        let tracks_released = self.discard_cycle(&mut state, main_item)?;
        Ok(FreeOutcome::Dropped { tracks_released })
    }

    /// Describe a cycle without assigning it.
    pub fn lookup(
        &self,
        qualifier: &str,
        filename: &str,
        cycle: CycleSpec,
        creds: &Credentials,
    ) -> Result<FileCycleInfo> {
        let state = self.state.lock();
        let main_item = state.catalog.lookup(qualifier, filename, cycle, creds, false)?;
        let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
        Ok(FileCycleInfo::from_cycle(
            main_item,
            cycle,
            state.open.get(&main_item).map(|o| &o.map),
        ))
    }

    pub fn file_set_info(
        &self,
        qualifier: &str,
        filename: &str,
        creds: &Credentials,
    ) -> Result<FileSetInfo> {
        let state = self.state.lock();
        let set = state
            .catalog
            .file_set(qualifier, filename)
            .ok_or_else(|| MfdError::NotFound(format!("{qualifier}*{filename}")))?;
        creds.authorize_file_set(set, false)?;
        Ok(FileSetInfo {
            qualifier: set.qualifier.clone(),
            filename: set.filename.clone(),
            project_id: set.project_id.clone(),
            max_cycle_range: set.max_cycle_range,
            current_range: u32::try_from(set.current_range()).unwrap_or(u32::MAX),
            plus_one_exists: set.plus_one_exists,
            guarded: set.guarded,
            cycles: set.cycles().map(|s| s.absolute_cycle.get()).collect(),
        })
    }

    pub fn set_max_cycle_range(
        &self,
        qualifier: &str,
        filename: &str,
        max: u32,
        creds: &Credentials,
    ) -> Result<()> {
        self.check_running()?;
        let mut state = self.state.lock();
        state
            .catalog
            .set_max_cycle_range(qualifier, filename, max, creds)?;
        self.write_catalog(&mut state.catalog)
    }

    // ── Track operations on assigned cycles ─────────────────────────────────

    /// Allocate the unallocated tracks of a span, widened to whole
    /// granules. Returns the file's allocated track count afterwards.
    pub fn allocate_tracks(&self, req: &TrackRequest) -> Result<u64> {
        self.check_running()?;
        let main_item = req.main_item;
        let (start, count) = {
            let state = self.state.lock();
            let attrs = assigned_mass_storage(&state, main_item)?;
            let (start, count) = granule_span(attrs.granularity, req.file_track, req.count)?;
            let needed = granules_spanning(start.0 + count, attrs.granularity);
            if needed > attrs.max_granules {
                return Err(MfdError::MaximumExceeded {
                    requested: needed,
                    maximum: attrs.max_granules,
                });
            }
            (start, count)
        };

        self.with_hold(req.hold, "allocate_tracks", count, |state| {
            let file = state.open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
            let filled = fill_holes(&mut state.pool, &mut file.map, &[], start, count, false);
            // Partial grants are recorded even when the span could not be filled.
            self.commit_cycle(state, main_item)?;
            let granted = filled?;
            let total = state
                .open
                .get(&main_item)
                .map_or(0, |o| o.map.allocated_track_count());
            debug!(main_item = main_item.0, granted, total, "tracks_allocated");
            Ok(total)
        })
    }

    /// Release the allocated tracks of a span, widened to whole granules.
    /// Returns the number of tracks released.
    pub fn release_tracks(&self, req: &TrackRequest) -> Result<u64> {
        self.check_running()?;
        let main_item = req.main_item;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let attrs = assigned_mass_storage(state, main_item)?;
        let (start, count) = granule_span(attrs.granularity, req.file_track, req.count)?;
        let file = state.open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
        let released = release_span(&mut state.pool, &mut file.map, start, count, false)?;
        self.commit_cycle(state, main_item)?;
        debug!(main_item = main_item.0, released, "tracks_released");
        Ok(released)
    }

    /// Change the initial reserve or maximum size of an assigned cycle.
    pub fn change_reserve(
        &self,
        main_item: SectorAddress,
        req: &ReserveRequest,
    ) -> Result<FileCycleInfo> {
        self.check_running()?;
        let reserve_tracks = {
            let mut state = self.state.lock();
            let attrs = assigned_mass_storage(&state, main_item)?;
            let highest_granule = state
                .open
                .get(&main_item)
                .and_then(|o| o.map.highest_track_allocated())
                .map_or(0, |t| granules_spanning(t.0 + 1, attrs.granularity));
            let max = req.max_granules.unwrap_or(attrs.max_granules);
            let initial = req.initial_reserve.unwrap_or(attrs.initial_reserve);
            if max < highest_granule {
                return Err(MfdError::MaximumExceeded {
                    requested: highest_granule,
                    maximum: max,
                });
            }
            if initial > max {
                return Err(MfdError::InvalidRequest(format!(
                    "initial reserve {initial} exceeds maximum {max}"
                )));
            }
            check_addressable(max, attrs.granularity)?;
            state.catalog.update_cycle(main_item, |c| {
                if let FileCycleKind::MassStorage {
                    initial_reserve,
                    max_granules,
                    ..
                } = &mut c.kind
                {
                    *initial_reserve = initial;
                    *max_granules = max;
                }
            })?;
            self.write_catalog(&mut state.catalog)?;
            info!(main_item = main_item.0, initial, max, "reserve_changed");
            granules_to_tracks(initial, attrs.granularity)?
        };

        if reserve_tracks > 0 {
            self.with_hold(req.hold, "change_reserve", reserve_tracks, |state| {
                let file = state.open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
                let filled = fill_holes(
                    &mut state.pool,
                    &mut file.map,
                    &[],
                    TrackId::ZERO,
                    reserve_tracks,
                    false,
                );
                self.commit_cycle(state, main_item)?;
                filled.map(|_| ())
            })?;
        }
        let state = self.state.lock();
        let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
        Ok(FileCycleInfo::from_cycle(
            main_item,
            cycle,
            state.open.get(&main_item).map(|o| &o.map),
        ))
    }

    /// Record that `file_track` has been written.
    pub fn note_written(&self, main_item: SectorAddress, file_track: TrackId) -> Result<()> {
        self.check_running()?;
        let mut state = self.state.lock();
        assigned_mass_storage(&state, main_item)?;
        let located = state
            .open
            .get(&main_item)
            .and_then(|o| o.map.convert_track_id(file_track))
            .is_some();
        if !located {
            return Err(MfdError::InvalidRequest(format!(
                "file track {file_track} is not allocated"
            )));
        }
        state.catalog.update_cycle(main_item, |c| {
            if let FileCycleKind::MassStorage {
                highest_track_written,
                ..
            } = &mut c.kind
            {
                *highest_track_written = (*highest_track_written).max(file_track.0 + 1);
            }
        })?;
        self.write_catalog(&mut state.catalog)
    }

    /// Device location of a file track of an assigned cycle.
    pub fn convert_track(
        &self,
        main_item: SectorAddress,
        file_track: TrackId,
    ) -> Result<Option<(LdatIndex, TrackId)>> {
        let state = self.state.lock();
        let file = state.open.get(&main_item).ok_or_else(|| {
            MfdError::InvalidRequest(format!("main item {main_item} is not assigned"))
        })?;
        Ok(file.map.convert_track_id(file_track))
    }

    /// Located spans and holes covering `[file_start, file_start+count)`.
    pub fn file_allocations(
        &self,
        main_item: SectorAddress,
        file_start: TrackId,
        count: u64,
    ) -> Result<Vec<FileAllocationEntry>> {
        let state = self.state.lock();
        let file = state.open.get(&main_item).ok_or_else(|| {
            MfdError::InvalidRequest(format!("main item {main_item} is not assigned"))
        })?;
        Ok(file.map.file_allocation_entries(file_start, count))
    }

    // ── Temporary files ─────────────────────────────────────────────────────

    pub fn create_temporary(&self, req: &TemporaryRequest) -> Result<TemporaryFile> {
        self.check_running()?;
        let mut file = TemporaryFile {
            name: req.name.clone(),
            granularity: req.granularity,
            max_granules: req.max_granules,
            map: FileExtentMap::new(),
            packs: req.packs.clone(),
        };
        check_addressable(req.max_granules, req.granularity)?;
        if req.initial_reserve > req.max_granules {
            return Err(MfdError::MaximumExceeded {
                requested: req.initial_reserve,
                maximum: req.max_granules,
            });
        }
        let tracks = granules_to_tracks(req.initial_reserve, req.granularity)?;
        if tracks > 0 {
            if let Err(err) = self.allocate_temporary(&mut file, TrackId::ZERO, tracks, req.hold) {
                let mut state = self.state.lock();
                release_all(&mut state.pool, &file.map, true)?;
                return Err(err);
            }
        }
        debug!(name = %req.name, tracks, "temporary_created");
        Ok(file)
    }

    /// Returns the file's allocated track count afterwards.
    pub fn allocate_temporary(
        &self,
        file: &mut TemporaryFile,
        file_track: TrackId,
        count: u64,
        hold: bool,
    ) -> Result<u64> {
        self.check_running()?;
        let (start, count) = granule_span(file.granularity, file_track, count)?;
        let needed = granules_spanning(start.0 + count, file.granularity);
        if needed > file.max_granules {
            return Err(MfdError::MaximumExceeded {
                requested: needed,
                maximum: file.max_granules,
            });
        }
        self.with_hold(hold, "allocate_temporary", count, |state| {
            fill_holes(&mut state.pool, &mut file.map, &file.packs, start, count, true)?;
            Ok(file.map.allocated_track_count())
        })
    }

    pub fn release_temporary(
        &self,
        file: &mut TemporaryFile,
        file_track: TrackId,
        count: u64,
    ) -> Result<u64> {
        let (start, count) = granule_span(file.granularity, file_track, count)?;
        let mut state = self.state.lock();
        release_span(&mut state.pool, &mut file.map, start, count, true)
    }

    /// Discard a temporary file, returning the tracks it held.
    pub fn free_temporary(&self, file: TemporaryFile) -> Result<u64> {
        let mut state = self.state.lock();
        let released = release_all(&mut state.pool, &file.map, true)?;
        debug!(name = %file.name, released, "temporary_freed");
        Ok(released)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Run `attempt` under the lock, retrying on out-of-space while the
    /// request may hold.
    fn with_hold<T>(
        &self,
        hold: bool,
        operation: &'static str,
        tracks_wanted: u64,
        mut attempt: impl FnMut(&mut EngineState) -> Result<T>,
    ) -> Result<T> {
        let mut polls = 0_u32;
        loop {
            self.check_running()?;
            let outcome = {
                let mut state = self.state.lock();
                attempt(&mut *state)
            };
            match outcome {
                Err(MfdError::NoSpace) if hold => {
                    if polls >= self.config.hold_max_polls {
                        warn!(operation, tracks_wanted, polls, "hold_expired");
                        return Err(MfdError::NoSpace);
                    }
                    let notice = HoldNotice {
                        operation,
                        tracks_wanted,
                        polls,
                    };
                    if !self.observer.keep_holding(&notice) {
                        info!(operation, tracks_wanted, polls, "hold_declined");
                        return Err(MfdError::OperatorDeclined);
                    }
                    if polls == 0 {
                        warn!(operation, tracks_wanted, "held_for_space");
                    }
                    polls += 1;
                    std::thread::sleep(self.config.hold_poll_interval());
                }
                other => return other,
            }
        }
    }

    /// Catalog a cycle and register it as held by the caller.
    ///
    /// `assign` carries the exclusive flag when the creation is also an
    /// assignment, in which case the cycle stays tentative until freed.
    #[allow(clippy::too_many_arguments)]
    fn create_cycle(
        &self,
        state: &mut EngineState,
        qualifier: &str,
        filename: &str,
        cycle: CycleSpec,
        creds: &Credentials,
        attributes: &CycleAttributes,
        assign: Option<bool>,
    ) -> Result<Cataloged> {
        let kind = attributes.media.to_kind();
        if let FileCycleKind::MassStorage {
            initial_reserve,
            max_granules,
            ..
        } = &kind
        {
            if initial_reserve > max_granules {
                return Err(MfdError::MaximumExceeded {
                    requested: *initial_reserve,
                    maximum: *max_granules,
                });
            }
        }
        let new = NewCycle {
            qualifier: qualifier.to_owned(),
            filename: filename.to_owned(),
            cycle,
            read_key: attributes.read_key.clone(),
            write_key: attributes.write_key.clone(),
            guarded: attributes.guarded,
            private: attributes.private,
            max_cycle_range: attributes.max_cycle_range,
            to_be_cataloged: assign.is_some(),
            kind,
        };
        let cataloged = {
            let EngineState {
                pool,
                directory,
                catalog,
                ..
            } = &mut *state;
            catalog.catalog_cycle(&new, creds, &mut DirectorySectors { directory, pool })?
        };
        if let Some(dropped) = &cataloged.dropped {
            let released = self.release_storage(state, dropped.main_item, dropped.cycle.dad_head)?;
            info!(
                main_item = dropped.main_item.0,
                cycle = dropped.cycle.absolute_cycle,
                released,
                "oldest_cycle_dropped"
            );
        }

        let main_item = cataloged.main_item;
        if matches!(new.kind, FileCycleKind::MassStorage { .. }) {
            state.open.insert(
                main_item,
                OpenCycle {
                    holders: 1,
                    ..OpenCycle::default()
                },
            );
        }
        if let Some(exclusive) = assign {
            state.catalog.update_cycle(main_item, |c| {
                c.current_assign_count = 1;
                c.cumulative_assign_count = 1;
                c.flags.exclusive_use = exclusive;
            })?;
        }
        self.write_catalog(&mut state.catalog)?;
        state.catalog.begin_creation(main_item);
        Ok(cataloged)
    }

    /// Allocate a fresh cycle's initial reserve, discarding the cycle if
    /// the reserve cannot be met. A discarded cycle is no longer pinned.
    fn allocate_initial_reserve(&self, main_item: SectorAddress, hold: bool) -> Result<()> {
        let tracks = {
            let state = self.state.lock();
            let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
            match MassStorage::of(cycle) {
                Ok(attrs) => attrs.reserve_tracks()?,
                Err(_) => 0,
            }
        };
        if tracks == 0 {
            return Ok(());
        }
        let result = self.with_hold(hold, "initial_reserve", tracks, |state| {
            let file = state.open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
            fill_holes(&mut state.pool, &mut file.map, &[], TrackId::ZERO, tracks, false)?;
            self.commit_cycle(state, main_item)
        });
        if let Err(err) = result {
            let mut state = self.state.lock();
            state.catalog.end_creation(main_item);
            if state.catalog.cycle(main_item).is_some() {
                if let Err(cleanup) = self.discard_cycle(&mut state, main_item) {
                    error!(main_item = main_item.0, error = %cleanup, "reserve_rollback_failed");
                }
            }
            warn!(main_item = main_item.0, tracks, error = %err, "initial_reserve_failed");
            return Err(err);
        }
        Ok(())
    }

    /// Take a hold on a cycle's extent map, loading it on first use.
    fn open_cycle(&self, state: &mut EngineState, main_item: SectorAddress) -> Result<()> {
        if let Some(file) = state.open.get_mut(&main_item) {
            file.holders += 1;
            return Ok(());
        }
        let head = state
            .catalog
            .cycle(main_item)
            .ok_or_else(|| not_found(main_item))?
            .dad_head;
        let mut file = self.load_descriptors(head)?;
        file.holders = 1;
        state.open.insert(main_item, file);
        Ok(())
    }

    /// Read a descriptor chain from the device and rebuild its extents.
    fn load_descriptors(&self, head: Option<SectorAddress>) -> Result<OpenCycle> {
        let mut records = Vec::new();
        let mut seen = BTreeSet::new();
        let mut previous = None;
        let mut next = head;
        while let Some(addr) = next {
            if !seen.insert(addr) || records.len() >= self.config.max_descriptor_records {
                error!(sector = addr.0, "descriptor_chain_loops");
                return Err(MfdError::Corruption {
                    sector: addr.0,
                    detail: "descriptor chain loops or is too long".to_owned(),
                });
            }
            let buf = self.device.read_sector(addr)?;
            let record = DescriptorRecord::parse_from_bytes(buf.as_slice()).map_err(|e| {
                error!(sector = addr.0, error = %e, "descriptor_record_unreadable");
                MfdError::Corruption {
                    sector: addr.0,
                    detail: e.to_string(),
                }
            })?;
            if record.backward != previous {
                return Err(MfdError::Corruption {
                    sector: addr.0,
                    detail: "backward link does not name the previous record".to_owned(),
                });
            }
            previous = Some(addr);
            next = record.forward;
            records.push((addr, record));
        }
        let chain = DescriptorChain::from_loaded(records);
        let map = FileExtentMap::from_descriptors(&chain)?;
        debug!(
            head = head.map(|h| h.0),
            records = chain.live_count(),
            tracks = map.allocated_track_count(),
            "descriptors_loaded"
        );
        Ok(OpenCycle {
            map,
            chain,
            holders: 0,
        })
    }

    /// Bring a cycle's descriptor chain and main item in line with its
    /// extent map and write them out.
    fn commit_cycle(&self, state: &mut EngineState, main_item: SectorAddress) -> Result<()> {
        let EngineState {
            pool,
            directory,
            catalog,
            open,
        } = state;
        let file = open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
        let pool_ref: &FixedPool = pool;
        file.map
            .synchronize_descriptors(&mut file.chain, |ldat| pool_ref.is_removable(ldat))?;

        if file.chain.is_dirty() {
            for index in file.chain.unbound() {
                let addr = directory.allocate_sector(pool)?;
                file.chain.bind_address(index, addr)?;
            }
            file.chain.link()?;
            for (addr, record) in file.chain.pending_writes()? {
                let bytes = record.to_bytes().map_err(|e| {
                    MfdError::Invariant(format!("descriptor record {addr} does not encode: {e}"))
                })?;
                self.device.write_sector(addr, &bytes)?;
            }
            for addr in file.chain.pending_deletes() {
                directory.release_sector(pool, addr)?;
            }
            file.chain.mark_committed();
        }

        let head = file.chain.head();
        let highest = file.map.highest_track_allocated();
        catalog.update_cycle(main_item, |c| {
            c.dad_head = head;
            if let FileCycleKind::MassStorage {
                granularity,
                highest_granule_assigned,
                ..
            } = &mut c.kind
            {
                *highest_granule_assigned =
                    highest.map_or(0, |t| granules_spanning(t.0 + 1, *granularity));
            }
        })?;
        self.write_catalog(catalog)
    }

    /// Return a cycle's tracks and descriptor sectors.
    fn release_storage(
        &self,
        state: &mut EngineState,
        main_item: SectorAddress,
        head: Option<SectorAddress>,
    ) -> Result<u64> {
        let file = match state.open.remove(&main_item) {
            Some(file) => file,
            None => self.load_descriptors(head)?,
        };
        let released = release_all(&mut state.pool, &file.map, false)?;
        for record in file.chain.records() {
            if let Some(addr) = record.address {
                state.directory.release_sector(&mut state.pool, addr)?;
            }
        }
        debug!(main_item = main_item.0, released, "cycle_storage_released");
        Ok(released)
    }

    /// Release a cycle's storage and remove it from the catalog.
    fn discard_cycle(&self, state: &mut EngineState, main_item: SectorAddress) -> Result<u64> {
        let head = state
            .catalog
            .cycle(main_item)
            .ok_or_else(|| not_found(main_item))?
            .dad_head;
        let released = self.release_storage(state, main_item, head)?;
        let EngineState {
            pool,
            directory,
            catalog,
            ..
        } = state;
        let cycle = catalog.drop_cycle(main_item, &mut DirectorySectors { directory, pool })?;
        self.write_catalog(catalog)?;
        info!(
            qualifier = %cycle.qualifier,
            filename = %cycle.filename,
            cycle = cycle.absolute_cycle,
            released,
            "cycle_dropped"
        );
        Ok(released)
    }

    fn write_catalog(&self, catalog: &mut Catalog) -> Result<()> {
        for (addr, bytes) in catalog.flush()? {
            self.device.write_sector(addr, &bytes)?;
        }
        Ok(())
    }
}

// ── Free functions over locked state ────────────────────────────────────────

/// Drop one hold on a cycle's extent map.
fn close(state: &mut EngineState, main_item: SectorAddress) {
    if let Some(file) = state.open.get_mut(&main_item) {
        file.holders = file.holders.saturating_sub(1);
        if file.holders == 0 {
            state.open.remove(&main_item);
        }
    }
}

fn assigned(state: &EngineState, main_item: SectorAddress, created: bool) -> Result<Assigned> {
    let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
    Ok(Assigned {
        main_item,
        absolute_cycle: cycle.absolute_cycle,
        created,
        info: FileCycleInfo::from_cycle(
            main_item,
            cycle,
            state.open.get(&main_item).map(|o| &o.map),
        ),
    })
}

fn assigned_mass_storage(state: &EngineState, main_item: SectorAddress) -> Result<MassStorage> {
    let cycle = state.catalog.cycle(main_item).ok_or_else(|| not_found(main_item))?;
    if cycle.current_assign_count == 0 || !state.open.contains_key(&main_item) {
        return Err(MfdError::InvalidRequest(format!(
            "main item {main_item} is not assigned"
        )));
    }
    MassStorage::of(cycle)
}

/// Release tracks past the highest written track, keeping the initial
/// reserve.
fn trim_unused(
    state: &mut EngineState,
    main_item: SectorAddress,
    attrs: MassStorage,
) -> Result<u64> {
    let file = state.open.get_mut(&main_item).ok_or_else(|| not_found(main_item))?;
    let Some(highest) = file.map.highest_track_allocated() else {
        return Ok(0);
    };
    let per = attrs.granularity.tracks_per_granule();
    let keep = attrs
        .highest_track_written
        .div_ceil(per)
        .saturating_mul(per)
        .max(attrs.reserve_tracks()?);
    let end = highest.0 + 1;
    if end <= keep {
        return Ok(0);
    }
    release_span(&mut state.pool, &mut file.map, TrackId(keep), end - keep, false)
}
