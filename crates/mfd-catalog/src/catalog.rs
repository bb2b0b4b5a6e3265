//! The in-memory master file directory.
//!
//! File sets are keyed by `(qualifier, filename)`; file cycles live in an
//! arena keyed by their main item sector. Every change marks the touched
//! lead and main items dirty; [`Catalog::flush`] encodes them for the
//! engine to write through to the directory.

use crate::access::Credentials;
use crate::cycle::{AbsoluteCycle, CycleSpec};
use crate::file_set::{CycleSlot, FileSet, Placement};
use crate::SectorSource;
use mfd_error::{MfdError, Result};
use mfd_ondisk::{
    CycleFlags, EQUIPMENT_CHARS, FileCycle, FileCycleKind, LEAD_PRIMARY_LINKS, MAX_CYCLE_LINKS,
    MAX_REELS, REEL_CHARS,
};
use mfd_types::SectorAddress;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

type SetKey = (String, String);

const NAME_CHARS: usize = 12;
const KEY_CHARS: usize = 8;

/// Request to create a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCycle {
    pub qualifier: String,
    pub filename: String,
    pub cycle: CycleSpec,
    /// Keys for a new file set; ignored when the set exists.
    pub read_key: String,
    pub write_key: String,
    pub guarded: bool,
    pub private: bool,
    /// Range for a new file set; the catalog default when `None`.
    pub max_cycle_range: Option<u32>,
    /// The cycle stays tentative until [`Catalog::mark_cataloged`].
    pub to_be_cataloged: bool,
    pub kind: FileCycleKind,
}

/// A cycle pushed out of its window by a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedCycle {
    pub main_item: SectorAddress,
    pub cycle: FileCycle,
}

/// Outcome of [`Catalog::catalog_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cataloged {
    pub main_item: SectorAddress,
    pub absolute_cycle: AbsoluteCycle,
    pub created_file_set: bool,
    /// Storage of this cycle (its DAD chain and tracks) is still held and
    /// must be released by the caller.
    pub dropped: Option<DroppedCycle>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    sets: BTreeMap<SetKey, FileSet>,
    cycles: BTreeMap<SectorAddress, FileCycle>,
    dirty_sets: BTreeSet<SetKey>,
    dirty_cycles: BTreeSet<SectorAddress>,
    /// Cycles whose creating request has not returned yet.
    in_flight: BTreeSet<SectorAddress>,
    default_max_cycle_range: u32,
}

impl Catalog {
    #[must_use]
    pub fn new(default_max_cycle_range: u32) -> Self {
        Self {
            default_max_cycle_range,
            ..Self::default()
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn file_set(&self, qualifier: &str, filename: &str) -> Option<&FileSet> {
        self.sets.get(&(qualifier.to_owned(), filename.to_owned()))
    }

    #[must_use]
    pub fn cycle(&self, main_item: SectorAddress) -> Option<&FileCycle> {
        self.cycles.get(&main_item)
    }

    #[must_use]
    pub fn file_set_count(&self) -> usize {
        self.sets.len()
    }

    #[must_use]
    pub fn cycle_count(&self) -> usize {
        self.cycles.len()
    }

    /// Resolve an existing cycle for reference, checking keys and privacy.
    ///
    /// Relative 0 and negative cycles count cataloged cycles only; relative
    /// +1 names the tentative next cycle.
    pub fn lookup(
        &self,
        qualifier: &str,
        filename: &str,
        spec: CycleSpec,
        creds: &Credentials,
        write: bool,
    ) -> Result<SectorAddress> {
        let spec = spec.validate()?;
        let set = self
            .file_set(qualifier, filename)
            .ok_or_else(|| MfdError::NotFound(format!("{qualifier}*{filename}")))?;
        creds.authorize_file_set(set, write)?;

        let settled = |s: &&CycleSlot| !s.to_be_cataloged && !s.to_be_dropped;
        let slot = match spec {
            CycleSpec::None => set.cycles().find(settled),
            CycleSpec::Relative(1) => set
                .cycles()
                .next()
                .filter(|s| set.plus_one_exists && s.to_be_cataloged),
            CycleSpec::Relative(n) => set
                .cycles()
                .filter(settled)
                .nth(n.unsigned_abs() as usize),
            CycleSpec::Absolute(n) => set
                .find(AbsoluteCycle::new(n)?)
                .filter(|s| !s.to_be_dropped),
        }
        .ok_or_else(|| MfdError::NotFound(format!("{qualifier}*{filename} cycle {spec:?}")))?;

        let cycle = self.cycle_of(slot.main_item)?;
        creds.authorize_cycle(cycle)?;
        Ok(slot.main_item)
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Create a cycle, creating its file set on first use.
    ///
    /// When the new cycle pushes exactly one existing cycle out of the
    /// window, that cycle is dropped here if it is unassigned, not queued
    /// for output and not private against the caller; otherwise the
    /// request is a cycle conflict.
    pub fn catalog_cycle(
        &mut self,
        req: &NewCycle,
        creds: &Credentials,
        sectors: &mut dyn SectorSource,
    ) -> Result<Cataloged> {
        let spec = req.cycle.validate()?;
        validate_text("qualifier", &req.qualifier, NAME_CHARS, false)?;
        validate_text("filename", &req.filename, NAME_CHARS, false)?;
        validate_text("project", &creds.project_id, NAME_CHARS, true)?;
        validate_text("account", &creds.account_id, NAME_CHARS, true)?;
        validate_kind(&req.kind)?;
        let key = (req.qualifier.clone(), req.filename.clone());

        let (absolute, placement) = match self.sets.get(&key) {
            Some(set) => {
                creds.authorize_file_set(set, true)?;
                let absolute = next_cycle_for(set, spec)?;
                let placement = set.plan_insert(absolute)?;
                if let Placement::Newer {
                    falling_off: Some(slot),
                    ..
                } = &placement
                {
                    self.check_droppable(slot, creds)?;
                }
                (absolute, placement)
            }
            None => {
                let absolute = match spec {
                    CycleSpec::None | CycleSpec::Relative(1) => AbsoluteCycle::FIRST,
                    CycleSpec::Absolute(n) => AbsoluteCycle::new(n)?,
                    CycleSpec::Relative(_) => {
                        return Err(MfdError::NotFound(format!(
                            "{}*{}",
                            req.qualifier, req.filename
                        )));
                    }
                };
                (absolute, Placement::First)
            }
        };

        let created_file_set = !self.sets.contains_key(&key);
        if created_file_set {
            validate_text("read key", &req.read_key, KEY_CHARS, true)?;
            validate_text("write key", &req.write_key, KEY_CHARS, true)?;
            let max = req.max_cycle_range.unwrap_or(self.default_max_cycle_range);
            if max == 0 || max as usize > MAX_CYCLE_LINKS {
                return Err(MfdError::InvalidRequest(format!(
                    "max cycle range {max} outside 1..=32"
                )));
            }
            let lead = sectors.allocate_sector()?;
            let mut set = FileSet::new(lead, &req.qualifier, &req.filename, &creds.project_id, max);
            set.read_key.clone_from(&req.read_key);
            set.write_key.clone_from(&req.write_key);
            set.guarded = req.guarded;
            self.sets.insert(key.clone(), set);
        }

        let main_item = match sectors.allocate_sector() {
            Ok(addr) => addr,
            Err(err) => {
                if created_file_set {
                    if let Some(set) = self.sets.remove(&key) {
                        sectors.release_sector(set.address)?;
                    }
                }
                return Err(err);
            }
        };

        let dropped = match &placement {
            Placement::Newer {
                falling_off: Some(slot),
                ..
            } => Some(self.detach_cycle(slot.main_item, sectors)?),
            _ => None,
        };

        let set = self.set_mut(&key)?;
        let cycle = FileCycle {
            qualifier: req.qualifier.clone(),
            filename: req.filename.clone(),
            project_id: creds.project_id.clone(),
            account_id: creds.account_id.clone(),
            lead_item: set.address,
            dad_head: None,
            absolute_cycle: absolute.get(),
            flags: CycleFlags {
                private: req.private,
                guarded: set.guarded,
                to_be_cataloged: req.to_be_cataloged,
                ..CycleFlags::default()
            },
            current_assign_count: 0,
            cumulative_assign_count: 0,
            kind: req.kind.clone(),
        };
        set.insert(
            &placement,
            CycleSlot {
                absolute_cycle: absolute,
                main_item,
                to_be_cataloged: req.to_be_cataloged,
                to_be_dropped: false,
            },
        );
        if req.to_be_cataloged && set.highest() == Some(absolute) {
            set.plus_one_exists = true;
        }
        self.cycles.insert(main_item, cycle);
        self.fit_overflow(&key, sectors)?;
        self.dirty_sets.insert(key);
        self.dirty_cycles.insert(main_item);

        info!(
            qualifier = %req.qualifier,
            filename = %req.filename,
            cycle = absolute.get(),
            main_item = main_item.0,
            created_file_set,
            dropped = dropped.as_ref().map(|d| d.cycle.absolute_cycle),
            "cycle_cataloged"
        );
        Ok(Cataloged {
            main_item,
            absolute_cycle: absolute,
            created_file_set,
            dropped,
        })
    }

    /// Remove a cycle and its main item; the file set goes with its last
    /// cycle. The cycle's DAD chain and tracks remain the caller's to
    /// release.
    pub fn drop_cycle(
        &mut self,
        main_item: SectorAddress,
        sectors: &mut dyn SectorSource,
    ) -> Result<FileCycle> {
        let dropped = self.detach_cycle(main_item, sectors)?;
        let key = (dropped.cycle.qualifier.clone(), dropped.cycle.filename.clone());
        let empty = self.sets.get(&key).is_some_and(FileSet::is_empty);
        if empty {
            if let Some(set) = self.sets.remove(&key) {
                self.dirty_sets.remove(&key);
                sectors.release_sector(set.address)?;
                if let Some(overflow) = set.overflow {
                    sectors.release_sector(overflow)?;
                }
                info!(qualifier = %key.0, filename = %key.1, "file_set_removed");
            }
        } else {
            self.fit_overflow(&key, sectors)?;
            self.dirty_sets.insert(key);
        }
        Ok(dropped.cycle)
    }

    /// Make a tentative cycle permanent.
    pub fn mark_cataloged(&mut self, main_item: SectorAddress) -> Result<()> {
        let (key, absolute) = self.slot_key(main_item)?;
        let set = self.set_mut(&key)?;
        if let Some(slot) = set.find_mut(absolute) {
            slot.to_be_cataloged = false;
        }
        let pending = set.cycles().any(|s| s.to_be_cataloged);
        set.plus_one_exists = pending;
        self.dirty_sets.insert(key);
        self.update_cycle(main_item, |c| c.flags.to_be_cataloged = false)
    }

    /// Flag a cycle for deletion once its last assignment is freed.
    pub fn mark_to_be_dropped(&mut self, main_item: SectorAddress) -> Result<()> {
        let (key, absolute) = self.slot_key(main_item)?;
        if let Some(slot) = self.set_mut(&key)?.find_mut(absolute) {
            slot.to_be_dropped = true;
        }
        self.dirty_sets.insert(key);
        self.update_cycle(main_item, |c| c.flags.to_be_dropped = true)
    }

    /// Modify a cycle in place and mark its main item dirty.
    pub fn update_cycle(
        &mut self,
        main_item: SectorAddress,
        change: impl FnOnce(&mut FileCycle),
    ) -> Result<()> {
        let cycle = self
            .cycles
            .get_mut(&main_item)
            .ok_or_else(|| MfdError::NotFound(format!("main item {main_item}")))?;
        change(cycle);
        self.dirty_cycles.insert(main_item);
        Ok(())
    }

    /// Keep a new cycle in its window until its creating request returns.
    pub fn begin_creation(&mut self, main_item: SectorAddress) {
        self.in_flight.insert(main_item);
    }

    pub fn end_creation(&mut self, main_item: SectorAddress) {
        self.in_flight.remove(&main_item);
    }

    #[must_use]
    pub fn is_being_created(&self, main_item: SectorAddress) -> bool {
        self.in_flight.contains(&main_item)
    }

    pub fn set_max_cycle_range(
        &mut self,
        qualifier: &str,
        filename: &str,
        max: u32,
        creds: &Credentials,
    ) -> Result<()> {
        let key = (qualifier.to_owned(), filename.to_owned());
        let set = self
            .sets
            .get_mut(&key)
            .ok_or_else(|| MfdError::NotFound(format!("{qualifier}*{filename}")))?;
        creds.authorize_file_set(set, true)?;
        set.set_max_cycle_range(max)?;
        debug!(qualifier, filename, max, "max_cycle_range_changed");
        self.dirty_sets.insert(key);
        Ok(())
    }

    /// Encode every dirty lead and main item as `(sector, bytes)` pairs and
    /// clear the dirty marks.
    ///
    /// An item that does not encode loses its dirty mark and fails the
    /// flush; the others stay dirty for the next one.
    pub fn flush(&mut self) -> Result<Vec<(SectorAddress, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut bad_sets = Vec::new();
        let mut bad_cycles = Vec::new();
        let mut failure = None;
        for key in &self.dirty_sets {
            let Some(set) = self.sets.get(key) else {
                continue;
            };
            match set.to_lead_item().to_sectors(set.address) {
                Ok((sector0, sector1)) => {
                    out.push((set.address, sector0));
                    if let (Some(overflow), Some(bytes)) = (set.overflow, sector1) {
                        out.push((overflow, bytes));
                    }
                }
                Err(e) => {
                    bad_sets.push(key.clone());
                    failure.get_or_insert_with(|| encode_failure(set.address, &e));
                }
            }
        }
        for addr in &self.dirty_cycles {
            let Some(cycle) = self.cycles.get(addr) else {
                continue;
            };
            match cycle.to_bytes() {
                Ok(bytes) => out.push((*addr, bytes)),
                Err(e) => {
                    bad_cycles.push(*addr);
                    failure.get_or_insert_with(|| encode_failure(*addr, &e));
                }
            }
        }
        if let Some(err) = failure {
            for key in &bad_sets {
                self.dirty_sets.remove(key);
            }
            for addr in &bad_cycles {
                self.dirty_cycles.remove(addr);
            }
            return Err(err);
        }
        self.dirty_sets.clear();
        self.dirty_cycles.clear();
        Ok(out)
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        !self.dirty_sets.is_empty() || !self.dirty_cycles.is_empty()
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn cycle_of(&self, main_item: SectorAddress) -> Result<&FileCycle> {
        self.cycles.get(&main_item).ok_or_else(|| {
            error!(main_item = main_item.0, "cycle_link_dangling");
            MfdError::Corruption {
                sector: main_item.0,
                detail: "lead item links a main item that is not cataloged".to_owned(),
            }
        })
    }

    fn set_mut(&mut self, key: &SetKey) -> Result<&mut FileSet> {
        self.sets.get_mut(key).ok_or_else(|| {
            MfdError::Invariant(format!("file set {}*{} vanished", key.0, key.1))
        })
    }

    fn slot_key(&self, main_item: SectorAddress) -> Result<(SetKey, AbsoluteCycle)> {
        let cycle = self
            .cycles
            .get(&main_item)
            .ok_or_else(|| MfdError::NotFound(format!("main item {main_item}")))?;
        let absolute = AbsoluteCycle::new(cycle.absolute_cycle)?;
        Ok(((cycle.qualifier.clone(), cycle.filename.clone()), absolute))
    }

    fn check_droppable(&self, slot: &CycleSlot, creds: &Credentials) -> Result<()> {
        let cycle = self.cycle_of(slot.main_item)?;
        let reason = if cycle.current_assign_count > 0 || slot.to_be_cataloged {
            Some("assigned")
        } else if self.in_flight.contains(&slot.main_item) {
            Some("still being created")
        } else if cycle.flags.queued_for_output {
            Some("queued for output")
        } else if creds.is_private_against(cycle) {
            Some("private")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(
                qualifier = %cycle.qualifier,
                filename = %cycle.filename,
                cycle = cycle.absolute_cycle,
                reason,
                "range_drop_refused"
            );
            return Err(MfdError::CycleConflict(format!(
                "cycle {} of {}*{} would leave the range but is {reason}",
                cycle.absolute_cycle, cycle.qualifier, cycle.filename
            )));
        }
        Ok(())
    }

    /// Take a cycle out of its set and the arena and release its main item.
    fn detach_cycle(
        &mut self,
        main_item: SectorAddress,
        sectors: &mut dyn SectorSource,
    ) -> Result<DroppedCycle> {
        let (key, absolute) = self.slot_key(main_item)?;
        let set = self.set_mut(&key)?;
        if set.remove(absolute).is_none() {
            error!(main_item = main_item.0, cycle = absolute.get(), "cycle_slot_missing");
            return Err(MfdError::Corruption {
                sector: set.address.0,
                detail: format!("lead item has no slot for cycle {absolute}"),
            });
        }
        let pending = set.cycles().any(|s| s.to_be_cataloged);
        set.plus_one_exists = pending;
        let cycle = self
            .cycles
            .remove(&main_item)
            .ok_or_else(|| MfdError::Invariant(format!("main item {main_item} vanished")))?;
        self.dirty_cycles.remove(&main_item);
        self.in_flight.remove(&main_item);
        sectors.release_sector(main_item)?;
        debug!(
            qualifier = %cycle.qualifier,
            filename = %cycle.filename,
            cycle = cycle.absolute_cycle,
            "cycle_dropped"
        );
        Ok(DroppedCycle { main_item, cycle })
    }

    /// Hold lead sector 1 exactly while the range needs it.
    fn fit_overflow(&mut self, key: &SetKey, sectors: &mut dyn SectorSource) -> Result<()> {
        let set = self.set_mut(key)?;
        let needs = set.current_range() > LEAD_PRIMARY_LINKS;
        match (needs, set.overflow) {
            (true, None) => set.overflow = Some(sectors.allocate_sector()?),
            (false, Some(addr)) => {
                set.overflow = None;
                sectors.release_sector(addr)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Absolute cycle a new-cycle request names on an existing file set.
fn next_cycle_for(set: &FileSet, spec: CycleSpec) -> Result<AbsoluteCycle> {
    let highest = set.highest().ok_or_else(|| {
        MfdError::Invariant(format!("file set {}*{} has no cycles", set.qualifier, set.filename))
    })?;
    match spec {
        CycleSpec::None => Err(MfdError::Exists(format!(
            "{}*{}",
            set.qualifier, set.filename
        ))),
        CycleSpec::Absolute(n) => AbsoluteCycle::new(n),
        CycleSpec::Relative(1) if set.plus_one_exists => Err(MfdError::CycleConflict(format!(
            "{}*{} already has a +1 cycle",
            set.qualifier, set.filename
        ))),
        CycleSpec::Relative(1) => Ok(highest.increment()),
        CycleSpec::Relative(n) => Err(MfdError::InvalidRequest(format!(
            "relative cycle {n} names an existing cycle"
        ))),
    }
}

fn validate_text(field: &str, text: &str, max: usize, may_be_empty: bool) -> Result<()> {
    if (text.is_empty() && !may_be_empty)
        || text.len() > max
        || !text.bytes().all(|b| b.is_ascii_graphic())
    {
        return Err(MfdError::InvalidRequest(format!(
            "{field} {text:?} must be 1..={max} printable ASCII characters"
        )));
    }
    Ok(())
}

/// Reject attributes the main item could not record.
fn validate_kind(kind: &FileCycleKind) -> Result<()> {
    match kind {
        FileCycleKind::MassStorage {
            granularity,
            equipment,
            max_granules,
            ..
        } => {
            validate_text("equipment", equipment, EQUIPMENT_CHARS, true)?;
            let ceiling = granularity.addressable_granules();
            if *max_granules > ceiling {
                return Err(MfdError::InvalidRequest(format!(
                    "maximum of {max_granules} granules exceeds the addressable {ceiling}"
                )));
            }
        }
        FileCycleKind::Tape { reel_numbers, .. } => {
            if reel_numbers.len() > MAX_REELS {
                return Err(MfdError::InvalidRequest(format!(
                    "{} reel numbers given, at most {MAX_REELS} allowed",
                    reel_numbers.len()
                )));
            }
            for reel in reel_numbers {
                validate_text("reel number", reel, REEL_CHARS, false)?;
            }
        }
    }
    Ok(())
}

fn encode_failure(addr: SectorAddress, err: &mfd_types::ParseError) -> MfdError {
    error!(sector = addr.0, error = %err, "directory_encode_failed");
    MfdError::Invariant(format!("cannot encode directory sector {addr}: {err}"))
}
