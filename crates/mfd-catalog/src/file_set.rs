//! File sets: the cycle window of one (qualifier, filename).

use crate::cycle::AbsoluteCycle;
use mfd_error::{MfdError, Result};
use mfd_ondisk::{CycleLink, LeadItem, MAX_CYCLE_LINKS};
use mfd_types::SectorAddress;
use serde::{Deserialize, Serialize};

/// One existing cycle in a file set's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSlot {
    pub absolute_cycle: AbsoluteCycle,
    pub main_item: SectorAddress,
    pub to_be_cataloged: bool,
    pub to_be_dropped: bool,
}

/// Where a new cycle lands in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The file set has no cycles yet.
    First,
    /// Newer than the current highest: the window shifts by `shift` and
    /// `falling_off` (at most one cycle) leaves it.
    Newer {
        shift: usize,
        falling_off: Option<CycleSlot>,
    },
    /// Older than the highest, at slot `index`.
    Older { index: usize },
}

/// Lead item model.
///
/// `slots[i]` holds absolute cycle `highest - i`. Slot 0 and the last slot
/// are always occupied, so `slots.len()` is the current range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    /// Lead item sector 0.
    pub address: SectorAddress,
    /// Lead item sector 1, held while the range exceeds twelve.
    pub overflow: Option<SectorAddress>,
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub read_key: String,
    pub write_key: String,
    pub guarded: bool,
    pub plus_one_exists: bool,
    pub max_cycle_range: u32,
    slots: Vec<Option<CycleSlot>>,
}

impl FileSet {
    #[must_use]
    pub fn new(
        address: SectorAddress,
        qualifier: &str,
        filename: &str,
        project_id: &str,
        max_cycle_range: u32,
    ) -> Self {
        Self {
            address,
            overflow: None,
            qualifier: qualifier.to_owned(),
            filename: filename.to_owned(),
            project_id: project_id.to_owned(),
            read_key: String::new(),
            write_key: String::new(),
            guarded: false,
            plus_one_exists: false,
            max_cycle_range,
            slots: Vec::new(),
        }
    }

    /// The most recent existing cycle.
    #[must_use]
    pub fn highest(&self) -> Option<AbsoluteCycle> {
        self.slots.first().copied().flatten().map(|s| s.absolute_cycle)
    }

    #[must_use]
    pub fn current_range(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<CycleSlot>] {
        &self.slots
    }

    /// Existing cycles, newest first.
    pub fn cycles(&self) -> impl Iterator<Item = &CycleSlot> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn cycle_count(&self) -> usize {
        self.cycles().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Window slot that `cycle` occupies or would occupy, if inside the
    /// current range.
    #[must_use]
    pub fn slot_index(&self, cycle: AbsoluteCycle) -> Option<usize> {
        let highest = self.highest()?;
        if cycle == highest {
            return Some(0);
        }
        let index = highest.steps_after(cycle) as usize;
        (highest.is_newer_than(cycle) && index < self.slots.len()).then_some(index)
    }

    #[must_use]
    pub fn find(&self, cycle: AbsoluteCycle) -> Option<&CycleSlot> {
        self.slot_index(cycle)
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    pub fn find_mut(&mut self, cycle: AbsoluteCycle) -> Option<&mut CycleSlot> {
        let index = self.slot_index(cycle)?;
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Existing cycle named by a relative cycle: 0 is the highest, `-n` the
    /// n-th older existing cycle.
    #[must_use]
    pub fn relative(&self, relative: i32) -> Option<&CycleSlot> {
        if relative > 0 {
            return None;
        }
        self.cycles().nth(relative.unsigned_abs() as usize)
    }

    /// Decide where `cycle` goes, without changing anything.
    ///
    /// Fails with `Exists` for a cycle already present and with
    /// `CycleConflict` when the window cannot accommodate it.
    pub fn plan_insert(&self, cycle: AbsoluteCycle) -> Result<Placement> {
        let Some(highest) = self.highest() else {
            return Ok(Placement::First);
        };
        let max = self.max_cycle_range as usize;

        if cycle.is_newer_than(highest) {
            let shift = cycle.steps_after(highest) as usize;
            let mut leaving = self
                .slots
                .iter()
                .enumerate()
                .filter(|(i, _)| i + shift >= max)
                .filter_map(|(_, s)| *s);
            let falling_off = leaving.next();
            if leaving.next().is_some() {
                return Err(MfdError::CycleConflict(format!(
                    "cycle {cycle} would push more than one cycle of {}*{} out of range {max}",
                    self.qualifier, self.filename
                )));
            }
            return Ok(Placement::Newer { shift, falling_off });
        }

        if cycle == highest {
            return Err(MfdError::Exists(format!(
                "{}*{}({cycle})",
                self.qualifier, self.filename
            )));
        }
        let index = highest.steps_after(cycle) as usize;
        if self.slots.get(index).is_some_and(Option::is_some) {
            return Err(MfdError::Exists(format!(
                "{}*{}({cycle})",
                self.qualifier, self.filename
            )));
        }
        if index >= max {
            return Err(MfdError::CycleConflict(format!(
                "cycle {cycle} is below the range {max} of {}*{}",
                self.qualifier, self.filename
            )));
        }
        Ok(Placement::Older { index })
    }

    /// Apply a placement from [`Self::plan_insert`].
    ///
    /// A cycle reported in `falling_off` is discarded from the window; the
    /// caller is responsible for the rest of its teardown.
    pub fn insert(&mut self, placement: &Placement, slot: CycleSlot) {
        match placement {
            Placement::First => self.slots = vec![Some(slot)],
            Placement::Newer { shift, .. } => {
                let mut slots = Vec::with_capacity(shift + self.slots.len());
                slots.push(Some(slot));
                slots.resize(*shift, None);
                slots.append(&mut self.slots);
                slots.truncate(self.max_cycle_range as usize);
                self.slots = slots;
            }
            Placement::Older { index } => {
                if *index >= self.slots.len() {
                    self.slots.resize(index + 1, None);
                }
                self.slots[*index] = Some(slot);
            }
        }
        self.trim();
    }

    /// Remove `cycle`, recompacting so slot 0 is again the highest.
    pub fn remove(&mut self, cycle: AbsoluteCycle) -> Option<CycleSlot> {
        let index = self.slot_index(cycle)?;
        let removed = self.slots.get_mut(index).and_then(Option::take);
        self.trim();
        removed
    }

    /// Change the maximum range; it may not drop below the current range.
    pub fn set_max_cycle_range(&mut self, max: u32) -> Result<()> {
        if max == 0 || max as usize > MAX_CYCLE_LINKS {
            return Err(MfdError::InvalidRequest(format!(
                "max cycle range {max} outside 1..=32"
            )));
        }
        if (max as usize) < self.slots.len() {
            return Err(MfdError::CycleConflict(format!(
                "max cycle range {max} below current range {}",
                self.slots.len()
            )));
        }
        self.max_cycle_range = max;
        Ok(())
    }

    fn trim(&mut self) {
        while self.slots.last().is_some_and(Option::is_none) {
            self.slots.pop();
        }
        let leading = self.slots.iter().take_while(|s| s.is_none()).count();
        self.slots.drain(..leading);
    }

    // ── Lead item conversion ────────────────────────────────────────────────

    #[must_use]
    pub fn to_lead_item(&self) -> LeadItem {
        LeadItem {
            qualifier: self.qualifier.clone(),
            filename: self.filename.clone(),
            project_id: self.project_id.clone(),
            read_key: self.read_key.clone(),
            write_key: self.write_key.clone(),
            guarded: self.guarded,
            plus_one_exists: self.plus_one_exists,
            max_cycle_range: self.max_cycle_range,
            highest_absolute_cycle: self.highest().map_or(0, AbsoluteCycle::get),
            overflow: self.overflow,
            links: self
                .slots
                .iter()
                .map(|slot| {
                    slot.map(|s| CycleLink {
                        main_item: s.main_item,
                        to_be_cataloged: s.to_be_cataloged,
                        to_be_dropped: s.to_be_dropped,
                    })
                })
                .collect(),
        }
    }

    pub fn from_lead_item(address: SectorAddress, lead: &LeadItem) -> Result<Self> {
        let corrupt = |detail: &str| MfdError::Corruption {
            sector: address.0,
            detail: detail.to_owned(),
        };
        let slots = if lead.links.is_empty() {
            Vec::new()
        } else {
            let highest = AbsoluteCycle::new(lead.highest_absolute_cycle)
                .map_err(|_| corrupt("lead item highest cycle out of range"))?;
            if lead.links.first().is_some_and(Option::is_none)
                || lead.links.last().is_some_and(Option::is_none)
            {
                return Err(corrupt("lead item window has empty end slots"));
            }
            lead.links
                .iter()
                .enumerate()
                .map(|(i, link)| {
                    link.map(|l| CycleSlot {
                        absolute_cycle: highest.older_by(i as u32),
                        main_item: l.main_item,
                        to_be_cataloged: l.to_be_cataloged,
                        to_be_dropped: l.to_be_dropped,
                    })
                })
                .collect()
        };
        Ok(Self {
            address,
            overflow: lead.overflow,
            qualifier: lead.qualifier.clone(),
            filename: lead.filename.clone(),
            project_id: lead.project_id.clone(),
            read_key: lead.read_key.clone(),
            write_key: lead.write_key.clone(),
            guarded: lead.guarded,
            plus_one_exists: lead.plus_one_exists,
            max_cycle_range: lead.max_cycle_range,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(value: u32) -> AbsoluteCycle {
        AbsoluteCycle::new(value).unwrap()
    }

    fn slot(cycle: u32) -> CycleSlot {
        CycleSlot {
            absolute_cycle: c(cycle),
            main_item: SectorAddress(u64::from(cycle) + 64),
            to_be_cataloged: false,
            to_be_dropped: false,
        }
    }

    fn add(set: &mut FileSet, cycle: u32) -> Result<Placement> {
        let placement = set.plan_insert(c(cycle))?;
        set.insert(&placement, slot(cycle));
        Ok(placement)
    }

    fn existing(set: &FileSet) -> Vec<u32> {
        set.cycles().map(|s| s.absolute_cycle.get()).collect()
    }

    #[test]
    fn newer_cycles_shift_the_window() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 5);
        add(&mut set, 1).unwrap();
        add(&mut set, 3).unwrap();
        assert_eq!(existing(&set), vec![3, 1]);
        assert_eq!(set.current_range(), 3);
        assert_eq!(set.slots()[1], None);
        assert_eq!(set.slot_index(c(2)), Some(1));
    }

    #[test]
    fn gap_fill_within_range() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 5);
        add(&mut set, 1).unwrap();
        add(&mut set, 3).unwrap();
        assert_eq!(add(&mut set, 2).unwrap(), Placement::Older { index: 1 });
        assert_eq!(existing(&set), vec![3, 2, 1]);
        // Extending downward within the range.
        add(&mut set, 999).unwrap();
        assert_eq!(existing(&set), vec![3, 2, 1, 999]);
        add(&mut set, 998).unwrap();
        assert_eq!(set.current_range(), 5);
        assert!(matches!(add(&mut set, 997), Err(MfdError::CycleConflict(_))));
    }

    #[test]
    fn existing_cycle_is_exists() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 5);
        add(&mut set, 10).unwrap();
        add(&mut set, 8).unwrap();
        assert!(matches!(add(&mut set, 10), Err(MfdError::Exists(_))));
        assert!(matches!(add(&mut set, 8), Err(MfdError::Exists(_))));
    }

    #[test]
    fn one_cycle_may_fall_off_but_not_two() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 3);
        for cycle in [1, 2, 3] {
            add(&mut set, cycle).unwrap();
        }
        let placement = set.plan_insert(c(4)).unwrap();
        assert_eq!(
            placement,
            Placement::Newer {
                shift: 1,
                falling_off: Some(slot(1))
            }
        );
        set.insert(&placement, slot(4));
        assert_eq!(existing(&set), vec![4, 3, 2]);

        assert!(matches!(set.plan_insert(c(6)), Err(MfdError::CycleConflict(_))));
    }

    #[test]
    fn range_thirty_two_window() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 32);
        for cycle in 1..=32 {
            add(&mut set, cycle).unwrap();
        }
        assert_eq!(set.current_range(), 32);
        let placement = set.plan_insert(c(33)).unwrap();
        assert!(matches!(
            placement,
            Placement::Newer { falling_off: Some(s), .. } if s.absolute_cycle == c(1)
        ));
    }

    #[test]
    fn window_wraps_past_999() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 32);
        add(&mut set, 998).unwrap();
        add(&mut set, 999).unwrap();
        add(&mut set, 1).unwrap();
        assert_eq!(existing(&set), vec![1, 999, 998]);
        assert_eq!(set.highest(), Some(c(1)));
    }

    #[test]
    fn remove_recompacts() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 10);
        for cycle in [1, 3, 5] {
            add(&mut set, cycle).unwrap();
        }
        set.remove(c(5)).unwrap();
        assert_eq!(set.highest(), Some(c(3)));
        assert_eq!(set.current_range(), 3);
        set.remove(c(1)).unwrap();
        assert_eq!(set.current_range(), 1);
        set.remove(c(3)).unwrap();
        assert!(set.is_empty());
        assert!(set.remove(c(3)).is_none());
    }

    #[test]
    fn relative_counts_existing_cycles() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 10);
        for cycle in [2, 5, 6] {
            add(&mut set, cycle).unwrap();
        }
        assert_eq!(set.relative(0).map(|s| s.absolute_cycle), Some(c(6)));
        assert_eq!(set.relative(-1).map(|s| s.absolute_cycle), Some(c(5)));
        assert_eq!(set.relative(-2).map(|s| s.absolute_cycle), Some(c(2)));
        assert!(set.relative(-3).is_none());
        assert!(set.relative(1).is_none());
    }

    #[test]
    fn max_range_cannot_drop_below_current() {
        let mut set = FileSet::new(SectorAddress(1), "Q", "F", "P", 10);
        add(&mut set, 1).unwrap();
        add(&mut set, 4).unwrap();
        assert!(set.set_max_cycle_range(3).is_err());
        assert!(set.set_max_cycle_range(4).is_ok());
        assert!(set.set_max_cycle_range(33).is_err());
    }

    #[test]
    fn lead_item_conversion_round_trips() {
        let mut set = FileSet::new(SectorAddress(9), "SYS", "LOG", "OPS", 20);
        set.read_key = "R".to_owned();
        for cycle in [996, 999, 2] {
            add(&mut set, cycle).unwrap();
        }
        let lead = set.to_lead_item();
        assert_eq!(lead.highest_absolute_cycle, 2);
        assert_eq!(lead.links.len(), 6);
        let back = FileSet::from_lead_item(SectorAddress(9), &lead).unwrap();
        assert_eq!(back, set);
    }
}
