#![forbid(unsafe_code)]
//! Sector I/O service used to persist directory records.
//!
//! Provides the `SectorDevice` trait (the engine's only view of disk I/O)
//! and an in-memory implementation with write accounting and fault
//! injection.

use mfd_error::{MfdError, Result};
use mfd_types::{SECTOR_BYTES, SectorAddress};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Owned sector buffer.
///
/// Invariant: length == `SECTOR_BYTES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorBuf {
    bytes: Vec<u8>,
}

impl SectorBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; SECTOR_BYTES],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Sector-addressed I/O interface for directory storage.
pub trait SectorDevice: Send + Sync {
    /// Read one directory sector.
    fn read_sector(&self, addr: SectorAddress) -> Result<SectorBuf>;

    /// Write one directory sector. `data.len()` MUST equal `SECTOR_BYTES`.
    fn write_sector(&self, addr: SectorAddress, data: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// In-memory sector device.
///
/// Sectors never written read back as zeros.
#[derive(Debug, Default)]
pub struct MemSectorDevice {
    sectors: Mutex<HashMap<SectorAddress, Vec<u8>>>,
    writes: AtomicU64,
    fail_io: AtomicBool,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total sector writes performed since creation.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of distinct sectors holding data.
    #[must_use]
    pub fn sector_count(&self) -> usize {
        self.sectors.lock().len()
    }

    /// Make every subsequent read and write fail with an I/O error.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::Relaxed);
    }

    fn check_io(&self) -> Result<()> {
        if self.fail_io.load(Ordering::Relaxed) {
            return Err(MfdError::Io(std::io::Error::other("injected sector I/O failure")));
        }
        Ok(())
    }
}

impl SectorDevice for MemSectorDevice {
    fn read_sector(&self, addr: SectorAddress) -> Result<SectorBuf> {
        self.check_io()?;
        let sectors = self.sectors.lock();
        Ok(sectors
            .get(&addr)
            .map_or_else(SectorBuf::zeroed, |data| SectorBuf::new(data.clone())))
    }

    fn write_sector(&self, addr: SectorAddress, data: &[u8]) -> Result<()> {
        self.check_io()?;
        if data.len() != SECTOR_BYTES {
            return Err(MfdError::InvalidRequest(format!(
                "write_sector data size mismatch: got={} expected={SECTOR_BYTES}",
                data.len()
            )));
        }
        if addr.is_none() {
            return Err(MfdError::InvalidRequest(
                "write_sector to the null sector address".to_owned(),
            ));
        }
        self.sectors.lock().insert(addr, data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_io()
    }
}
