// Storage guard - free space preflight for downloads and imports

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use sysinfo::Disks;

use crate::error::{format_bytes, ModelError};

/// Source of free/total device storage
pub trait DiskSpaceProvider: Send + Sync {
    /// Free bytes on the volume backing the app storage
    fn available_bytes(&self) -> u64;
    fn total_bytes(&self) -> u64;
}

/// Reads the volume that contains `storage_root` through sysinfo
pub struct SysinfoDiskSpace {
    storage_root: PathBuf,
}

impl SysinfoDiskSpace {
    pub fn new(storage_root: PathBuf) -> Self {
        Self { storage_root }
    }

    /// Returns (available, total) of the disk with the longest mount point
    /// that is a prefix of the storage root
    fn query(&self) -> (u64, u64) {
        let disks = Disks::new_with_refreshed_list();
        let root = self
            .storage_root
            .canonicalize()
            .unwrap_or_else(|_| self.storage_root.clone());

        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| (disk.available_space(), disk.total_space()))
            .unwrap_or_else(|| {
                log::warn!("No disk found for storage root {:?}", root);
                (0, 0)
            })
    }
}

impl DiskSpaceProvider for SysinfoDiskSpace {
    fn available_bytes(&self) -> u64 {
        self.query().0
    }

    fn total_bytes(&self) -> u64 {
        self.query().1
    }
}

/// Fixed numbers, for hosts that report storage themselves and for tests
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace {
    pub available: u64,
    pub total: u64,
}

impl DiskSpaceProvider for FixedDiskSpace {
    fn available_bytes(&self) -> u64 {
        self.available
    }

    fn total_bytes(&self) -> u64 {
        self.total
    }
}

/// Result of a storage preflight
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpaceCheck {
    pub ok: bool,
    pub available_bytes: u64,
    pub message: String,
}

impl SpaceCheck {
    /// Turn a failed check into the error the caller must surface
    pub fn into_result(self, required_bytes: u64) -> Result<(), ModelError> {
        if self.ok {
            Ok(())
        } else {
            Err(ModelError::InsufficientStorage {
                required_bytes,
                available_bytes: self.available_bytes,
            })
        }
    }
}

/// Checks available device storage against a byte budget plus a safety margin
pub struct StorageGuard {
    provider: Arc<dyn DiskSpaceProvider>,
    margin_bytes: u64,
}

impl StorageGuard {
    pub fn new(provider: Arc<dyn DiskSpaceProvider>, margin_bytes: u64) -> Self {
        Self {
            provider,
            margin_bytes,
        }
    }

    pub fn margin_bytes(&self) -> u64 {
        self.margin_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.provider.total_bytes()
    }

    /// Pure query: `ok` iff `required + margin <= available`
    pub fn check_space(&self, required_bytes: u64) -> SpaceCheck {
        let available_bytes = self.provider.available_bytes();
        let needed = required_bytes.saturating_add(self.margin_bytes);
        let ok = needed <= available_bytes;

        let message = if ok {
            format!(
                "{} required, {} available",
                format_bytes(required_bytes),
                format_bytes(available_bytes)
            )
        } else {
            format!(
                "Not enough storage: {} required (plus {} reserve), only {} available",
                format_bytes(required_bytes),
                format_bytes(self.margin_bytes),
                format_bytes(available_bytes)
            )
        };

        if !ok {
            log::debug!("Storage check failed: {}", message);
        }

        SpaceCheck {
            ok,
            available_bytes,
            message,
        }
    }

    /// Preflight that fails fast with `InsufficientStorage`
    pub fn ensure_space(&self, required_bytes: u64) -> Result<(), ModelError> {
        self.check_space(required_bytes).into_result(required_bytes)
    }

    /// One check per file size, all against the same free-space reading
    pub fn check_space_for_files(&self, sizes: &[u64]) -> Vec<bool> {
        let available = self.provider.available_bytes();
        sizes
            .iter()
            .map(|size| size.saturating_add(self.margin_bytes) <= available)
            .collect()
    }
}
