//! Device storage preflight

pub mod guard;

pub use guard::{DiskSpaceProvider, FixedDiskSpace, SpaceCheck, StorageGuard, SysinfoDiskSpace};
