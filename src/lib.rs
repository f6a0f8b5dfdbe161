//! Read-only access to HFS+ and HFSX volumes in raw disk images, behind an
//! optional partition map or HFS wrapper.

mod error;
mod file_slice;
mod filesystem;

pub mod btree;
pub mod cancel;
pub mod catalog;
pub mod extents;
pub mod fork;
pub mod fs;
pub mod partition;
pub mod unicode;
mod unicode_table;
pub mod volume;

pub use cancel::{CancellationToken, Completion};
pub use catalog::{CatalogLeafRecord, CatalogRecord, HFSString};
pub use error::HFSPError;
pub use extents::ForkType;
pub use file_slice::FileSlice;
pub use filesystem::{FileSystem, MountOptions, WalkEntry};
pub use fork::HFSFile;
pub use volume::{FileSystemType, ForkData, VolumeHeader, VolumeLocation};
