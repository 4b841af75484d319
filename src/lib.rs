//! # isptar — incremental, sliced, deduplicating TAR backup tool
//!
//! Format guarantees:
//! - An archive is one or more fixed-size slice files (`NAME`, `NAME.part1`,
//!   `NAME.part2`, ...); the last slice's final two gzip members are the
//!   catalog listing and a small key=value trailer.
//! - The catalog is the sole source of truth for reading an archive back;
//!   the TAR headers embedded in the data stream are vestigial except for
//!   `isolate`'s plain-TAR re-export.
//! - Incremental backups either copy a base archive's payload forward
//!   (dereferencing) or forward a reference locator into it, never both.
//! - `merge`/`split` thread existing locators one level deeper/shallower
//!   rather than recompressing payload data.

pub mod catalog;
pub mod config;
pub mod error;
pub mod gzip;
pub mod hook;
pub mod privilege;
pub mod proto;
pub mod record;
pub mod sender;
pub mod slice;
pub mod tar;
pub mod walk;

pub use catalog::{Catalog, CatalogEntry, Locator, Trailer};
pub use error::{Error, Result};
pub use hook::{Hook, HookContext, HookParams};
pub use privilege::{drop_to_user, ElevateGuard};
pub use record::{FileRecord, Kind, NameCache};
pub use sender::{CompressionBlacklist, FsPayloadSource, PayloadSource, Sender};
pub use slice::{SliceReader, SliceWriter};
pub use walk::{BackupHook, ExcludePattern, Walker};
