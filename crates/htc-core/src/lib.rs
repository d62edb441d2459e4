//! Core of the holotree environment cache: filesystem primitives, named
//! cross-process locks, the content-addressed library, catalogs, the build
//! pipeline, the space materializer, and the stats journal.
//!
//! All state flows through an explicit [`context::Context`] value; nothing
//! here is a process-wide singleton, so tests (and embedders) can point a
//! private context at any root they like.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod builder;
pub mod catalog;
pub mod context;
pub mod error;
pub mod fsops;
pub mod hasher;
pub mod journal;
pub mod library;
pub mod locker;
pub mod space;
pub mod workflow;

pub use builder::Builder;
pub use catalog::{Catalog, CatalogStore, CatalogSummary};
pub use context::{Context, Flags, Settings};
pub use error::HoloError;
pub use journal::{aggregate, Journal, JournalEvent, Outcome, StatsSummary};
pub use library::{CheckSummary, Library, SweepSummary};
pub use space::{list_spaces, remove_spaces, LinkMode, Materializer, RestoreOutcome, SpaceInfo};
pub use workflow::{new_environment, EnvironmentOutcome};

/// Seconds since the unix epoch; the clock used for catalog metadata,
/// journal events, and day-window statistics.
#[must_use]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
