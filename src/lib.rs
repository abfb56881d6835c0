//! Retcon is a reconciliation engine: it keeps one JSON document
//! synchronized across several heterogeneous external systems (a
//! database, a test-results feed, a third-party API) that each hold
//! their own partial view of the same entity.
//!
//! The crate is organized around the pipeline a request travels
//! through:
//!
//! - [`document`] — the tree-shaped [`Document`] value every view and
//!   patch is expressed over.
//! - [`patch`] — the diff/patch algebra: [`diff`], [`apply`], and
//!   [`calculate_initial_document`].
//! - [`merge`] — [`MergePolicy`] implementations that combine several
//!   sources' patches into one.
//! - [`keys`] — [`EntityName`]/[`SourceName`]/[`ForeignKey`]/[`InternalKey`]
//!   and the [`EntityUniverse`] that validates them.
//! - [`datasource`] — the [`DataSource`] trait and its two reference
//!   adaptors.
//! - [`store`] — durable kernel state behind the [`Store`] trait.
//! - [`trace`] — the structured side channel the kernel emits.
//! - [`kernel`] — [`Kernel`], which ties all of the above into one
//!   reconciliation protocol.
//! - [`config`] — parses the on-disk configuration file into the
//!   pieces [`kernel::Kernel`] is assembled from.
//! - [`error`] — the crate-wide [`RetconError`].
pub mod config;
pub mod datasource;
pub mod document;
pub mod error;
pub mod kernel;
pub mod keys;
pub mod merge;
pub mod patch;
pub mod store;
pub mod trace;

pub use config::Config;
pub use datasource::{CommandDataSource, DataSource, DataSourceError};
#[cfg(feature = "http")]
pub use datasource::HttpDataSource;
pub use document::{Document, DocumentPath};
pub use error::{RetconError, RetconResult, StoreErrorKind};
pub use kernel::{Kernel, Outcome, Request};
pub use keys::{EntityName, EntityUniverse, ForeignKey, InternalKey, SourceName};
pub use merge::{parse_policy, IgnoreConflicts, MergeAll, MergePolicy, RejectAll, TrustOnly};
pub use patch::{apply, calculate_initial_document, diff, DocumentChange, Patch};
pub use store::{InMemoryStore, KeyState, ReadOnlyStore, RejectedPatch, Store, Transaction};
pub use trace::{
    CollectingTraceSink, NullTraceSink, SourceOutcome, SourceStatus, TraceRecord, TraceSink,
    TracingSink,
};

/// Install a `tracing` subscriber reading its filter from `RETCON_LOG`
/// (falling back to `retcon=info`), writing to stderr. Call once from a
/// binary's `main`; has no effect from within a library consumer that
/// has already installed its own subscriber.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], but `default_level` is used in place of
/// `info` when `RETCON_LOG` is unset.
pub fn init_logging_with_level(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("RETCON_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("retcon={}", default_level)));

    let _ = fmt().with_env_filter(filter).try_init();
}

/// Commonly imported items, for binaries and integration tests.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::datasource::DataSource;
    pub use crate::document::{Document, DocumentPath};
    pub use crate::error::{RetconError, RetconResult};
    pub use crate::kernel::{Kernel, Outcome, Request};
    pub use crate::keys::{EntityName, EntityUniverse, ForeignKey, InternalKey, SourceName};
    pub use crate::merge::MergePolicy;
    pub use crate::store::Store;
    pub use crate::trace::TraceSink;
}
