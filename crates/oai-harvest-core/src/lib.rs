//! # OAI Harvest Core
//!
//! Runtime-agnostic logic for synchronizing harvested OAI-PMH records into a
//! local repository of items: data models, the storage abstraction, identity
//! resolution across lifecycle stages, the extension points, and the
//! ingestion state machine.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Storage backends
//! implement the traits in [`store`]; the SQLite backend lives in the
//! `oai-harvest` crate and an in-memory one in [`store::memory`].
//!
//! ## Flow
//!
//! ```text
//!  IncomingRecord ──▶ IdentityResolver ──┬─ none ──▶ create ─▶ post_create ─▶ bind record
//!                     (4 stage indexes)  │
//!                                        └─ item ──▶ filter ─▶ pre_update ─▶ remover
//!                                                    ─▶ metadata ─▶ versioning ─▶ bitstreams
//!                                                    ─▶ post_update ─▶ touch record
//! ```

pub mod error;
pub mod models;
pub mod pipeline;
pub mod records;
pub mod resolver;
pub mod store;
pub mod traits;
pub mod workflow;

pub use error::{ErrorKind, HarvestError, Result};
pub use pipeline::{HarvestOptions, Harvester, IngestOutcome, IngestReport, IngestState};
pub use resolver::{IdentityResolver, ResolvedItem};
pub use store::{Backend, HarvestContext, Session};
