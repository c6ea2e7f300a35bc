//! # OAI Harvest
//!
//! Synchronizes records harvested from remote OAI-PMH repositories into a
//! local repository of versioned items.
//!
//! The ingestion pipeline itself (identity resolution, extension points, the
//! create/update state machine) lives in [`oai_harvest_core`]. This crate
//! adds the SQLite backend, the record-file source, configuration and the
//! `hvst` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ Record dir  │──▶│  Harvester        │──▶│   SQLite     │
//! │ (XML files) │   │ resolve → create  │   │ items/stages │
//! └─────────────┘   │        or update  │   │ harvest recs │
//!                   └──────────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hvst init
//! hvst collection create theses
//! hvst harvest theses ./harvested
//! hvst stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core storage traits |
//! | [`source_fs`] | Record file scanning and XML crosswalk |
//! | [`extensions`] | Filter/remover/versioning/workflow selection from config |
//! | [`ingest`] | Batch harvest driver |
//! | [`collections`] | Target collection management |
//! | [`get`] | Item inspection and harvest-binding administration |
//! | [`stats`] | Repository statistics |

pub mod collections;
pub mod config;
pub mod db;
pub mod extensions;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod source_fs;
pub mod sqlite_store;
pub mod stats;
