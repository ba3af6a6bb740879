//! # docflow
//!
//! A lease-based document pipeline. Each job takes one source document
//! through up to three phases and records every decision it made on the way.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌────────────────────────┐
//! │ CLI / API │──▶│  JobQueue   │──▶│ Worker                 │
//! │ enqueue   │   │  (SQLite)   │   │ extract → transform →  │
//! └───────────┘   └──────▲──────┘   │ ingest                 │
//!                        │          └───┬──────────┬─────────┘
//!                 callback (HTTP)       ▼          ▼
//!                        │        ┌──────────┐ ┌─────────┐
//!                 ┌──────┴─────┐  │ Library  │ │  Index  │
//!                 │  Provider  │  │ storage  │ │ chunks  │
//!                 └────────────┘  └──────────┘ └─────────┘
//! ```
//!
//! Artifact naming, gating, and repair rules live in `docflow-core`; this
//! crate wires them to SQLite, the local filesystem, providers, and the
//! HTTP surface.
//!
//! ## Quick Start
//!
//! ```bash
//! docflow init
//! docflow enqueue-dir papers --batch spring
//! docflow work
//! docflow counters
//! docflow serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`queue`] | Lease-based job store |
//! | [`callback`] | Provider callback inbox |
//! | [`storage_fs`] | Filesystem-backed library storage |
//! | [`extract`] | Local text extraction (PDF, OOXML, text) |
//! | [`provider`] | Extract and transform providers |
//! | [`index`] | Chunk index ingest sink |
//! | [`worker`] | Phase orchestration |
//! | [`restart`] | Bulk restart |
//! | [`server`] | HTTP API |
//! | [`job_cmd`] | CLI job commands |
//! | [`stats`] | Store overview |
//! | [`logging`] | Tracing setup |

pub mod callback;
pub mod config;
pub mod db;
pub mod extract;
pub mod index;
pub mod job_cmd;
pub mod logging;
pub mod migrate;
pub mod provider;
pub mod queue;
pub mod restart;
pub mod server;
pub mod stats;
pub mod storage_fs;
pub mod worker;
