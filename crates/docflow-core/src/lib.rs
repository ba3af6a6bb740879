//! # docflow core
//!
//! Runtime-free logic shared by the docflow worker, server, and CLI: the
//! job model, shadow-twin naming, frontmatter validation, phase gates,
//! the storage capability trait, artifact resolution, and repair.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Everything that
//! touches a document library goes through [`storage::StorageProvider`].
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Jobs, steps, policies, trace events |
//! | [`error`] | [`error::PipelineError`] taxonomy |
//! | [`naming`] | Shadow folder and artifact file names |
//! | [`frontmatter`] | Frontmatter parsing, validation, phase needs |
//! | [`facets`] | Facet schema provider and cache |
//! | [`gate`] | Pure run/skip decisions per phase |
//! | [`startability`] | Duplicate-dispatch window |
//! | [`storage`] | Storage trait + in-memory backend |
//! | [`resolver`] | Artifact lookup and writes |
//! | [`repair`] | Incomplete-artifact detection, legacy adoption |
//! | [`chunk`] | Body chunker for the ingest phase |

pub mod chunk;
pub mod error;
pub mod facets;
pub mod frontmatter;
pub mod gate;
pub mod models;
pub mod naming;
pub mod repair;
pub mod resolver;
pub mod startability;
pub mod storage;
