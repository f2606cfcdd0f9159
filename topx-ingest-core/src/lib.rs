#![doc = "topx-ingest-core: core logic library for topx-ingest."]

//! This crate contains the ingest pipeline for ToPX archival hierarchies:
//! metadata extraction, batching, packaging, and the idempotent synchroniser
//! that drives a remote catalog and transport through the traits in [`contract`].
//! Network clients for a concrete repository live in the `topx-ingest` crate.
//!
//! # Usage
//! Implement [`contract::RemoteCatalog`] and [`contract::Transport`], optionally
//! wrap the catalog in [`retry::Retrying`], and call [`synchronise::synchronise`].

pub mod batch;
pub mod config;
pub mod contract;
pub mod error;
pub mod metadata;
pub mod package;
pub mod retry;
pub mod synchronise;

pub use error::{BoxError, IngestError};
