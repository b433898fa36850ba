//! Jotter: a journal-entry enrichment pipeline.
//!
//! Each entry is driven by its own task through content analysis, link
//! fetching and embedding generation. Stage transitions fan out to live
//! observers through the [`hub`], diagnostic records are buffered by the
//! [`logs`] aggregator, and failed entries can be diagnosed by the
//! [`diagnosis`] analyzer.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod providers;
pub mod store;

pub mod hub;
pub mod logs;

pub mod diagnosis;
pub mod pipeline;

pub mod dispatch;
pub mod service;
