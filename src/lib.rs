//! Dealflow - M&A deal document-analysis coordination core.
//!
//! Coordinates document-analysis work for named deals: documents are
//! enqueued against a deal, dispatched to an out-of-process analysis
//! engine via HTTP webhooks, and results are merged back into per-deal
//! state. The core is a durable job queue, a deal-folder mirror, a
//! webhook dispatch/receive pipeline, and a workflow recovery engine.

pub mod cli;
pub mod config;
pub mod models;
pub mod persistence;
pub mod queue;
pub mod recovery;
pub mod tracker;
pub mod webhook;
