//! Bulk and single-entry value mutation via jq and JSON-Patch (§4.G).

pub mod engine;
pub mod jq;
pub mod patch;

pub use engine::{EntryResult, TransformEngine, TransformOptions, TransformSummary};
