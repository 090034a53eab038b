//! Crystalball: crash-telemetry bucketing, reweighting and top-crash ranking.
//!
//! Records are classified into named, possibly-overlapping buckets, counted per
//! channel in bounded-memory windows, optionally reweighted to project one
//! channel's bucket distribution onto another, and ranked by signature. Work
//! units are processed by a worker pool and merged associatively.

pub mod aggregate;
pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod matcher;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod rank;
pub mod record;
pub mod report;
pub mod source;
pub mod weight;

pub use aggregate::{ingest, ChannelAggregate, ChannelAggregates};
pub use bucket::{Bucket, BucketSet, WeightTable};
pub use config::Config;
pub use dispatch::Controller;
pub use error::{EngineError, RecordParseError};
pub use matcher::{Constraint, Predicate};
pub use merge::Merge;
pub use pipeline::{RunContext, UnitResult};
pub use rank::{top_crashes, CrashEntry, TopCrashReport};
pub use record::{FieldValue, Record};
pub use report::Report;
pub use source::{JsonLinesSource, RecordSource, WorkUnit};
pub use weight::compute_weights;
