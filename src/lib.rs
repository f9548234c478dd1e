//! # smarttune
//!
//! Client side of a database configuration tuner. A [`tuning_loop::TuningLoop`]
//! repeatedly observes a running TiDB cluster, submits the observation to a
//! remote optimizer, waits for its recommendation and applies it back:
//! global variables through SQL, per-role settings through the cluster
//! topology managed by `tiup`.
//!
//! Every external collaborator sits behind a capability trait
//! ([`collector::Collector`], [`recommend::RecommendationService`],
//! [`driver::ConfigApplier`], [`topology::TopologyManager`],
//! [`source::SqlConnector`]) so a different database or deployment tool is
//! a new implementation, not a change to the loop.

pub mod catalog;
pub mod cli;
pub mod collector;
pub mod config;
pub mod driver;
pub mod error;
pub mod journal;
pub mod knob;
pub mod observation;
pub mod recommend;
pub mod source;
pub mod topology;
pub mod tuning_loop;

pub use error::{LoopError, Result, TuneError};
pub use knob::{KnobSet, KnobValue};
