//! probeweave - opt-in call-site timing for long-running hosts
//!
//! The host wraps interception points in sites built by a [`weaver::Weaver`].
//! Operators switch targets on and off at runtime; each active site feeds a
//! [`probe::Probe`] whose per-cycle samples are ranked by the
//! [`aggregator::StatsAggregator`] and can be captured, saved and compared as
//! [`session`]s. [`engine::Engine`] ties the pieces to the host's cycle.

pub mod aggregator;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod session;
pub mod weaver;

pub use engine::{Engine, HostHooks, SessionHandle};
