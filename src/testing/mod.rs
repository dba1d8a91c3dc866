//! Test fixtures and scenario tests.
//!
//! [`utils`] holds the shared fixtures: node configurations with short
//! timers, in-process replication targets and request builders. The scenario
//! modules drive whole request flows through [`RequestProcessor`]s, the
//! redistribution pipeline and a running [`StorageNode`].
//!
//! [`RequestProcessor`]: crate::processor::RequestProcessor
//! [`StorageNode`]: crate::node::StorageNode

pub mod utils;
