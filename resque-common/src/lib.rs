//! Shared building blocks for the resque worker: the job descriptor and its
//! wire codec, the store client port, queue and sink ports, the event bus,
//! the job registry, and the health/metrics plumbing used by the binaries.

pub mod events;
pub mod failure;
pub mod health;
pub mod job;
pub mod metrics;
pub mod mock;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod store;
