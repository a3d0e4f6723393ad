//! switchboard: the matching layer of a partitioned task queue.
//!
//! Producers add tasks for a named queue; pollers long-poll for the next
//! one. For each physical partition, a [`queue_manager::QueueManager`]
//! brokers the two sides: a synchronous handoff when a poller is already
//! waiting, a durable spill to the task store when none is, asynchronous
//! redelivery of the spilled backlog, forwarding up the partition tree
//! so split traffic still meets, and a propagating per-queue user-data
//! value.
//!
//! Storage and RPC are trait seams ([`store::TaskStore`],
//! [`client::QueueClient`]); in-memory implementations back tests and
//! single-process deployments.

pub mod client;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod limiter;
pub mod matcher;
pub mod namespaces;
pub mod queue;
pub mod queue_manager;
pub mod retry;
pub mod settings;
pub mod store;
pub mod task;
pub mod trace;
pub mod user_data;
