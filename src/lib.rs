//! # reconq
//!
//! Owner-driven reconciliation controller core.
//!
//! Watches a parent kind and the dependent kind parents create, and turns
//! changes on either into a deduplicated, retried stream of parent work keys
//! drained by a worker pool into a [`controller::Reconciler`]. Dependent
//! events are redirected to their controlling parent via
//! [`matcher::OwnerMatcher`]; dispatch waits for the backing caches to sync
//! and skips parents that are gone or being deleted.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod manager;
pub mod matcher;
pub mod model;
pub mod queue;
pub mod sync;
pub mod telemetry;
