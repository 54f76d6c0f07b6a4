//! Quotaward - rate limiting, adaptive backoff and durable state for API pollers
//!
//! This crate keeps a long-running poller of a rate-limited HTTP API under
//! the provider's per-category limits. It tracks requests in 15-minute
//! sliding windows, paces itself as usage climbs, backs off when the provider
//! pushes back, and persists its counters and user preferences so that a
//! restart neither forgets recent usage nor leaves half-written state behind.
//!
//! [`governor::Governor`] is the entry point; [`poller::Poller`] drives it.

pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod identity;
pub mod poller;
pub mod ratelimit;
pub mod state;

pub use governor::{BudgetExhausted, CategoryStatus, Governor};
pub use poller::{CycleOutcome, PollTask, Poller};
