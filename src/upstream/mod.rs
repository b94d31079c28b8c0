//! Upstream API integration: wire types and the rate-limited fetcher.
//!
//! All upstream I/O goes through [`Fetcher`], which serializes calls
//! behind a concurrency gate and applies pacing and retry policy.

pub mod cohort;
pub mod fetcher;
pub mod info;

pub use cohort::{CohortPage, CohortTrader};
pub use fetcher::Fetcher;
