//! Acceptance tests for the Time Manager.
//!
//! - Deterministic scheduling scenarios on a simulated counter
//! - Process-wide facade and configuration loading
//! - Dispatch latency and long-duration stability on the hardware counter
//!   (ignored by default; run with `--ignored`)

mod common;
mod facade_test;
mod latency_test;
mod scenario_test;
mod soak_test;
