//! Acceptance tests for the Time Manager.
//!
//! The scenario tests are deterministic and run everywhere. The latency and
//! soak tests use the hardware counter and the hosted timer thread; the
//! real-time variants additionally need:
//! - Root privileges
//! - PREEMPT_RT kernel (recommended)

mod acceptance;
