//! Architecture-specific counter and interrupt-mask primitives.

pub mod counter;
pub mod irq;

pub use counter::{counter_source, nominal_frequency, read_counter, read_split};
pub use irq::IrqState;
