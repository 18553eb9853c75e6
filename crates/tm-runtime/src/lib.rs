#![doc = "Time Manager core: cycle counters, time base, deadline scheduler, and deferred dispatch."]

pub mod arch;
pub mod clock;
pub mod deferred;
pub mod delay;
pub mod global;
pub mod guard;
pub mod heap;
pub mod interrupt;
pub mod manager;
pub mod realtime;
pub mod scheduler;
pub mod softdiv;
pub mod task;
pub mod ticker;
pub mod timebase;

pub use clock::*;
pub use deferred::*;
pub use global::*;
pub use guard::*;
pub use interrupt::*;
pub use manager::*;
pub use realtime::*;
pub use scheduler::*;
pub use task::*;
pub use ticker::*;
pub use timebase::*;
