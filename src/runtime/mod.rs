// Runtime core: logical time, priorities, channels, processes, scheduler.
//
// Leaves first: `time` and `value` are plain data, `priority` and `queue`
// are the ordering structures, `channel` and `process` sit on top of them,
// and `scheduler` ties everything into the tick loop.

pub mod channel;
pub mod error;
pub mod priority;
pub mod process;
pub mod queue;
pub mod scheduler;
pub mod time;
pub mod value;

pub use channel::Channel;
pub use error::{RuntimeError, RuntimeResult};
pub use priority::Priority;
pub use process::{ProcCtx, WaitSpec};
pub use queue::MinQueue;
pub use scheduler::{start, Runtime, RuntimeConfig};
pub use time::{Duration, LogicalTime};
pub use value::{Key, Value};
