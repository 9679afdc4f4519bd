/// Chronon - Deterministic Discrete-Event Concurrency Runtime
///
/// This library provides a deterministic concurrency runtime implementing a
/// synchronous sequential model of computation. Programs are cooperating
/// logical processes that communicate exclusively through *channel tables*:
/// shared records whose updates are totally ordered in logical time. Given
/// identical inputs and program structure, the interleaving of processes,
/// the order of updates, and the final observable state are bit-for-bit
/// reproducible.
///
/// # Architecture
///
/// Execution proceeds in *instants*, one per logical time point:
///
/// 1. **Commit** (`channel` module) - every delayed update scheduled for
///    the current instant is moved into the visible record, and all
///    processes sensitized to a committed channel are woken.
///
/// 2. **Run** (`scheduler` module) - ready processes execute in strict
///    priority order until none remain. Priorities come from an
///    order-maintenance list (`priority` module) supporting O(log n)
///    amortized insertion, so `spawn` can slot a child immediately above
///    its parent at any time.
///
/// When an instant drains, the clock advances to the earliest pending
/// update. The run terminates when no active process remains or no update
/// is scheduled.
///
/// # Example
///
/// ```rust
/// use chronon::{start, Duration, Value};
///
/// // A writer process schedules a delayed update; the root waits for it.
/// let (finished_at, returns) = start(|ctx| {
///     let data = ctx.channel([("n", Value::Int(1))]);
///     ctx.after(Duration::new(3), &data, "n", Value::Int(2));
///     ctx.wait_one(&data);
///     vec![data.get("n").unwrap()]
/// })
/// .unwrap();
///
/// assert_eq!(finished_at.ticks(), 3);
/// assert_eq!(returns, vec![Value::Int(2)]);
/// ```
///
/// # Runtime Features
///
/// - **Spawn / defer**: `spawn` runs a child immediately within the current
///   instant at a priority just above the caller; `defer` queues a child
///   just below the caller, launched when the caller next suspends.
/// - **Waiting**: `wait` blocks on any-of / all-of combinations of channel
///   updates and reports which condition unblocked it.
/// - **Delayed assignment**: `after` schedules a field update at a strictly
///   future instant; later calls overwrite pending updates per field.
/// - **Liveness accounting**: passive processes (external-event handlers)
///   do not keep the runtime alive.
/// - **Backend driver**: `Runtime` exposes `set_start` / `set_time` /
///   `run_instant` / `schedule_update` so a real-time wrapper can map
///   instants onto a wall clock and inject external events.
pub mod runtime;

pub use runtime::{
    start, Channel, Duration, Key, LogicalTime, MinQueue, Priority, ProcCtx, Runtime,
    RuntimeConfig, RuntimeError, RuntimeResult, Value, WaitSpec,
};
