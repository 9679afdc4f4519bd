//! Processes: suspendable execution contexts and the in-process API.
//!
//! Each process runs on its own named OS thread, parked on a rendezvous
//! channel. The scheduler resumes exactly one fiber at a time, so the
//! semantics are single-threaded cooperative multitasking: a process runs
//! until it waits, spawns (yielding to the higher-priority child), or
//! terminates. Workers stay alive for the lifetime of the process and block
//! on `recv()`, in the same style as a persistent worker pool.
//!
//! Suspension points are `wait` and the implicit yield inside `spawn`.
//! Everything else runs to completion atomically under the scheduler lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use smallvec::SmallVec;
use tracing::trace;

use crate::runtime::channel::{Channel, Write};
use crate::runtime::error::RuntimeError;
use crate::runtime::scheduler::Core;
use crate::runtime::time::{Duration, LogicalTime};
use crate::runtime::value::{Key, Value};

/// Identity of a process within one runtime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub(crate) u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Process lifecycle. A process is in the run queue or run stack iff
/// `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created but not yet launched (deferred child before release).
    New,
    Ready,
    Running,
    Waiting,
    Done,
}

/// Scheduler-to-fiber messages.
pub(crate) enum Resume {
    Run,
    Cancel,
}

/// Fiber-to-scheduler messages.
pub(crate) enum YieldMsg {
    /// The fiber suspended; its bookkeeping is already updated.
    Parked,
    /// The fiber ran its termination epilogue and is exiting.
    Done,
}

/// Unwind payload used to cancel a parked fiber without running user code.
pub(crate) struct FiberCancel;

/// A process body. The returned values are posted into the numeric keys of
/// the return channel on termination.
pub(crate) type ProcBody = Box<dyn FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static>;

/// One condition of a [`ProcCtx::wait`] call.
///
/// A scalar spec is satisfied when its channel has been updated since the
/// wait began. An array spec is satisfied when all of its channels have
/// been updated, accumulating across wakes.
#[derive(Debug, Clone)]
pub enum WaitSpec {
    One(Channel),
    All(Vec<Channel>),
}

impl WaitSpec {
    fn channels(&self) -> &[Channel] {
        match self {
            WaitSpec::One(c) => std::slice::from_ref(c),
            WaitSpec::All(cs) => cs,
        }
    }
}

impl From<&Channel> for WaitSpec {
    fn from(c: &Channel) -> Self {
        WaitSpec::One(c.clone())
    }
}

impl From<Channel> for WaitSpec {
    fn from(c: Channel) -> Self {
        WaitSpec::One(c)
    }
}

impl From<Vec<Channel>> for WaitSpec {
    fn from(cs: Vec<Channel>) -> Self {
        WaitSpec::All(cs)
    }
}

/// The in-process API handle, passed by the runtime to every process body.
///
/// All operations are callable only from within the running process; the
/// handle cannot escape to the host side.
pub struct ProcCtx {
    core: Arc<Core>,
    pid: ProcessId,
    resume_rx: Receiver<Resume>,
    yield_tx: Sender<YieldMsg>,
}

impl ProcCtx {
    /// The current logical time.
    pub fn now(&self) -> LogicalTime {
        self.core.state.lock().now
    }

    /// Number of processes currently counting toward runtime liveness.
    pub fn num_active(&self) -> usize {
        self.core.state.lock().active
    }

    /// Time of the earliest queued channel update, or `NEVER`.
    pub fn next_event_time(&self) -> LogicalTime {
        self.core.state.lock().next_event_time()
    }

    /// Allocates a fresh channel table initialized from `init`. Every
    /// initial field is stamped with the current time.
    pub fn channel<K, V, I>(&mut self, init: I) -> Channel
    where
        K: Into<Key>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let record = init
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.core.state.lock().alloc_channel(record)
    }

    /// Instant assignment: sets `chan[key]` now, waking every sensitized
    /// process of strictly lower priority than this one.
    pub fn set(&mut self, chan: &Channel, key: impl Into<Key>, value: impl Into<Value>) {
        let mut state = self.core.state.lock();
        state.instant_assign(chan, key.into(), Write::Put(value.into()), self.pid);
    }

    /// Instant deletion: removes `chan[key]` and its last-updated stamp,
    /// waking sensitized processes under the same rule as [`set`].
    ///
    /// [`set`]: ProcCtx::set
    pub fn delete(&mut self, chan: &Channel, key: impl Into<Key>) {
        let mut state = self.core.state.lock();
        state.instant_assign(chan, key.into(), Write::Delete, self.pid);
    }

    /// Schedules `chan[key] = value` at `now + d`. The duration must be
    /// strictly positive.
    pub fn after(
        &mut self,
        d: Duration,
        chan: &Channel,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) {
        if d.is_zero() {
            fatal(RuntimeError::ZeroDelay);
        }
        let mut state = self.core.state.lock();
        let t = state.now + d;
        if let Err(e) = state.schedule_later(chan, key.into(), t, value.into()) {
            drop(state);
            fatal(e);
        }
    }

    /// Whether this process is currently sensitized to `chan`.
    pub fn is_sensitized(&self, chan: &Channel) -> bool {
        chan.lock().is_sensitized(self.pid)
    }

    /// Stops counting toward the active-process quorum. An I/O handler
    /// parked on an external event calls this so it does not keep the
    /// runtime alive by itself.
    pub fn set_passive(&mut self) {
        self.core.state.lock().set_active_flag(self.pid, false);
    }

    /// Resumes counting toward the active-process quorum.
    pub fn set_active(&mut self) {
        self.core.state.lock().set_active_flag(self.pid, true);
    }

    /// Spawns `body` as a child process that runs immediately, within this
    /// instant, at a priority just above this process. Returns the child's
    /// return channel.
    ///
    /// The child inherits the caller's priority slot; the caller is moved
    /// to the position immediately after it, so successive spawns run in
    /// call order.
    ///
    /// # Examples
    ///
    /// ```
    /// use chronon::{start, Value};
    ///
    /// let (_, returns) = start(|ctx| {
    ///     let child = ctx.spawn(|_ctx| vec![Value::Int(7)]);
    ///     // The child ran to completion before we resumed.
    ///     assert!(child.terminated());
    ///     child.returns()
    /// })
    /// .unwrap();
    /// assert_eq!(returns, vec![Value::Int(7)]);
    /// ```
    pub fn spawn<F>(&mut self, body: F) -> Channel
    where
        F: FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static,
    {
        let ret = {
            let mut state = self.core.state.lock();
            let old_prio = state.proc(self.pid).prio.clone();
            let new_prio = match old_prio.insert_after() {
                Ok(p) => p,
                Err(e) => {
                    drop(state);
                    fatal(e);
                }
            };
            let me = state.proc_mut(self.pid);
            me.prio = new_prio.clone();
            me.phase = Phase::Ready;
            me.scheduled = true;

            let (child, ret) = state.new_process(&self.core, Box::new(body), old_prio);
            state.launch_on_stack(child);
            state.requeue_running(self.pid, new_prio);
            trace!(parent = %self.pid, child = %child, "spawn");
            ret
        };
        // Yield so the child runs now; we resume after it suspends.
        self.park();
        ret
    }

    /// Creates a child process that launches only when this process next
    /// waits or terminates, at a priority just below this process (and
    /// below previously deferred siblings, preserving call order). Returns
    /// the child's return channel.
    pub fn defer<F>(&mut self, body: F) -> Channel
    where
        F: FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static,
    {
        let mut state = self.core.state.lock();
        let anchor = {
            let me = state.proc(self.pid);
            me.defer_cursor.clone().unwrap_or_else(|| me.prio.clone())
        };
        let child_prio = match anchor.insert_after() {
            Ok(p) => p,
            Err(e) => {
                drop(state);
                fatal(e);
            }
        };
        let (child, ret) = state.new_process(&self.core, Box::new(body), child_prio.clone());
        let me = state.proc_mut(self.pid);
        me.defer_cursor = Some(child_prio);
        me.deferred.push(child);
        trace!(parent = %self.pid, child = %child, "defer");
        ret
    }

    /// Blocks until at least one spec is satisfied, then reports
    /// per-spec satisfaction positionally.
    ///
    /// Calling with no specs is a no-op and returns immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use chronon::{start, Duration, Value, WaitSpec};
    ///
    /// let (t, _) = start(|ctx| {
    ///     let a = ctx.channel([("v", Value::Int(0))]);
    ///     let b = ctx.channel([("v", Value::Int(0))]);
    ///     ctx.after(Duration::new(2), &a, "v", Value::Int(1));
    ///     ctx.after(Duration::new(5), &b, "v", Value::Int(1));
    ///     let hit = ctx.wait([WaitSpec::from(&a), WaitSpec::from(&b)]);
    ///     assert_eq!(hit, vec![true, false]);
    ///     Vec::new()
    /// })
    /// .unwrap();
    /// // The run ends as soon as the last active process terminates; the
    /// // update still pending on b is never reached.
    /// assert_eq!(t.ticks(), 2);
    /// ```
    pub fn wait<I>(&mut self, specs: I) -> Vec<bool>
    where
        I: IntoIterator,
        I::Item: Into<WaitSpec>,
    {
        let specs: SmallVec<[WaitSpec; 4]> = specs.into_iter().map(Into::into).collect();
        if specs.is_empty() {
            return Vec::new();
        }

        {
            let mut state = self.core.state.lock();
            for spec in &specs {
                for chan in spec.channels() {
                    chan.lock().sensitize(self.pid);
                }
            }
            state.launch_deferred(self.pid);
            state.suspend_running(self.pid);
        }

        loop {
            self.park();

            let sat: SmallVec<[bool; 4]> = specs
                .iter()
                .map(|spec| {
                    spec.channels()
                        .iter()
                        .all(|c| !c.lock().is_sensitized(self.pid))
                })
                .collect();
            if sat.iter().any(|s| *s) {
                for spec in &specs {
                    for chan in spec.channels() {
                        chan.lock().desensitize(self.pid);
                    }
                }
                return sat.into_vec();
            }
            // Woken, but no spec is complete yet (a partial array spec):
            // the fired channels stay counted, the rest stay sensitized.
            self.core.state.lock().suspend_running(self.pid);
        }
    }

    /// Waits for a single channel to be updated.
    pub fn wait_one(&mut self, chan: &Channel) {
        self.wait([WaitSpec::from(chan)]);
    }

    /// Waits until every listed channel has been updated.
    pub fn wait_all(&mut self, chans: Vec<Channel>) {
        self.wait([WaitSpec::All(chans)]);
    }

    /// Suspends this fiber until the scheduler resumes it.
    fn park(&self) {
        if self.yield_tx.send(YieldMsg::Parked).is_err() {
            cancel_fiber();
        }
        match self.resume_rx.recv() {
            Ok(Resume::Run) => {}
            Ok(Resume::Cancel) | Err(_) => cancel_fiber(),
        }
    }
}

/// Aborts the run from inside a process. Unwinds without invoking the
/// panic hook; the scheduler surfaces the error from `start`/`run_instant`.
fn fatal(e: RuntimeError) -> ! {
    panic::resume_unwind(Box::new(e))
}

fn cancel_fiber() -> ! {
    panic::resume_unwind(Box::new(FiberCancel))
}

/// Spawns the OS thread backing a process and returns the scheduler-side
/// endpoints.
pub(crate) fn spawn_fiber(
    core: Arc<Core>,
    pid: ProcessId,
    ret: Channel,
    body: ProcBody,
    stack_size: Option<usize>,
) -> (Sender<Resume>, Receiver<YieldMsg>, JoinHandle<()>) {
    let (resume_tx, resume_rx) = bounded::<Resume>(1);
    let (yield_tx, yield_rx) = bounded::<YieldMsg>(1);

    let mut builder = thread::Builder::new().name(format!("chronon-{}", pid));
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }
    let handle = builder
        .spawn(move || fiber_main(core, pid, ret, body, resume_rx, yield_tx))
        .expect("failed to spawn process fiber thread");

    (resume_tx, yield_rx, handle)
}

fn fiber_main(
    core: Arc<Core>,
    pid: ProcessId,
    ret: Channel,
    body: ProcBody,
    resume_rx: Receiver<Resume>,
    yield_tx: Sender<YieldMsg>,
) {
    // Creation does not run user code; wait for the first resume.
    match resume_rx.recv() {
        Ok(Resume::Run) => {}
        Ok(Resume::Cancel) | Err(_) => return,
    }

    let mut ctx = ProcCtx { core, pid, resume_rx, yield_tx };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx)));

    match outcome {
        Ok(returns) => {
            terminate(&ctx, pid, &ret, returns);
            let _ = ctx.yield_tx.send(YieldMsg::Done);
        }
        Err(payload) => {
            if payload.is::<FiberCancel>() {
                return;
            }
            // Fatal error or user panic: poison the runtime and drop our
            // end of the handshake so the scheduler notices.
            let mut state = ctx.core.state.lock();
            state.retire_running(pid);
            state.poison.get_or_insert(payload);
        }
    }
}

/// Termination epilogue: post return values and the terminated flag into
/// the return channel as ordinary instant assignments (waking lower-priority
/// waiters), release remaining deferred children, retire the priority, and
/// stop counting toward liveness.
fn terminate(ctx: &ProcCtx, pid: ProcessId, ret: &Channel, returns: Vec<Value>) {
    let mut state = ctx.core.state.lock();
    for (i, v) in returns.into_iter().enumerate() {
        state.instant_assign(ret, Key::ret(i as u64 + 1), Write::Put(v), pid);
    }
    state.instant_assign(ret, Key::terminated(), Write::Put(Value::Bool(true)), pid);
    state.launch_deferred(pid);
    state.retire_running(pid);
    trace!(proc = %pid, "terminated");
}
