//! The scheduler: event queue, run queue, and the logical-time tick loop.
//!
//! An *instant* is one iteration of the tick loop at a single logical time:
//! first every channel update scheduled for the current instant is
//! committed (waking all sensitized processes), then ready processes run in
//! strict priority order until none remain. When the instant drains, the
//! clock advances to the earliest queued update and the next instant runs.
//! Execution terminates when no active processes remain or the next update
//! time is `NEVER`.
//!
//! The scheduler is also usable piecemeal, through [`Runtime::set_start`],
//! [`Runtime::set_time`], [`Runtime::run_instant`] and
//! [`Runtime::schedule_update`], by a real-time backend that maps logical
//! instants onto a wall clock and injects external events between instants.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::runtime::channel::{Channel, Write};
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::priority::Priority;
use crate::runtime::process::{
    spawn_fiber, Phase, ProcBody, ProcCtx, ProcessId, Resume, YieldMsg,
};
use crate::runtime::queue::MinQueue;
use crate::runtime::time::LogicalTime;
use crate::runtime::value::{Key, Value};

/// Shared scheduler core. One per runtime; process fibers hold an `Arc` to
/// it and take the state lock only for the duration of a single operation.
pub(crate) struct Core {
    pub(crate) state: Mutex<State>,
}

pub(crate) struct ProcRec {
    pub(crate) prio: Priority,
    pub(crate) active: bool,
    pub(crate) scheduled: bool,
    pub(crate) phase: Phase,
    pub(crate) deferred: Vec<ProcessId>,
    pub(crate) defer_cursor: Option<Priority>,
    pub(crate) resume_tx: Sender<Resume>,
    pub(crate) yield_rx: Receiver<YieldMsg>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

pub(crate) struct State {
    pub(crate) now: LogicalTime,
    pub(crate) procs: HashMap<ProcessId, ProcRec>,
    /// Just-spawned higher-priority children, in spawn order; the top runs
    /// next.
    pub(crate) run_stack: Vec<ProcessId>,
    pub(crate) run_queue: MinQueue<ProcessId, Priority>,
    pub(crate) event_queue: MinQueue<Channel, LogicalTime>,
    /// Number of live processes counting toward liveness.
    pub(crate) active: usize,
    pub(crate) running: Option<ProcessId>,
    /// Unwind payload from a fiber that died; surfaced by the driver.
    pub(crate) poison: Option<Box<dyn Any + Send>>,
    next_pid: u64,
    next_chan: u64,
    root_started: bool,
    stack_size: Option<usize>,
}

impl State {
    fn new(config: RuntimeConfig) -> State {
        State {
            now: config.start_time,
            procs: HashMap::new(),
            run_stack: Vec::new(),
            run_queue: MinQueue::new(),
            event_queue: MinQueue::new(),
            active: 0,
            running: None,
            poison: None,
            next_pid: 0,
            next_chan: 0,
            root_started: false,
            stack_size: config.stack_size,
        }
    }

    pub(crate) fn proc(&self, pid: ProcessId) -> &ProcRec {
        self.procs.get(&pid).expect("unknown process id")
    }

    pub(crate) fn proc_mut(&mut self, pid: ProcessId) -> &mut ProcRec {
        self.procs.get_mut(&pid).expect("unknown process id")
    }

    pub(crate) fn next_event_time(&self) -> LogicalTime {
        self.event_queue
            .peek()
            .map(|(_, t)| *t)
            .unwrap_or(LogicalTime::NEVER)
    }

    pub(crate) fn alloc_channel(&mut self, init: Vec<(Key, Value)>) -> Channel {
        let id = self.next_chan;
        self.next_chan += 1;
        Channel::new(id, init, self.now)
    }

    /// Creates a process record and its fiber thread, parked until first
    /// resumed. The new process counts as active immediately.
    pub(crate) fn new_process(
        &mut self,
        core: &Arc<Core>,
        body: ProcBody,
        prio: Priority,
    ) -> (ProcessId, Channel) {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        let ret = self.alloc_channel(Vec::new());
        let (resume_tx, yield_rx, handle) =
            spawn_fiber(Arc::clone(core), pid, ret.clone(), body, self.stack_size);
        self.procs.insert(
            pid,
            ProcRec {
                prio,
                active: true,
                scheduled: false,
                phase: Phase::New,
                deferred: Vec::new(),
                defer_cursor: None,
                resume_tx,
                yield_rx,
                thread: Some(handle),
            },
        );
        self.active += 1;
        (pid, ret)
    }

    /// Instant assignment by a running process. Sensitized processes of
    /// strictly lower priority than the writer are woken; equal-or-higher
    /// ones have already executed this instant and stay sensitized.
    pub(crate) fn instant_assign(
        &mut self,
        chan: &Channel,
        key: Key,
        write: Write,
        writer: ProcessId,
    ) {
        debug_assert_eq!(self.running, Some(writer));
        let writer_prio = self.proc(writer).prio.clone();
        let mut cs = chan.lock();
        cs.apply_instant(key, write, self.now);
        let mut woken: SmallVec<[ProcessId; 8]> = SmallVec::new();
        for &pid in cs.triggers.iter() {
            if self.proc(pid).prio > writer_prio {
                woken.push(pid);
            }
        }
        for pid in &woken {
            cs.triggers.remove(pid);
        }
        drop(cs);
        for pid in woken {
            trace!(chan = chan.id(), %pid, "instant write wake");
            self.make_ready(pid);
        }
    }

    /// Records a delayed update and keeps the event queue in step with the
    /// channel's earliest pending time.
    pub(crate) fn schedule_later(
        &mut self,
        chan: &Channel,
        key: Key,
        t: LogicalTime,
        v: Value,
    ) -> RuntimeResult<()> {
        if t.is_never() {
            return Err(RuntimeError::UsageError(
                "cannot schedule an update at never".to_string(),
            ));
        }
        if t <= self.now {
            return Err(RuntimeError::TimeNotMonotonic { now: self.now, attempted: t });
        }
        let mut cs = chan.lock();
        let changed = cs.schedule(key, t, v);
        let earliest = cs.earliest;
        let was_queued = cs.scheduled;
        cs.scheduled = true;
        drop(cs);
        if !was_queued {
            self.event_queue.add(chan.clone(), earliest);
        } else if changed {
            self.event_queue.reposition(chan, earliest);
        }
        Ok(())
    }

    /// Commits a channel just dequeued from the event queue: applies every
    /// update due now, wakes all of its sensitized processes, and re-queues
    /// it if updates remain.
    fn commit_channel(&mut self, chan: &Channel) -> RuntimeResult<()> {
        let mut woken: SmallVec<[ProcessId; 8]> = SmallVec::new();
        let mut cs = chan.lock();
        cs.commit(self.now, &mut woken)?;
        let earliest = cs.earliest;
        cs.scheduled = !earliest.is_never();
        drop(cs);
        trace!(chan = chan.id(), woken = woken.len(), "commit");
        for pid in woken {
            self.make_ready(pid);
        }
        if !earliest.is_never() {
            self.event_queue.add(chan.clone(), earliest);
        }
        Ok(())
    }

    fn make_ready(&mut self, pid: ProcessId) {
        let rec = self.proc_mut(pid);
        if rec.phase != Phase::Waiting || rec.scheduled {
            return;
        }
        rec.phase = Phase::Ready;
        rec.scheduled = true;
        let prio = rec.prio.clone();
        self.run_queue.add(pid, prio);
    }

    /// Pops the highest-priority ready process: the stack top when it
    /// outranks the queue top, the queue top otherwise.
    fn dequeue_next(&mut self) -> Option<ProcessId> {
        if self.running.is_some() {
            return None;
        }
        if let Some(&top) = self.run_stack.last() {
            let stack_first = match self.run_queue.peek() {
                Some((_, queue_prio)) => self.proc(top).prio < *queue_prio,
                None => true,
            };
            if stack_first {
                return self.run_stack.pop();
            }
        }
        self.run_queue.pop().map(|(pid, _)| pid)
    }

    pub(crate) fn launch_on_stack(&mut self, pid: ProcessId) {
        let rec = self.proc_mut(pid);
        rec.phase = Phase::Ready;
        rec.scheduled = true;
        self.run_stack.push(pid);
    }

    /// Enqueues every deferred child of `pid`, in defer order.
    pub(crate) fn launch_deferred(&mut self, pid: ProcessId) {
        let rec = self.proc_mut(pid);
        let children = std::mem::take(&mut rec.deferred);
        rec.defer_cursor = None;
        for child in children {
            let crec = self.proc_mut(child);
            crec.phase = Phase::Ready;
            crec.scheduled = true;
            let prio = crec.prio.clone();
            self.run_queue.add(child, prio);
        }
    }

    /// The running process yielded to a spawned child: it goes back to the
    /// run queue at its (just relabeled) priority.
    pub(crate) fn requeue_running(&mut self, pid: ProcessId, prio: Priority) {
        self.run_queue.add(pid, prio);
        self.running = None;
    }

    /// The running process entered a wait.
    pub(crate) fn suspend_running(&mut self, pid: ProcessId) {
        let rec = self.proc_mut(pid);
        rec.phase = Phase::Waiting;
        rec.scheduled = false;
        self.running = None;
    }

    /// The running process terminated (or died): retire its priority and
    /// stop counting it toward liveness.
    pub(crate) fn retire_running(&mut self, pid: ProcessId) {
        let rec = self.proc_mut(pid);
        rec.phase = Phase::Done;
        rec.scheduled = false;
        let was_active = rec.active;
        if was_active {
            rec.active = false;
        }
        rec.prio.delete();
        if was_active {
            self.active -= 1;
        }
        self.running = None;
    }

    pub(crate) fn set_active_flag(&mut self, pid: ProcessId, active: bool) {
        let rec = self.proc_mut(pid);
        if rec.active == active {
            return;
        }
        rec.active = active;
        if active {
            self.active += 1;
        } else {
            self.active -= 1;
        }
    }
}

/// Runtime construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Logical time of the first instant. Zero unless a backend supplies
    /// its own epoch.
    pub start_time: LogicalTime,
    /// Stack size for process fiber threads; `None` uses the platform
    /// default.
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { start_time: LogicalTime::ZERO, stack_size: None }
    }
}

/// A deterministic discrete-event runtime instance.
///
/// The common entry point is [`Runtime::start`] (or the free function
/// [`start`]), which drives the tick loop to completion. Real-time backends
/// instead call [`set_start`], then alternate [`set_time`] and
/// [`run_instant`] as wall-clock timers fire, injecting external events
/// with [`schedule_update`].
///
/// [`set_start`]: Runtime::set_start
/// [`set_time`]: Runtime::set_time
/// [`run_instant`]: Runtime::run_instant
/// [`schedule_update`]: Runtime::schedule_update
pub struct Runtime {
    core: Arc<Core>,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Runtime {
        Runtime {
            core: Arc::new(Core { state: Mutex::new(State::new(config)) }),
        }
    }

    /// The current logical time.
    pub fn now(&self) -> LogicalTime {
        self.core.state.lock().now
    }

    /// Time of the earliest queued channel update, or `NEVER`.
    pub fn next_event_time(&self) -> LogicalTime {
        self.core.state.lock().next_event_time()
    }

    /// Number of processes counting toward runtime liveness.
    pub fn num_active(&self) -> usize {
        self.core.state.lock().active
    }

    /// Allocates a channel table. Callable before `start` to share
    /// channels between the host and the entry process.
    pub fn channel<K, V, I>(&self, init: I) -> Channel
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

    /// Creates the root process and makes it ready, without running
    /// anything yet. Returns the root's return channel.
    pub fn set_start<F>(&mut self, entry: F) -> RuntimeResult<Channel>
    where
        F: FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static,
    {
        let mut state = self.core.state.lock();
        if state.root_started {
            return Err(RuntimeError::UsageError(
                "runtime already started".to_string(),
            ));
        }
        state.root_started = true;
        let prio = Priority::new_base();
        let (pid, ret) = state.new_process(&self.core, Box::new(entry), prio);
        state.launch_on_stack(pid);
        debug!(start_time = %state.now, "root process ready");
        Ok(ret)
    }

    /// Advances logical time. Strictly monotonic.
    pub fn set_time(&mut self, t: LogicalTime) -> RuntimeResult<()> {
        let mut state = self.core.state.lock();
        if t <= state.now {
            return Err(RuntimeError::TimeNotMonotonic { now: state.now, attempted: t });
        }
        trace!(from = %state.now, to = %t, "advance");
        state.now = t;
        Ok(())
    }

    /// Schedules an external event: `chan[key] = value` at time `t`, which
    /// must be strictly in the future. Intended for backends injecting
    /// input between instants.
    pub fn schedule_update(
        &mut self,
        chan: &Channel,
        t: LogicalTime,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> RuntimeResult<()> {
        self.core
            .state
            .lock()
            .schedule_later(chan, key.into(), t, value.into())
    }

    /// Executes one instant at the current logical time: commits every
    /// channel due now, then runs ready processes in priority order until
    /// the run stack and run queue drain.
    pub fn run_instant(&mut self) -> RuntimeResult<()> {
        {
            let state = self.core.state.lock();
            debug!(time = %state.now, "instant");
        }
        loop {
            let due = {
                let mut state = self.core.state.lock();
                let head = state.event_queue.peek().map(|(_, t)| *t);
                match head {
                    Some(t) if t < state.now => {
                        return Err(RuntimeError::CommitOutOfOrder { now: state.now, earliest: t });
                    }
                    Some(t) if t == state.now => state.event_queue.pop().map(|(c, _)| c),
                    _ => None,
                }
            };
            match due {
                Some(chan) => {
                    self.core.state.lock().commit_channel(&chan)?;
                }
                None => break,
            }
        }

        loop {
            let next = self.core.state.lock().dequeue_next();
            match next {
                Some(pid) => self.resume(pid)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Runs the program to completion: first instant, then the tick loop,
    /// until no active processes remain or no update is scheduled. Returns
    /// the final logical time and the entry process's return values.
    pub fn start<F>(mut self, entry: F) -> RuntimeResult<(LogicalTime, Vec<Value>)>
    where
        F: FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static,
    {
        let ret = self.set_start(entry)?;
        self.run_instant()?;
        loop {
            let (active, t) = {
                let state = self.core.state.lock();
                (state.active, state.next_event_time())
            };
            if active == 0 || t.is_never() {
                break;
            }
            self.set_time(t)?;
            self.run_instant()?;
        }
        let final_time = self.now();
        debug!(time = %final_time, "runtime finished");
        Ok((final_time, ret.returns()))
    }

    /// Hands control to one process and blocks until it parks, terminates,
    /// or dies.
    fn resume(&mut self, pid: ProcessId) -> RuntimeResult<()> {
        let (resume_tx, yield_rx) = {
            let mut state = self.core.state.lock();
            let rec = state.proc_mut(pid);
            rec.phase = Phase::Running;
            rec.scheduled = false;
            let endpoints = (rec.resume_tx.clone(), rec.yield_rx.clone());
            state.running = Some(pid);
            endpoints
        };

        if resume_tx.send(Resume::Run).is_err() {
            return self.reap_failed(pid);
        }
        match yield_rx.recv() {
            Ok(YieldMsg::Parked) => Ok(()),
            Ok(YieldMsg::Done) => {
                self.reap(pid);
                Ok(())
            }
            Err(_) => self.reap_failed(pid),
        }
    }

    /// Joins and forgets a cleanly terminated process.
    fn reap(&mut self, pid: ProcessId) {
        let handle = {
            let mut state = self.core.state.lock();
            state.procs.get_mut(&pid).and_then(|rec| rec.thread.take())
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.core.state.lock().procs.remove(&pid);
    }

    /// A fiber died without a clean handshake: collect its unwind payload.
    /// Runtime errors surface as `Err`; anything else is a genuine user
    /// panic and propagates to the caller.
    fn reap_failed(&mut self, pid: ProcessId) -> RuntimeResult<()> {
        self.reap(pid);
        let payload = self.core.state.lock().poison.take();
        match payload {
            Some(payload) => match payload.downcast::<RuntimeError>() {
                Ok(e) => Err(*e),
                Err(other) => std::panic::resume_unwind(other),
            },
            None => Err(RuntimeError::UsageError(
                "process fiber died unexpectedly".to_string(),
            )),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl Drop for Runtime {
    /// Cancels every remaining fiber. Parked fibers unwind without running
    /// further user code; never-started fibers exit directly.
    fn drop(&mut self) {
        let victims: Vec<(Sender<Resume>, Option<JoinHandle<()>>)> = {
            let mut state = self.core.state.lock();
            state
                .procs
                .values_mut()
                .map(|rec| (rec.resume_tx.clone(), rec.thread.take()))
                .collect()
        };
        for (tx, _) in &victims {
            let _ = tx.send(Resume::Cancel);
        }
        for (_, handle) in victims {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

/// Runs `entry` as the root process of a fresh default-configured runtime.
///
/// Returns the final logical time and the entry process's return values.
pub fn start<F>(entry: F) -> RuntimeResult<(LogicalTime, Vec<Value>)>
where
    F: FnOnce(&mut ProcCtx) -> Vec<Value> + Send + 'static,
{
    Runtime::new().start(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process::WaitSpec;
    use crate::runtime::time::Duration;

    #[test]
    fn test_trivial_root_returns_at_zero() {
        let (t, returns) = start(|_ctx| vec![Value::Int(41)]).unwrap();
        assert_eq!(t, LogicalTime::ZERO);
        assert_eq!(returns, vec![Value::Int(41)]);
    }

    #[test]
    fn test_active_count_drains() {
        let mut rt = Runtime::new();
        let ret = rt.set_start(|_ctx| Vec::new()).unwrap();
        assert_eq!(rt.num_active(), 1);
        rt.run_instant().unwrap();
        assert_eq!(rt.num_active(), 0);
        assert!(ret.terminated());
    }

    #[test]
    fn test_empty_wait_is_noop() {
        let (t, returns) = start(|ctx| {
            let flags = ctx.wait(Vec::<WaitSpec>::new());
            assert!(flags.is_empty());
            vec![Value::Int(1)]
        })
        .unwrap();
        assert_eq!(t, LogicalTime::ZERO);
        assert_eq!(returns, vec![Value::Int(1)]);
    }

    #[test]
    fn test_set_time_must_advance() {
        let mut rt = Runtime::new();
        assert!(matches!(
            rt.set_time(LogicalTime::ZERO),
            Err(RuntimeError::TimeNotMonotonic { .. })
        ));
        rt.set_time(LogicalTime::new(3)).unwrap();
        assert_eq!(rt.now(), LogicalTime::new(3));
        assert!(rt.set_time(LogicalTime::new(3)).is_err());
    }

    #[test]
    fn test_second_start_rejected() {
        let mut rt = Runtime::new();
        rt.set_start(|_ctx| Vec::new()).unwrap();
        let err = rt.set_start(|_ctx| Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::UsageError(_)));
    }

    #[test]
    fn test_spawn_runs_child_within_instant() {
        let (t, returns) = start(|ctx| {
            let log = ctx.channel([("order", Value::Str(String::new()))]);
            let r = ctx.spawn({
                let log = log.clone();
                move |ctx| {
                    let seen = log.get("order").unwrap().as_str().unwrap().to_string();
                    ctx.set(&log, "order", format!("{}child,", seen));
                    vec![Value::Int(10)]
                }
            });
            // The child already ran: spawn yields into it immediately.
            assert!(r.terminated());
            assert_eq!(r.returns(), vec![Value::Int(10)]);
            let seen = log.get("order").unwrap().as_str().unwrap().to_string();
            vec![Value::Str(format!("{}parent", seen))]
        })
        .unwrap();
        assert_eq!(t, LogicalTime::ZERO);
        assert_eq!(returns, vec![Value::Str("child,parent".to_string())]);
    }

    #[test]
    fn test_after_and_tick_loop() {
        let (t, returns) = start(|ctx| {
            let c = ctx.channel([("v", Value::Int(0))]);
            ctx.after(Duration::new(4), &c, "v", Value::Int(9));
            ctx.wait_one(&c);
            vec![c.get("v").unwrap()]
        })
        .unwrap();
        assert_eq!(t, LogicalTime::new(4));
        assert_eq!(returns, vec![Value::Int(9)]);
    }

    #[test]
    fn test_zero_delay_rejected() {
        let err = start(|ctx| {
            let c = ctx.channel([("v", Value::Int(0))]);
            ctx.after(Duration::new(0), &c, "v", Value::Int(1));
            Vec::new()
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::ZeroDelay);
    }

    #[test]
    fn test_user_panic_propagates() {
        let result = std::panic::catch_unwind(|| {
            let _ = start(|_ctx| panic!("boom in process"));
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_defer_runs_after_parent_suspends() {
        let (t, returns) = start(|ctx| {
            let log = ctx.channel([("order", Value::Str(String::new()))]);
            let tick = ctx.channel([("go", Value::Bool(false))]);
            let append = |ctx: &mut ProcCtx, log: &Channel, tag: &str| {
                let seen = log.get("order").unwrap().as_str().unwrap().to_string();
                ctx.set(log, "order", format!("{}{},", seen, tag));
            };
            ctx.defer({
                let log = log.clone();
                move |ctx| {
                    append(ctx, &log, "d1");
                    Vec::new()
                }
            });
            ctx.defer({
                let log = log.clone();
                move |ctx| {
                    append(ctx, &log, "d2");
                    Vec::new()
                }
            });
            append(ctx, &log, "parent");
            // Deferred children have not run yet.
            assert_eq!(log.get("order").unwrap().as_str().unwrap(), "parent,");
            // Suspending releases them; they run within this instant, in
            // defer order, and the commit at t=1 wakes us afterwards.
            ctx.after(Duration::new(1), &tick, "go", Value::Bool(true));
            ctx.wait_one(&tick);
            vec![log.get("order").unwrap()]
        })
        .unwrap();
        assert_eq!(t, LogicalTime::new(1));
        assert_eq!(returns, vec![Value::Str("parent,d1,d2,".to_string())]);
    }
}
