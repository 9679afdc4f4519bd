//! Channel tables: the shared records through which processes communicate.
//!
//! A channel is a record of keyed fields with per-field last-updated
//! timestamps, a queue of pending delayed updates, and the set of processes
//! sensitized to it. Reads are available on the handle itself (and are safe
//! for a host between instants); writes go through the process context or
//! the scheduler, which own the wake bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::process::ProcessId;
use crate::runtime::time::LogicalTime;
use crate::runtime::value::{Key, Value};

/// Handle to a channel table. Cloning is cheap and all clones address the
/// same record.
#[derive(Clone)]
pub struct Channel {
    id: u64,
    state: Arc<Mutex<ChannelState>>,
}

impl Channel {
    pub(crate) fn new(id: u64, init: Vec<(Key, Value)>, now: LogicalTime) -> Channel {
        let mut values = BTreeMap::new();
        let mut last = BTreeMap::new();
        for (k, v) in init {
            last.insert(k.clone(), now);
            values.insert(k, v);
        }
        let state = ChannelState {
            values,
            last,
            later: BTreeMap::new(),
            earliest: LogicalTime::NEVER,
            triggers: BTreeSet::new(),
            scheduled: false,
        };
        Channel { id, state: Arc::new(Mutex::new(state)) }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    /// Current value of a field, or `None` if absent.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        self.state.lock().values.get(&key.into()).cloned()
    }

    /// Timestamp of the most recent commit to any field.
    pub fn last_updated(&self) -> Option<LogicalTime> {
        self.state.lock().last.values().max().copied()
    }

    /// Timestamp of the most recent commit to one field.
    pub fn last_updated_key(&self, key: impl Into<Key>) -> Option<LogicalTime> {
        self.state.lock().last.get(&key.into()).copied()
    }

    /// Whether the owning process has terminated. Meaningful on return
    /// channels, where termination sets the `terminated` field.
    pub fn terminated(&self) -> bool {
        self.get(Key::terminated()) == Some(Value::Bool(true))
    }

    /// Return values posted by a terminated process: the values under the
    /// numeric keys `1..`, in order, stopping at the first absent key.
    pub fn returns(&self) -> Vec<Value> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for i in 1.. {
            match state.values.get(&Key::ret(i)) {
                Some(v) => out.push(v.clone()),
                None => break,
            }
        }
        out
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("values", &state.values)
            .field("earliest", &state.earliest)
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "{{")?;
        for (i, (k, v)) in state.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// A field write: either a new value or the delete sentinel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Write {
    Put(Value),
    Delete,
}

pub(crate) struct ChannelState {
    pub(crate) values: BTreeMap<Key, Value>,
    pub(crate) last: BTreeMap<Key, LogicalTime>,
    pub(crate) later: BTreeMap<Key, (LogicalTime, Value)>,
    /// Min over `later`, or `NEVER` when no update is pending.
    pub(crate) earliest: LogicalTime,
    /// Processes blocked pending any update, by id.
    pub(crate) triggers: BTreeSet<ProcessId>,
    /// True iff this channel is currently in the scheduler's event queue.
    pub(crate) scheduled: bool,
}

impl ChannelState {
    /// Applies an instant write: value and timestamp move together, and the
    /// delete sentinel clears both.
    pub(crate) fn apply_instant(&mut self, key: Key, write: Write, now: LogicalTime) {
        match write {
            Write::Put(v) => {
                self.values.insert(key.clone(), v);
                self.last.insert(key, now);
            }
            Write::Delete => {
                self.values.remove(&key);
                self.last.remove(&key);
            }
        }
    }

    /// Records a delayed update of `key` at time `t`, which must be in the
    /// strict future. Returns true when `earliest` changed (the scheduler
    /// then inserts or repositions the channel in the event queue).
    pub(crate) fn schedule(&mut self, key: Key, t: LogicalTime, v: Value) -> bool {
        let previous = self.later.insert(key, (t, v));
        let old_earliest = self.earliest;
        match previous {
            // Overwriting the entry that defined `earliest` with a later
            // time invalidates the cached minimum: rescan.
            Some((t_old, _)) if t_old < t && t_old == self.earliest => {
                self.recompute_earliest();
            }
            _ => {
                self.earliest = self.earliest.min(t);
            }
        }
        self.earliest != old_earliest
    }

    /// Moves every update due at `now` into the visible record.
    ///
    /// Precondition: `earliest == now`. The woken trigger set is drained
    /// into `woken`; the caller enqueues those processes and reschedules
    /// the channel if updates remain.
    pub(crate) fn commit(
        &mut self,
        now: LogicalTime,
        woken: &mut SmallVec<[ProcessId; 8]>,
    ) -> RuntimeResult<()> {
        if self.earliest != now {
            return Err(RuntimeError::CommitOutOfOrder { now, earliest: self.earliest });
        }
        let due: SmallVec<[Key; 4]> = self
            .later
            .iter()
            .filter(|(_, (t, _))| *t <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let (t, v) = self.later.remove(&key).expect("due key vanished");
            debug_assert!(t == now, "stale update left in channel");
            self.values.insert(key.clone(), v);
            self.last.insert(key, t);
        }
        self.recompute_earliest();
        woken.extend(self.triggers.iter().copied());
        self.triggers.clear();
        Ok(())
    }

    pub(crate) fn sensitize(&mut self, pid: ProcessId) {
        self.triggers.insert(pid);
    }

    pub(crate) fn desensitize(&mut self, pid: ProcessId) {
        self.triggers.remove(&pid);
    }

    pub(crate) fn is_sensitized(&self, pid: ProcessId) -> bool {
        self.triggers.contains(&pid)
    }

    fn recompute_earliest(&mut self) {
        self.earliest = self
            .later
            .values()
            .map(|(t, _)| *t)
            .min()
            .unwrap_or(LogicalTime::NEVER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> Channel {
        Channel::new(0, vec![(Key::from("k"), Value::Int(0))], LogicalTime::ZERO)
    }

    #[test]
    fn test_new_initializes_last() {
        let c = Channel::new(1, vec![(Key::from("a"), Value::Int(1))], LogicalTime::new(4));
        assert_eq!(c.get("a"), Some(Value::Int(1)));
        assert_eq!(c.last_updated_key("a"), Some(LogicalTime::new(4)));
        assert_eq!(c.last_updated(), Some(LogicalTime::new(4)));
        assert_eq!(c.lock().earliest, LogicalTime::NEVER);
    }

    #[test]
    fn test_instant_write_and_delete() {
        let c = chan();
        {
            let mut state = c.lock();
            state.apply_instant(Key::from("k"), Write::Put(Value::Int(7)), LogicalTime::new(2));
        }
        assert_eq!(c.get("k"), Some(Value::Int(7)));
        assert_eq!(c.last_updated_key("k"), Some(LogicalTime::new(2)));
        {
            let mut state = c.lock();
            state.apply_instant(Key::from("k"), Write::Delete, LogicalTime::new(3));
        }
        assert_eq!(c.get("k"), None);
        assert_eq!(c.last_updated_key("k"), None);
    }

    #[test]
    fn test_schedule_tracks_earliest() {
        let c = chan();
        let mut state = c.lock();
        assert!(state.schedule(Key::from("k"), LogicalTime::new(5), Value::Int(1)));
        assert_eq!(state.earliest, LogicalTime::new(5));
        assert!(state.schedule(Key::from("j"), LogicalTime::new(3), Value::Int(2)));
        assert_eq!(state.earliest, LogicalTime::new(3));
        // A later update on another key leaves the minimum alone.
        assert!(!state.schedule(Key::from("m"), LogicalTime::new(9), Value::Int(3)));
        assert_eq!(state.earliest, LogicalTime::new(3));
    }

    #[test]
    fn test_overwrite_earlier_with_later_rescans() {
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(3), Value::Int(1));
        state.schedule(Key::from("j"), LogicalTime::new(6), Value::Int(2));
        // k defined the minimum; pushing it to 7 must fall back to j's 6.
        assert!(state.schedule(Key::from("k"), LogicalTime::new(7), Value::Int(3)));
        assert_eq!(state.earliest, LogicalTime::new(6));
    }

    #[test]
    fn test_overwrite_later_with_earlier() {
        // Schedule at 5 then at 3: the pending update is the later call's.
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(5), Value::Str("A".into()));
        assert!(state.schedule(Key::from("k"), LogicalTime::new(3), Value::Str("B".into())));
        assert_eq!(state.earliest, LogicalTime::new(3));
        assert_eq!(
            state.later.get(&Key::from("k")),
            Some(&(LogicalTime::new(3), Value::Str("B".into())))
        );
    }

    #[test]
    fn test_same_time_overwrite_is_last_call() {
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(4), Value::Int(1));
        assert!(!state.schedule(Key::from("k"), LogicalTime::new(4), Value::Int(2)));
        assert_eq!(
            state.later.get(&Key::from("k")),
            Some(&(LogicalTime::new(4), Value::Int(2)))
        );
        assert_eq!(state.earliest, LogicalTime::new(4));
    }

    #[test]
    fn test_commit_applies_due_and_wakes_all() {
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(3), Value::Int(9));
        state.schedule(Key::from("j"), LogicalTime::new(8), Value::Int(1));
        state.sensitize(ProcessId(1));
        state.sensitize(ProcessId(2));

        let mut woken = SmallVec::new();
        state.commit(LogicalTime::new(3), &mut woken).unwrap();

        assert_eq!(state.values.get(&Key::from("k")), Some(&Value::Int(9)));
        assert_eq!(state.last.get(&Key::from("k")), Some(&LogicalTime::new(3)));
        assert_eq!(state.earliest, LogicalTime::new(8));
        assert_eq!(woken.as_slice(), &[ProcessId(1), ProcessId(2)]);
        assert!(state.triggers.is_empty());
    }

    #[test]
    fn test_commit_to_never_when_drained() {
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(3), Value::Str("B".into()));
        let mut woken = SmallVec::new();
        state.commit(LogicalTime::new(3), &mut woken).unwrap();
        assert_eq!(state.earliest, LogicalTime::NEVER);
        assert!(state.later.is_empty());
    }

    #[test]
    fn test_commit_out_of_order_rejected() {
        let c = chan();
        let mut state = c.lock();
        state.schedule(Key::from("k"), LogicalTime::new(5), Value::Int(1));
        let mut woken = SmallVec::new();
        let err = state.commit(LogicalTime::new(4), &mut woken).unwrap_err();
        assert!(matches!(err, RuntimeError::CommitOutOfOrder { .. }));
    }

    #[test]
    fn test_sensitize_roundtrip() {
        let c = chan();
        let mut state = c.lock();
        let before = state.triggers.clone();
        state.sensitize(ProcessId(5));
        state.sensitize(ProcessId(5));
        assert!(state.is_sensitized(ProcessId(5)));
        state.desensitize(ProcessId(5));
        assert_eq!(state.triggers, before);
    }

    #[test]
    fn test_returns_collects_numeric_prefix() {
        let c = Channel::new(
            2,
            vec![
                (Key::ret(1), Value::Int(10)),
                (Key::ret(2), Value::Int(20)),
                (Key::ret(4), Value::Int(40)),
            ],
            LogicalTime::ZERO,
        );
        assert_eq!(c.returns(), vec![Value::Int(10), Value::Int(20)]);
    }
}
