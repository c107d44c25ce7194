//! Paced outbound command queue.
//!
//! Commands wait here until the drain timer releases them one per tick.
//! Enqueueing a command whose [`DedupKey`] is already queued replaces the
//! queued value in place, so a burst of updates to one parameter costs a
//! single transmission. Inbound values retire the queued get they answer.

use crate::cache::{CacheKey, StateCache};
use rcplink_protocol::{Catalog, Command, Direction, ParamDef, ProtocolError, Value};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Identity used to coalesce queued commands.
///
/// `column` is `None` for parameters whose columns form one aggregate
/// family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub direction: Direction,
    pub address: String,
    pub row: u32,
    pub column: Option<u32>,
}

/// A set whose value is computed from cached state at transmission time.
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    /// Add a delta to the current value, clamped to the domain.
    Relative(i64),
    /// Invert the current boolean value.
    Toggle,
    /// Copy the value of another parameter.
    CopyFrom(CacheKey),
}

impl Deferred {
    /// Key whose cached value this set depends on.
    pub fn dependency(&self, target: &Command) -> CacheKey {
        match self {
            Deferred::CopyFrom(source) => source.clone(),
            Deferred::Relative(_) | Deferred::Toggle => CacheKey::from(target),
        }
    }

    /// Computes the value to transmit from the dependency's current value.
    pub fn resolve(&self, def: &ParamDef, current: &Value) -> Result<Value, ProtocolError> {
        let mismatch = || ProtocolError::TypeMismatch {
            kind: def.kind.name(),
            value: current.to_string(),
        };

        match self {
            Deferred::Relative(delta) => {
                if !def.kind.is_numeric() {
                    return Err(mismatch());
                }
                let raw = current.as_i64().ok_or_else(mismatch)?;
                Ok(Value::Int(def.clamp(raw.saturating_add(*delta))))
            }
            Deferred::Toggle => {
                let on = current.as_bool().ok_or_else(mismatch)?;
                def.normalize(&Value::Bool(!on))
            }
            Deferred::CopyFrom(_) => def.normalize(current),
        }
    }
}

/// A queued command with its deferral state.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: DedupKey,
    pub command: Command,
    pub deferred: Option<Deferred>,
    /// Times this entry went back to the tail waiting for its dependency.
    pub deferrals: u32,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub reconciled: u64,
    pub deferred: u64,
    pub dropped: u64,
}

/// FIFO of outbound commands.
pub struct CommandQueue {
    catalog: Arc<Catalog>,
    entries: VecDeque<QueueEntry>,
    max_deferrals: u32,
    stats: QueueStats,
}

impl CommandQueue {
    pub fn new(catalog: Arc<Catalog>, max_deferrals: u32) -> Self {
        Self {
            catalog,
            entries: VecDeque::new(),
            max_deferrals,
            stats: QueueStats::default(),
        }
    }

    fn dedup_key(&self, cmd: &Command) -> DedupKey {
        let aggregate = self
            .catalog
            .get(&cmd.address)
            .map_or(false, |def| def.aggregate_columns);
        DedupKey {
            direction: cmd.direction,
            address: cmd.address.clone(),
            row: cmd.row,
            column: if aggregate { None } else { Some(cmd.column) },
        }
    }

    /// Queues a command. Returns `false` if it was merged into an entry
    /// already waiting.
    pub fn enqueue(&mut self, command: Command) -> bool {
        self.push(command, None)
    }

    /// Queues a set whose value is computed when it reaches the head.
    pub fn enqueue_deferred(&mut self, command: Command, deferred: Deferred) -> bool {
        self.push(command, Some(deferred))
    }

    fn push(&mut self, command: Command, deferred: Option<Deferred>) -> bool {
        let key = self.dedup_key(&command);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            tracing::trace!("Coalescing {} into queued entry", command);
            // Relative steps accumulate onto whatever is pending.
            let step = match &deferred {
                Some(Deferred::Relative(delta)) if entry.command.column == command.column => {
                    Some(*delta)
                }
                _ => None,
            };
            match (step, &entry.deferred, &entry.command.value) {
                (Some(delta), Some(Deferred::Relative(queued)), _) => {
                    let total = queued.saturating_add(delta);
                    entry.deferred = Some(Deferred::Relative(total));
                }
                (Some(delta), None, Some(Value::Int(queued))) => {
                    let raw = queued.saturating_add(delta);
                    let raw = self
                        .catalog
                        .get(&entry.command.address)
                        .map_or(raw, |def| def.clamp(raw));
                    entry.command.value = Some(Value::Int(raw));
                }
                _ => {
                    entry.command = command;
                    entry.deferred = deferred;
                }
            }
            entry.deferrals = 0;
            self.stats.deduplicated += 1;
            return false;
        }

        self.entries.push_back(QueueEntry {
            key,
            command,
            deferred,
            deferrals: 0,
        });
        self.stats.enqueued += 1;
        true
    }

    /// Removes the oldest queued get answered by an inbound command.
    pub fn reconcile(&mut self, inbound: &Command) -> bool {
        if !inbound.carries_value() {
            return false;
        }

        let mut key = self.dedup_key(inbound);
        key.direction = Direction::Get;

        match self.entries.iter().position(|e| e.key == key) {
            Some(pos) => {
                self.entries.remove(pos);
                self.stats.reconciled += 1;
                true
            }
            None => false,
        }
    }

    /// Pops the head for transmission.
    ///
    /// Deferred sets are resolved against the cache first. A set whose
    /// dependency is not cached yet goes back to the tail (the cache lookup
    /// queues a get for it) and nothing is transmitted this tick.
    pub fn drain_tick(&mut self, cache: &StateCache) -> Option<Command> {
        let mut entry = self.entries.pop_front()?;
        let Some(deferred) = entry.deferred.take() else {
            return Some(entry.command);
        };

        let catalog = self.catalog.clone();
        let Some(def) = catalog.get(&entry.command.address) else {
            tracing::warn!("Dropping deferred set for unknown {}", entry.command.address);
            self.stats.dropped += 1;
            return None;
        };

        let dependency = deferred.dependency(&entry.command);
        match cache.get(&dependency, self) {
            Some(current) => match deferred.resolve(def, &current) {
                Ok(value) => {
                    entry.command.value = Some(value);
                    Some(entry.command)
                }
                Err(e) => {
                    tracing::warn!("Dropping deferred set for {}: {}", dependency, e);
                    self.stats.dropped += 1;
                    None
                }
            },
            None => {
                let readable = catalog
                    .get(&dependency.address)
                    .map_or(false, |d| d.access.readable());
                if !readable {
                    tracing::warn!("Dropping deferred set: {} cannot be read", dependency);
                    self.stats.dropped += 1;
                    return None;
                }

                entry.deferrals += 1;
                if entry.deferrals > self.max_deferrals {
                    tracing::warn!(
                        "Dropping deferred set for {} after {} deferrals",
                        entry.command.address,
                        self.max_deferrals
                    );
                    self.stats.dropped += 1;
                    return None;
                }

                entry.deferred = Some(deferred);
                self.stats.deferred += 1;
                self.entries.push_back(entry);
                None
            }
        }
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcplink_protocol::{Access, ParamKind, Status};

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::builder()
                .param(
                    ParamDef::new("mixer:fader", ParamKind::Scaled { scale: 100 })
                        .with_range(-32768, 1000),
                )
                .param(ParamDef::new("mixer:mute", ParamKind::Boolean))
                .param(ParamDef::new("mixer:name", ParamKind::String))
                .param(ParamDef::new("scene:recall", ParamKind::Integer).aggregate())
                .param(ParamDef::new("dev:reboot", ParamKind::Boolean).with_access(Access::Write))
                .build()
                .unwrap(),
        )
    }

    fn setup(max_deferrals: u32) -> (CommandQueue, StateCache) {
        let catalog = catalog();
        (
            CommandQueue::new(catalog.clone(), max_deferrals),
            StateCache::new(catalog, 16),
        )
    }

    fn deferred_set(address: &str, row: u32, column: u32) -> Command {
        Command {
            direction: Direction::Set,
            address: address.to_string(),
            row,
            column,
            value: None,
            status: None,
        }
    }

    #[test]
    fn test_fifo_order() {
        let (mut queue, cache) = setup(10);
        queue.enqueue(Command::set("mixer:mute", 0, 0, true));
        queue.enqueue(Command::set("mixer:mute", 1, 0, false));
        queue.enqueue(Command::get("mixer:fader", 0, 0));

        assert_eq!(queue.drain_tick(&cache).unwrap().row, 0);
        assert_eq!(queue.drain_tick(&cache).unwrap().row, 1);
        assert!(queue.drain_tick(&cache).unwrap().is_get());
        assert_eq!(queue.drain_tick(&cache), None);
    }

    #[test]
    fn test_dedup_replaces_in_place() {
        let (mut queue, cache) = setup(10);
        assert!(queue.enqueue(Command::set("mixer:fader", 0, 0, 100)));
        assert!(queue.enqueue(Command::set("mixer:mute", 0, 0, true)));
        assert!(!queue.enqueue(Command::set("mixer:fader", 0, 0, 200)));

        assert_eq!(queue.len(), 2);
        let first = queue.drain_tick(&cache).unwrap();
        assert_eq!(first.address, "mixer:fader");
        assert_eq!(first.value, Some(Value::Int(200)));
        assert_eq!(queue.stats().deduplicated, 1);
    }

    #[test]
    fn test_dedup_distinguishes_direction_and_index() {
        let (mut queue, _) = setup(10);
        queue.enqueue(Command::set("mixer:fader", 0, 0, 100));
        queue.enqueue(Command::get("mixer:fader", 0, 0));
        queue.enqueue(Command::set("mixer:fader", 0, 1, 100));
        queue.enqueue(Command::set("mixer:fader", 1, 0, 100));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_dedup_aggregate_columns() {
        let (mut queue, cache) = setup(10);
        queue.enqueue(Command::set("scene:recall", 0, 3, 1));
        queue.enqueue(Command::set("scene:recall", 0, 7, 1));
        assert_eq!(queue.len(), 1);

        let cmd = queue.drain_tick(&cache).unwrap();
        assert_eq!(cmd.column, 7);
    }

    #[test]
    fn test_reconcile_removes_oldest_get() {
        let (mut queue, _) = setup(10);
        queue.enqueue(Command::set("mixer:fader", 0, 0, 10));
        queue.enqueue(Command::get("mixer:fader", 0, 0));
        queue.enqueue(Command::get("mixer:mute", 0, 0));

        let inbound = Command::set("mixer:fader", 0, 0, 10).with_status(Status::Notify);
        assert!(queue.reconcile(&inbound));
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|e| !(e.command.is_get() && e.command.address == "mixer:fader")));

        // Nothing left to reconcile.
        assert!(!queue.reconcile(&inbound));
        assert_eq!(queue.stats().reconciled, 1);
    }

    #[test]
    fn test_reconcile_ignores_valueless_and_errors() {
        let (mut queue, _) = setup(10);
        queue.enqueue(Command::get("mixer:fader", 0, 0));

        let ack = Command::get("mixer:fader", 0, 0).with_status(Status::Ok);
        assert!(!queue.reconcile(&ack));

        let error = Command::set("mixer:fader", 0, 0, 1).with_status(Status::Error);
        assert!(!queue.reconcile(&error));

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reconcile_aggregate_family() {
        let (mut queue, _) = setup(10);
        queue.enqueue(Command::get("scene:recall", 0, 0));

        let inbound = Command::set("scene:recall", 0, 12, 1).with_status(Status::Notify);
        assert!(queue.reconcile(&inbound));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_relative_waits_for_dependency() {
        let (mut queue, mut cache) = setup(10);
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(250));

        // Miss: a get is queued and the set is recycled behind it.
        assert_eq!(queue.drain_tick(&cache), None);
        assert_eq!(queue.len(), 2);
        assert!(queue.front().unwrap().command.is_get());

        let get = queue.drain_tick(&cache).unwrap();
        assert!(get.is_get());

        cache.put(CacheKey::new("mixer:fader", 0, 0), Value::Int(900));
        let set = queue.drain_tick(&cache).unwrap();
        assert_eq!(set.value, Some(Value::Int(1000)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_relative_clamps_to_floor() {
        let (mut queue, mut cache) = setup(10);
        cache.put(CacheKey::new("mixer:fader", 0, 0), Value::Int(-32000));
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(-5000));

        let set = queue.drain_tick(&cache).unwrap();
        assert_eq!(set.value, Some(Value::Int(-32768)));
    }

    #[test]
    fn test_toggle_and_copy() {
        let (mut queue, mut cache) = setup(10);
        cache.put(CacheKey::new("mixer:mute", 2, 0), Value::Bool(true));
        cache.put(CacheKey::new("mixer:fader", 4, 0), Value::Int(-500));

        queue.enqueue_deferred(deferred_set("mixer:mute", 2, 0), Deferred::Toggle);
        queue.enqueue_deferred(
            deferred_set("mixer:fader", 5, 0),
            Deferred::CopyFrom(CacheKey::new("mixer:fader", 4, 0)),
        );

        assert_eq!(
            queue.drain_tick(&cache).unwrap().value,
            Some(Value::Bool(false))
        );
        let copy = queue.drain_tick(&cache).unwrap();
        assert_eq!(copy.row, 5);
        assert_eq!(copy.value, Some(Value::Int(-500)));
    }

    #[test]
    fn test_deferral_bound() {
        let (mut queue, cache) = setup(3);
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(1));

        let mut ticks = 0;
        while !queue.is_empty() {
            // The dependency never arrives; gets drain and are re-queued.
            queue.drain_tick(&cache);
            ticks += 1;
            assert!(ticks < 100);
        }

        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.stats().deferred, 3);
    }

    #[test]
    fn test_unreadable_dependency_dropped() {
        let (mut queue, cache) = setup(10);
        queue.enqueue_deferred(deferred_set("dev:reboot", 0, 0), Deferred::Toggle);

        assert_eq!(queue.drain_tick(&cache), None);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_type_mismatch_dropped() {
        let (mut queue, mut cache) = setup(10);
        cache.put(CacheKey::new("mixer:name", 0, 0), Value::Str("Vox".into()));
        queue.enqueue_deferred(deferred_set("mixer:name", 0, 0), Deferred::Relative(1));

        assert_eq!(queue.drain_tick(&cache), None);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_requeue_resets_deferrals() {
        let (mut queue, cache) = setup(10);
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(1));
        queue.drain_tick(&cache);
        assert_eq!(queue.iter().last().unwrap().deferrals, 1);

        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(2));
        let entry = queue.iter().last().unwrap();
        assert_eq!(entry.deferrals, 0);
        assert_eq!(entry.deferred, Some(Deferred::Relative(3)));
    }

    #[test]
    fn test_relative_steps_accumulate() {
        let (mut queue, mut cache) = setup(10);
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(100));
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(100));
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(-50));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().deduplicated, 2);

        cache.put(CacheKey::new("mixer:fader", 0, 0), Value::Int(0));
        let set = queue.drain_tick(&cache).unwrap();
        assert_eq!(set.value, Some(Value::Int(150)));
    }

    #[test]
    fn test_relative_step_applies_to_pending_absolute() {
        let (mut queue, cache) = setup(10);
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(100));
        queue.enqueue(Command::set("mixer:fader", 0, 0, -700));
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(100));
        assert_eq!(queue.len(), 1);

        // No cached value is needed: the pending absolute value is the base.
        let set = queue.drain_tick(&cache).unwrap();
        assert_eq!(set.value, Some(Value::Int(-600)));

        queue.enqueue(Command::set("mixer:fader", 0, 0, 900));
        queue.enqueue_deferred(deferred_set("mixer:fader", 0, 0), Deferred::Relative(500));
        let set = queue.drain_tick(&cache).unwrap();
        assert_eq!(set.value, Some(Value::Int(1000)));
    }
}
