use std::iter::FusedIterator;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use minifw_common::Rule;
use thiserror::Error;
use tokio::sync::watch;

/// An immutable view of the rule set at one point in time.
pub type Snapshot = Arc<[Rule]>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("rule store is full ({capacity} rules)")]
    CapacityExceeded { capacity: usize },
    #[error("no matching rule")]
    NotFound,
}

/// The ordered set of deny rules.
///
/// Readers clone the current [`Snapshot`] under a short shared lock and then
/// iterate without holding anything.  Writers build a new slice and swap it
/// in under the exclusive lock, so a snapshot is never observed half-updated
/// and a rule is never freed while a reader still walks it.
pub struct RuleStore {
    rules: RwLock<Snapshot>,
    capacity: Option<usize>,
    updates: watch::Sender<Snapshot>,
}

impl RuleStore {
    /// An empty store.  `None` leaves the store unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        let empty: Snapshot = Arc::from(Vec::new());
        let (updates, _) = watch::channel(empty.clone());
        Self {
            rules: RwLock::new(empty),
            capacity,
            updates,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Snapshot {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A cursor over the current rules, owned by the caller.
    pub fn snapshot_iter(&self) -> SnapshotIter {
        SnapshotIter::new(self.snapshot())
    }

    /// Receives every snapshot published after a successful mutation.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    /// Appends `rule` after every existing rule.
    pub fn add(&self, rule: Rule) -> Result<(), StoreError> {
        let mut rules = self.write();
        if let Some(capacity) = self.capacity {
            if rules.len() >= capacity {
                return Err(StoreError::CapacityExceeded { capacity });
            }
        }

        let mut next = Vec::with_capacity(rules.len() + 1);
        next.extend_from_slice(&rules);
        next.push(rule);
        self.publish(&mut rules, next);
        Ok(())
    }

    /// Removes the first rule equal to `rule`.  Later duplicates stay.
    pub fn remove(&self, rule: &Rule) -> Result<(), StoreError> {
        let mut rules = self.write();
        let index = rules
            .iter()
            .position(|stored| stored == rule)
            .ok_or(StoreError::NotFound)?;

        let mut next = rules.to_vec();
        next.remove(index);
        self.publish(&mut rules, next);
        Ok(())
    }

    /// Drains the store and returns how many rules were released.
    pub fn shutdown(&self) -> usize {
        let mut rules = self.write();
        let released = rules.len();
        if released > 0 {
            self.publish(&mut rules, Vec::new());
        }
        released
    }

    // The guarded value is only ever replaced wholesale, so a panic in
    // another writer cannot leave it torn.
    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, current: &mut Snapshot, next: Vec<Rule>) {
        *current = Arc::from(next);
        self.updates.send_replace(current.clone());
    }
}

/// Iterates one snapshot in insertion order.
#[derive(Clone)]
pub struct SnapshotIter {
    rules: Snapshot,
    pos: usize,
}

impl SnapshotIter {
    pub fn new(rules: Snapshot) -> Self {
        Self { rules, pos: 0 }
    }
}

impl Iterator for SnapshotIter {
    type Item = Rule;

    fn next(&mut self) -> Option<Rule> {
        let rule = self.rules.get(self.pos).copied()?;
        self.pos += 1;
        Some(rule)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.rules.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SnapshotIter {}

impl FusedIterator for SnapshotIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{evaluate, first_match};
    use minifw_common::{Direction, Hook, IpVersion, PacketKey, Verdict, PROTO_TCP};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn rule(port: u16) -> Rule {
        Rule::new(Direction::Inbound, IpVersion::V4).with_ports(0, port)
    }

    #[test]
    fn test_add_then_remove_restores_store() {
        let store = RuleStore::new(None);
        store.add(rule(22)).unwrap();
        store.add(rule(23)).unwrap();
        let before = store.snapshot();

        store.add(rule(80)).unwrap();
        assert_eq!(store.len(), 3);
        store.remove(&rule(80)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(&*store.snapshot(), &*before);
    }

    #[test]
    fn test_remove_missing_rule() {
        let store = RuleStore::new(None);
        assert_eq!(store.remove(&rule(22)), Err(StoreError::NotFound));

        store.add(rule(22)).unwrap();
        assert_eq!(store.remove(&rule(23)), Err(StoreError::NotFound));
        assert_eq!(&*store.snapshot(), &[rule(22)]);
    }

    #[test]
    fn test_remove_takes_first_duplicate_only() {
        let store = RuleStore::new(None);
        store.add(rule(22)).unwrap();
        store.add(rule(80)).unwrap();
        store.add(rule(22)).unwrap();

        store.remove(&rule(22)).unwrap();
        assert_eq!(&*store.snapshot(), &[rule(80), rule(22)]);
    }

    #[test]
    fn test_capacity_boundary() {
        let store = RuleStore::new(Some(3));
        for port in 1..=3 {
            store.add(rule(port)).unwrap();
        }
        assert_eq!(
            store.add(rule(4)),
            Err(StoreError::CapacityExceeded { capacity: 3 })
        );
        assert_eq!(store.len(), 3);

        // Freeing a slot makes room again.
        store.remove(&rule(2)).unwrap();
        store.add(rule(4)).unwrap();
        assert_eq!(&*store.snapshot(), &[rule(1), rule(3), rule(4)]);
    }

    #[test]
    fn test_snapshot_iter_order_and_end() {
        let store = RuleStore::new(None);
        let (r1, r2, r3) = (rule(1), rule(2), rule(3));
        store.add(r1).unwrap();
        store.add(r2).unwrap();
        store.add(r3).unwrap();

        let mut iter = store.snapshot_iter();
        assert_eq!(iter.len(), 3);
        assert_eq!(iter.next(), Some(r1));
        assert_eq!(iter.next(), Some(r2));
        assert_eq!(iter.next(), Some(r3));
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_cursors_are_independent() {
        let store = RuleStore::new(None);
        store.add(rule(1)).unwrap();
        store.add(rule(2)).unwrap();

        let mut first = store.snapshot_iter();
        assert_eq!(first.next(), Some(rule(1)));

        // A second session starts from the beginning and does not move the first.
        let second: Vec<_> = store.snapshot_iter().collect();
        assert_eq!(second, vec![rule(1), rule(2)]);
        assert_eq!(first.next(), Some(rule(2)));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let store = RuleStore::new(None);
        store.add(rule(1)).unwrap();
        let iter = store.snapshot_iter();

        store.remove(&rule(1)).unwrap();
        store.add(rule(9)).unwrap();

        assert_eq!(iter.collect::<Vec<_>>(), vec![rule(1)]);
    }

    #[test]
    fn test_shutdown_drains() {
        let store = RuleStore::new(None);
        store.add(rule(1)).unwrap();
        store.add(rule(2)).unwrap();
        assert_eq!(store.shutdown(), 2);
        assert!(store.is_empty());
        assert_eq!(store.shutdown(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_each_mutation() {
        let store = RuleStore::new(None);
        let mut updates = store.subscribe();

        store.add(rule(1)).unwrap();
        updates.changed().await.unwrap();
        assert_eq!(&**updates.borrow_and_update(), &[rule(1)]);

        // Rejected mutations publish nothing.
        assert!(store.remove(&rule(7)).is_err());
        assert!(!updates.has_changed().unwrap());

        store.remove(&rule(1)).unwrap();
        updates.changed().await.unwrap();
        assert!(updates.borrow_and_update().is_empty());
    }

    #[test]
    fn test_concurrent_readers_see_consistent_sets() {
        let store = Arc::new(RuleStore::new(None));
        let src = u32::from_be_bytes([10, 0, 0, 1]);
        let dst = u32::from_be_bytes([10, 0, 0, 2]);

        // Always present and always first: every evaluation must hit it.
        let pinned = Rule::new(Direction::Inbound, IpVersion::V4)
            .with_source_v4(src, u32::MAX)
            .with_ports(0, 1);
        // Toggled by the writer.
        let toggled = Rule::new(Direction::Inbound, IpVersion::V4)
            .with_source_v4(src, u32::MAX)
            .with_ports(0, 2);
        store.add(pinned).unwrap();

        let pinned_packet = PacketKey::v4(src, dst, PROTO_TCP, 4000, 1);
        let toggled_packet = PacketKey::v4(src, dst, PROTO_TCP, 4000, 2);
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = store.snapshot();
                        assert_eq!(
                            first_match(&snapshot, Hook::Ingress, &pinned_packet, Rule::matches),
                            Some(0)
                        );
                        let verdict = evaluate(&snapshot, Hook::Ingress, &toggled_packet);
                        assert_eq!(verdict == Verdict::Drop, snapshot.contains(&toggled));
                        assert!(snapshot.len() <= 2);
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            store.add(toggled).unwrap();
            store.remove(&toggled).unwrap();
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(&*store.snapshot(), &[pinned]);
    }
}
