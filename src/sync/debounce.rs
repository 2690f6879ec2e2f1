//! Trailing-edge, per-key debouncing.
//!
//! The debouncer holds no timers of its own: it records a deadline per key
//! and the owner sleeps until [`Debouncer::next_deadline`], then drains
//! [`Debouncer::take_due`]. Scheduling a key that is already pending replaces
//! its payload and pushes its deadline out, so at most one entry exists per key.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Pending<P> {
    deadline: Instant,
    payload: P,
    coalesced: u32,
}

#[derive(Debug)]
pub struct Debouncer<K, P> {
    window: Duration,
    pending: HashMap<K, Pending<P>>,
}

/// A payload whose debounce window elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed<K, P> {
    pub key: K,
    pub payload: P,
    /// How many earlier payloads this one superseded.
    pub coalesced: u32,
}

impl<K, P> Debouncer<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Arms (or re-arms) the timer for `key`. Returns `true` if an earlier
    /// payload for the same key was replaced.
    pub fn schedule(&mut self, key: K, payload: P, now: Instant) -> bool {
        let deadline = now + self.window;
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.deadline = deadline;
                entry.payload = payload;
                entry.coalesced += 1;
                true
            }
            None => {
                self.pending.insert(
                    key,
                    Pending {
                        deadline,
                        payload,
                        coalesced: 0,
                    },
                );
                false
            }
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Removes and returns every entry whose deadline is at or before `now`,
    /// earliest deadline first.
    pub fn take_due(&mut self, now: Instant) -> Vec<Flushed<K, P>> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut flushed: Vec<(Instant, Flushed<K, P>)> = due
            .into_iter()
            .filter_map(|key| {
                self.pending.remove(&key).map(|p| {
                    (
                        p.deadline,
                        Flushed {
                            key,
                            payload: p.payload,
                            coalesced: p.coalesced,
                        },
                    )
                })
            })
            .collect();
        flushed.sort_by_key(|(deadline, _)| *deadline);
        flushed.into_iter().map(|(_, f)| f).collect()
    }

    /// Drains everything regardless of deadline (used on shutdown).
    pub fn take_all(&mut self) -> Vec<Flushed<K, P>> {
        let mut all: Vec<(Instant, Flushed<K, P>)> = self
            .pending
            .drain()
            .map(|(key, p)| {
                (
                    p.deadline,
                    Flushed {
                        key,
                        payload: p.payload,
                        coalesced: p.coalesced,
                    },
                )
            })
            .collect();
        all.sort_by_key(|(deadline, _)| *deadline);
        all.into_iter().map(|(_, f)| f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);

    #[test]
    fn rapid_events_for_one_key_coalesce_to_last_payload() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        for (i, value) in ["1", "10", "10.", "10.0", "10.0.0.5"].iter().enumerate() {
            let at = start + Duration::from_millis(40 * i as u64);
            debouncer.schedule("9001:Host", value.to_string(), at);
        }
        assert_eq!(debouncer.len(), 1);

        // Last event at +160ms, so nothing is due until +410ms.
        assert!(debouncer.take_due(start + Duration::from_millis(400)).is_empty());
        let flushed = debouncer.take_due(start + Duration::from_millis(410));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload, "10.0.0.5");
        assert_eq!(flushed[0].coalesced, 4);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn distinct_keys_flush_independently() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.schedule("9001:Host", "a", start);
        debouncer.schedule("9001:User", "b", start + Duration::from_millis(100));

        assert_eq!(debouncer.next_deadline(), Some(start + WINDOW));
        let first = debouncer.take_due(start + WINDOW);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, "9001:Host");

        let second = debouncer.take_due(start + Duration::from_millis(350));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, "9001:User");
    }

    #[test]
    fn pending_until_flushed() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        assert!(!debouncer.schedule("global", "draft", start));
        assert!(debouncer.is_pending(&"global"));
        assert!(!debouncer.is_pending(&"9001"));
        assert_eq!(debouncer.take_due(start + WINDOW).len(), 1);
        assert!(!debouncer.is_pending(&"global"));
        assert!(debouncer.next_deadline().is_none());
    }

    #[test]
    fn take_all_orders_by_deadline() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.schedule("b", 2, start + Duration::from_millis(50));
        debouncer.schedule("a", 1, start);
        let all = debouncer.take_all();
        assert_eq!(all.iter().map(|f| f.key).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(debouncer.is_empty());
    }
}
