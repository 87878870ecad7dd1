use embassy_time::{Duration, Instant};

/// Pending self-events keyed by timer kind.
///
/// A timeout is just another event that becomes due at a deadline; the slot
/// runner sleeps until [`DeferredTimers::next_deadline`] and feeds whatever
/// [`DeferredTimers::take_due`] returns back into the owning machine.
#[derive(Debug)]
pub struct DeferredTimers<K, E> {
    entries: Vec<Entry<K, E>>,
}

#[derive(Debug)]
struct Entry<K, E> {
    key: K,
    deadline: Instant,
    event: E,
}

impl<K, E> Default for DeferredTimers<K, E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Copy + PartialEq, E> DeferredTimers<K, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` after `delay`, replacing a pending timer of the same key.
    pub fn schedule(&mut self, key: K, delay: Duration, event: E) {
        self.schedule_at(key, Instant::now() + delay, event);
    }

    pub fn schedule_at(&mut self, key: K, deadline: Instant, event: E) {
        self.cancel(key);
        self.entries.push(Entry {
            key,
            deadline,
            event,
        });
    }

    /// Returns whether a timer was pending.
    pub fn cancel(&mut self, key: K) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        before != self.entries.len()
    }

    /// Move a pending timer to fire after `delay` from now. Does nothing when
    /// no timer of that key is pending.
    pub fn reschedule(&mut self, key: K, delay: Duration) -> bool {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.deadline = Instant::now() + delay;
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return every event due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<E> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].deadline <= now {
                due.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|e| e.deadline);
        due.into_iter().map(|e| e.event).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Key {
        Connect,
        Disconnect,
    }

    #[test]
    fn schedule_replaces_same_key() {
        let mut timers = DeferredTimers::new();
        timers.schedule(Key::Connect, Duration::from_secs(10), 1);
        timers.schedule(Key::Connect, Duration::from_secs(20), 2);
        assert!(timers.is_pending(Key::Connect));
        assert!(!timers.is_pending(Key::Disconnect));

        let due = timers.take_due(Instant::now() + Duration::from_secs(30));
        assert_eq!(due, vec![2]);
        assert!(timers.is_empty());
    }

    #[test]
    fn reschedule_only_touches_pending() {
        let mut timers = DeferredTimers::new();
        assert!(!timers.reschedule(Key::Disconnect, Duration::from_secs(1)));

        timers.schedule(Key::Disconnect, Duration::from_secs(90), "timeout");
        let before = timers.deadline(Key::Disconnect).unwrap();
        assert!(timers.reschedule(Key::Disconnect, Duration::from_secs(1)));
        assert!(timers.deadline(Key::Disconnect).unwrap() < before);
    }

    #[test]
    fn take_due_leaves_future_timers() {
        let mut timers = DeferredTimers::new();
        let now = Instant::now();
        timers.schedule_at(Key::Connect, now + Duration::from_secs(5), 'a');
        timers.schedule_at(Key::Disconnect, now + Duration::from_secs(50), 'b');
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(timers.take_due(now + Duration::from_secs(6)), vec!['a']);
        assert!(timers.cancel(Key::Disconnect));
        assert_eq!(timers.next_deadline(), None);
    }
}
