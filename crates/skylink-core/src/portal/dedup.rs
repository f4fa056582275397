/// Fixed-size ring of recently handled message ids.
#[derive(Debug, Clone)]
pub struct RecentlyHandled {
    slots: Vec<Option<String>>,
    next: usize,
}

impl RecentlyHandled {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len.max(1)],
            next: 0,
        }
    }

    pub fn push(&mut self, id: impl Into<String>) {
        self.slots[self.next] = Some(id.into());
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Walks back from the newest entry over every slot, stopping early at
    /// the first slot never written.
    pub fn contains(&self, id: &str) -> bool {
        let len = self.slots.len();
        for step in 1..=len {
            match &self.slots[(self.next + len - step) % len] {
                None => return false,
                Some(seen) if seen == id => return true,
                Some(_) => {}
            }
        }
        false
    }
}

/// Per-portal inbound bookkeeping.
#[derive(Debug)]
pub(crate) struct HandledState {
    /// Unix seconds of the last message that passed the ordering check.
    pub last_message_ts: i64,
    pub recent: RecentlyHandled,
}

impl HandledState {
    pub fn new(window: usize) -> Self {
        Self {
            last_message_ts: 0,
            recent: RecentlyHandled::new(window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_contains_nothing() {
        let window = RecentlyHandled::new(4);
        assert!(!window.contains(""));
        assert!(!window.contains("a"));
    }

    #[test]
    fn finds_every_live_entry() {
        let mut window = RecentlyHandled::new(4);
        for id in ["a", "b", "c", "d"] {
            window.push(id);
        }
        for id in ["a", "b", "c", "d"] {
            assert!(window.contains(id), "{id}");
        }
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut window = RecentlyHandled::new(3);
        for id in ["a", "b", "c", "d"] {
            window.push(id);
        }
        assert!(!window.contains("a"));
        assert!(window.contains("b"));
        assert!(window.contains("d"));
    }
}
