use std::collections::HashMap;

/// Acceptance ids of orders still considered live.
///
/// Iteration follows insertion order so diagnostics are stable.
#[derive(Debug, Default, Clone)]
pub struct OutstandingOrders {
    ids: HashMap<String, u64>,
    next_seq: u64,
}

impl OutstandingOrders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an id. Returns false if it was already tracked.
    pub fn insert(&mut self, acceptance_id: &str) -> bool {
        if self.ids.contains_key(acceptance_id) {
            return false;
        }
        self.ids.insert(acceptance_id.to_string(), self.next_seq);
        self.next_seq += 1;
        true
    }

    /// Stop tracking an id. Returns false if it was not tracked.
    pub fn remove(&mut self, acceptance_id: &str) -> bool {
        self.ids.remove(acceptance_id).is_some()
    }

    pub fn contains(&self, acceptance_id: &str) -> bool {
        self.ids.contains_key(acceptance_id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &u64)> = self.ids.iter().collect();
        entries.sort_by_key(|(_, seq)| **seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }
}
