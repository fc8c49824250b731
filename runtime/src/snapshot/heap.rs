//! Min-heap of evictable snapshots keyed by retention score.

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Slot {
    score: i64,
    seq: u64,
    key: String,
}

impl Slot {
    fn before(&self, other: &Slot) -> bool {
        (self.score, self.seq) < (other.score, other.seq)
    }
}

/// Binary min-heap with removal by key.
///
/// Ties on score go to the entry pushed first.
#[derive(Debug, Default)]
pub struct ScoreHeap {
    slots: Vec<Slot>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl ScoreHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    /// Insert `key`, replacing its score if already present.
    pub fn push(&mut self, key: &str, score: i64) {
        self.remove(key);
        self.next_seq += 1;
        let idx = self.slots.len();
        self.slots.push(Slot {
            score,
            seq: self.next_seq,
            key: key.to_string(),
        });
        self.positions.insert(key.to_string(), idx);
        self.sift_up(idx);
    }

    pub fn peek(&self) -> Option<(&str, i64)> {
        self.slots.first().map(|s| (s.key.as_str(), s.score))
    }

    /// Remove and return the lowest-scored entry.
    pub fn pop(&mut self) -> Option<(String, i64)> {
        if self.slots.is_empty() {
            return None;
        }
        let slot = self.take(0);
        Some((slot.key, slot.score))
    }

    /// Remove `key` wherever it sits. Returns its score.
    pub fn remove(&mut self, key: &str) -> Option<i64> {
        let idx = *self.positions.get(key)?;
        Some(self.take(idx).score)
    }

    /// Keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.key.as_str())
    }

    fn take(&mut self, idx: usize) -> Slot {
        let last = self.slots.len() - 1;
        self.swap(idx, last);
        let slot = self.slots.pop().unwrap_or_else(|| unreachable!("heap checked non-empty"));
        self.positions.remove(&slot.key);
        if idx < self.slots.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
        slot
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.slots.swap(a, b);
        self.positions.insert(self.slots[a].key.clone(), a);
        self.positions.insert(self.slots[b].key.clone(), b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.slots[idx].before(&self.slots[parent]) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && self.slots[left].before(&self.slots[smallest]) {
                smallest = left;
            }
            if right < len && self.slots[right].before(&self.slots[smallest]) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }
}
