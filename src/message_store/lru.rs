//! Recency ordering over conversation ids

use std::collections::VecDeque;

/// Most recently touched id first
#[derive(Debug, Clone, Default)]
pub struct RecencyIndex {
    order: VecDeque<String>,
}

impl RecencyIndex {
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        let mut index = Self::default();
        for id in ids {
            if !index.contains(&id) {
                index.order.push_back(id);
            }
        }
        index
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|existing| existing == id) {
            if pos == 0 {
                return;
            }
            if let Some(existing) = self.order.remove(pos) {
                self.order.push_front(existing);
            }
        } else {
            self.order.push_front(id.to_string());
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.order.iter().position(|existing| existing == id) {
            Some(pos) => self.order.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.order.iter().any(|existing| existing == id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Least recently touched first
    pub fn oldest_first(&self) -> impl Iterator<Item = &str> {
        self.order.iter().rev().map(String::as_str)
    }

    pub fn most_recent_first(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}
