//! # History Module
//!
//! Bounded per-leaf time series of recent telemetry values.
//!
//! Every leaf path owns a FIFO of at most `capacity` values. Appends evict
//! the oldest value once the FIFO is full, so memory per path stays bounded.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Default number of values retained per leaf
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Per-path bounded history of leaf values
#[derive(Debug, Clone)]
pub struct HistoryStore {
    entries: HashMap<String, VecDeque<Value>>,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Replace every entry with one empty sequence per path.
    pub fn reset<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.entries = paths.into_iter().map(|path| (path, VecDeque::new())).collect();
    }

    /// Push `value` onto the end of `path`'s history, evicting from the front.
    pub fn append(&mut self, path: &str, value: Value) {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.push_back(value);
                while entry.len() > self.capacity {
                    entry.pop_front();
                }
            }
            None => {
                self.entries.insert(path.to_string(), VecDeque::from([value]));
            }
        }
    }

    /// The `n` most recent values of `path`, oldest first.
    ///
    /// Always returns exactly `n` values: missing history (including unknown
    /// paths) is padded on the left with `null`.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::{json, Value};
    /// use slate_gateway::history::HistoryStore;
    ///
    /// let mut history = HistoryStore::new(10);
    /// history.append("slate.alpha", json!(1));
    /// assert_eq!(history.last_n("slate.alpha", 3), vec![Value::Null, Value::Null, json!(1)]);
    /// ```
    pub fn last_n(&self, path: &str, n: usize) -> Vec<Value> {
        let recorded = self.entries.get(path);
        let available = recorded.map_or(0, VecDeque::len).min(n);

        let mut values = Vec::with_capacity(n);
        values.resize(n - available, Value::Null);
        if let Some(entry) = recorded {
            values.extend(entry.iter().skip(entry.len() - available).cloned());
        }
        values
    }

    pub fn len(&self, path: &str) -> usize {
        self.entries.get(path).map_or(0, VecDeque::len)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
