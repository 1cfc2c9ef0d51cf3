//! # Telemetry Module
//!
//! Shared telemetry state: the installed schema tree and the per-leaf
//! history, guarded together by one `RwLock` so a reader never sees a tree
//! and a history from different schemas.
//!
//! This module handles:
//! - Installing a freshly fetched schema (leaf values reset to 0)
//! - Applying telemetry updates and recording every leaf's value
//! - Answering history queries
//! - Writing the JSONL audit log ([`audit`])
//! - Receiving update datagrams ([`ingest`])

pub mod audit;
pub mod ingest;

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::history::HistoryStore;
use crate::schema::{Leaf, SchemaTree, UpdateReport};

pub use audit::{AuditKind, AuditLog};
pub use ingest::{IngestOutcome, Ingestor};

/// Telemetry state shared between ingestion, the uplink and queries
pub type SharedTelemetry = Arc<RwLock<Telemetry>>;

/// Schema tree plus the history of every leaf
#[derive(Debug, Default)]
pub struct Telemetry {
    tree: SchemaTree,
    history: HistoryStore,
    installed: bool,
}

impl Telemetry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            tree: SchemaTree::default(),
            history: HistoryStore::new(history_capacity),
            installed: false,
        }
    }

    pub fn shared(history_capacity: usize) -> SharedTelemetry {
        Arc::new(RwLock::new(Self::new(history_capacity)))
    }

    /// Replace the tree with `schema`, every leaf value set to 0.
    ///
    /// History is rebuilt with one empty series per leaf of the new schema,
    /// so paths the remote unit no longer reports read back as `null`.
    pub fn install_schema(&mut self, schema: SchemaTree) {
        let tree = schema.transform(|leaf, _| Leaf {
            value: json!(0),
            ..leaf.clone()
        });
        self.history.reset(tree.leaf_paths());
        self.tree = tree;
        self.installed = true;
    }

    /// True once a schema has been installed, even an empty one.
    pub fn has_schema(&self) -> bool {
        self.installed
    }

    /// Merge `update` into the tree, then append the current value of every
    /// leaf to its history.
    pub fn apply_update(&mut self, update: &Value) -> UpdateReport {
        let report = self.tree.apply_update(update);
        for (path, leaf) in self.tree.leaves() {
            self.history.append(&path, leaf.value.clone());
        }
        report
    }

    /// The last `last_n` values of each requested path, oldest first.
    ///
    /// Each series is exactly `last_n` long; unknown paths are all `null`.
    pub fn query<I, S>(&self, ids: I, last_n: usize) -> IndexMap<String, Vec<Value>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .map(|id| {
                let id = id.as_ref();
                (id.to_string(), self.history.last_n(id, last_n))
            })
            .collect()
    }

    pub fn tree(&self) -> &SchemaTree {
        &self.tree
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }
}
