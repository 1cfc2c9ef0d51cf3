//! # Schema Module
//!
//! The telemetry schema tree and the algorithms over it.
//!
//! This module handles:
//! - Decoding the schema fetched from the remote unit
//! - Path lookup, flattening and rebuilding of the tree
//! - Merging partial telemetry updates into leaf values
//! - Building nested commands from flat operator input

pub mod command;
pub mod node;
pub mod tree;

pub use command::{build_command, Command};
pub use node::{Leaf, SchemaNode, ROOT};
pub use tree::{SchemaTree, UpdateReport};
