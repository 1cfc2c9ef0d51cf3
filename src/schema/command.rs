//! # Operator Commands
//!
//! Turns the flat `path -> value` commands operators submit into the nested
//! form the remote unit expects.

use serde_json::{json, Map, Value};

use super::node::ROOT;
use crate::error::{GatewayError, Result};

/// Operator command accepted by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set leaf values, keyed by dot path
    Set(Map<String, Value>),
    /// Reboot the remote unit
    Reboot,
}

impl Command {
    /// Audit payload, shaped the way the operator submitted it.
    pub fn audit_payload(&self) -> Value {
        match self {
            Command::Set(flat) => json!({ "cmd": flat }),
            Command::Reboot => json!({ "reboot": null }),
        }
    }
}

/// Rebuild the nested tree described by a flat `path -> value` map.
///
/// A leading `slate` segment is stripped from every path. The result is the
/// inverse of [`SchemaTree::flatten`](super::SchemaTree::flatten) for paths.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidCommand`] for empty path segments and for
/// paths that would place a value and a namespace at the same node.
///
/// # Examples
///
/// ```
/// use serde_json::{json, Map, Value};
/// use slate_gateway::schema::build_command;
///
/// let mut flat = Map::new();
/// flat.insert("slate.engine.valve".to_string(), json!(1));
/// assert_eq!(build_command(&flat)?, json!({"engine": {"valve": 1}}));
/// # Ok::<(), slate_gateway::error::GatewayError>(())
/// ```
pub fn build_command(flat: &Map<String, Value>) -> Result<Value> {
    let mut root = Map::new();

    for (path, value) in flat {
        let mut segments: Vec<&str> = path.split('.').collect();
        if segments.first() == Some(&ROOT) {
            segments.remove(0);
        }
        if segments.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
            return Err(GatewayError::InvalidCommand(format!("malformed path '{}'", path)));
        }

        let conflict = || GatewayError::InvalidCommand(format!("path '{}' conflicts with another path", path));
        let (last, parents) = segments.split_last().ok_or_else(conflict)?;

        let mut node = &mut root;
        for segment in parents {
            node = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or_else(conflict)?;
        }

        if node.get(*last).is_some_and(Value::is_object) {
            return Err(conflict());
        }
        node.insert(last.to_string(), value.clone());
    }

    Ok(Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Leaf, SchemaTree};

    fn flat(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_build_nested_command() {
        let command = build_command(&flat(&[
            ("slate.engine.ox.valve", json!(1)),
            ("slate.engine.fuel.valve", json!(0)),
            ("slate.mode", json!("arm")),
        ]))
        .unwrap();

        assert_eq!(
            command,
            json!({"engine": {"ox": {"valve": 1}, "fuel": {"valve": 0}}, "mode": "arm"})
        );
    }

    #[test]
    fn test_paths_without_root_are_accepted() {
        let command = build_command(&flat(&[("engine.valve", json!(true))])).unwrap();
        assert_eq!(command, json!({"engine": {"valve": true}}));
    }

    #[test]
    fn test_malformed_paths_are_rejected() {
        for path in ["slate", "", "slate..valve", "slate.engine."] {
            let result = build_command(&flat(&[(path, json!(1))]));
            assert!(matches!(result, Err(GatewayError::InvalidCommand(_))), "{:?} accepted", path);
        }
    }

    #[test]
    fn test_conflicting_paths_are_rejected() {
        let result = build_command(&flat(&[("slate.engine", json!(1)), ("slate.engine.valve", json!(0))]));
        assert!(matches!(result, Err(GatewayError::InvalidCommand(_))));

        let result = build_command(&flat(&[("slate.engine.valve", json!(0)), ("slate.engine", json!(1))]));
        assert!(matches!(result, Err(GatewayError::InvalidCommand(_))));
    }

    #[test]
    fn test_flatten_then_build_round_trips() {
        let tree = SchemaTree::from_json(&json!({
            "alpha": {"desc": "a"},
            "engine": {"ox": {"pressure": {"desc": "p"}, "valve": {"desc": "v"}}, "igniter": {"desc": "i"}},
            "gps": {"lat": {"desc": "lat"}, "lon": {"desc": "lon"}}
        }))
        .unwrap();
        let mut counter = 0;
        let tree = tree.transform(|leaf, _| {
            counter += 1;
            Leaf { value: json!(counter), ..leaf.clone() }
        });

        let flat: Map<String, Value> = tree.flatten(|leaf, path| (path.to_string(), leaf.value.clone())).collect();
        assert_eq!(build_command(&flat).unwrap(), tree.values());
    }

    #[test]
    fn test_audit_payload() {
        assert_eq!(Command::Reboot.audit_payload(), json!({"reboot": null}));
        let set = Command::Set(flat(&[("slate.mode", json!(2))]));
        assert_eq!(set.audit_payload(), json!({"cmd": {"slate.mode": 2}}));
    }
}
