//! Shape definitions.
//!
//! A shape is the server-side filter a collection mirrors: one table, an
//! optional `WHERE` clause with positional parameters, and an optional
//! column projection.
//!
//! ```yaml
//! table: todos
//! where: "list_id = $1 AND archived = $2"
//! params: ["42", "false"]
//! columns: [id, title, completed]
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which rows of which table a collection mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDefinition {
    /// Source table, optionally schema-qualified (`public.todos`).
    pub table: String,

    /// Row predicate. Parameters are referenced as `$1`, `$2`, ...
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,

    /// Positional parameter values for the predicate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,

    /// Column projection. `None` selects all columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

impl ShapeDefinition {
    /// Shape over a whole table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            params: Vec::new(),
            columns: None,
        }
    }

    /// Add a predicate.
    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Append a positional parameter.
    pub fn with_param(mut self, value: impl Into<String>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Restrict the synced columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Stable identifier for logs, metrics, and cursor bookkeeping.
    ///
    /// Two definitions with the same table, predicate, params and columns
    /// produce the same id.
    pub fn shape_id(&self) -> String {
        let mut id = self.table.clone();
        if let Some(w) = &self.where_clause {
            id.push_str("?where=");
            id.push_str(w);
            for (i, p) in self.params.iter().enumerate() {
                id.push_str(&format!("&${}={}", i + 1, p));
            }
        }
        if let Some(cols) = &self.columns {
            id.push_str(if self.where_clause.is_some() { "&" } else { "?" });
            id.push_str("columns=");
            id.push_str(&cols.join(","));
        }
        id
    }

    /// Check the definition is usable.
    ///
    /// Every `$n` placeholder in the predicate must have a parameter, and
    /// parameters are only allowed alongside a predicate.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(SyncError::Config("shape table must not be empty".into()));
        }
        if let Some(cols) = &self.columns {
            if cols.is_empty() {
                return Err(SyncError::Config(format!(
                    "shape {}: column list must not be empty",
                    self.table
                )));
            }
            if cols.iter().any(|c| c.trim().is_empty()) {
                return Err(SyncError::Config(format!(
                    "shape {}: column names must not be empty",
                    self.table
                )));
            }
        }
        match &self.where_clause {
            None if !self.params.is_empty() => Err(SyncError::Config(format!(
                "shape {}: params given without a where clause",
                self.table
            ))),
            None => Ok(()),
            Some(clause) => {
                let highest = highest_placeholder(clause);
                if highest > self.params.len() {
                    return Err(SyncError::Config(format!(
                        "shape {}: where clause references ${} but only {} params given",
                        self.table,
                        highest,
                        self.params.len()
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ShapeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shape_id())
    }
}

/// Highest `$n` placeholder index in a predicate (0 if none).
fn highest_placeholder(clause: &str) -> usize {
    let mut highest = 0;
    let mut chars = clause.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut n = 0usize;
        let mut digits = 0;
        while let Some(&(_, d)) = chars.peek() {
            match d.to_digit(10) {
                Some(v) => {
                    n = n.saturating_mul(10).saturating_add(v as usize);
                    digits += 1;
                    chars.next();
                }
                None => break,
            }
        }
        if digits > 0 {
            highest = highest.max(n);
        }
    }
    highest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_id_is_stable() {
        let a = ShapeDefinition::table("todos")
            .with_where("list_id = $1")
            .with_param("42");
        let b = ShapeDefinition::table("todos")
            .with_where("list_id = $1")
            .with_param("42");
        assert_eq!(a.shape_id(), b.shape_id());
        assert_eq!(a.shape_id(), "todos?where=list_id = $1&$1=42");

        let c = a.clone().with_columns(["id", "title"]);
        assert_eq!(c.shape_id(), "todos?where=list_id = $1&$1=42&columns=id,title");
        assert_eq!(ShapeDefinition::table("todos").shape_id(), "todos");
        assert_eq!(
            ShapeDefinition::table("todos").with_columns(["id"]).shape_id(),
            "todos?columns=id"
        );
    }

    #[test]
    fn test_validate_placeholders() {
        let ok = ShapeDefinition::table("todos")
            .with_where("a = $1 AND b = $2")
            .with_param("x")
            .with_param("y");
        assert!(ok.validate().is_ok());

        let missing = ShapeDefinition::table("todos")
            .with_where("a = $1 AND b = $2")
            .with_param("x");
        assert!(missing.validate().is_err());

        let orphan = ShapeDefinition::table("todos").with_param("x");
        assert!(orphan.validate().is_err());

        // A bare dollar sign isn't a placeholder
        let literal = ShapeDefinition::table("prices").with_where("currency = '$'");
        assert!(literal.validate().is_ok());
    }

    #[test]
    fn test_validate_table_and_columns() {
        assert!(ShapeDefinition::table("  ").validate().is_err());
        let empty_cols = ShapeDefinition {
            columns: Some(vec![]),
            ..ShapeDefinition::table("todos")
        };
        assert!(empty_cols.validate().is_err());
        assert!(ShapeDefinition::table("todos")
            .with_columns(["id", ""])
            .validate()
            .is_err());
    }

    #[test]
    fn test_highest_placeholder() {
        assert_eq!(highest_placeholder("a = 1"), 0);
        assert_eq!(highest_placeholder("a = $3 OR b = $12"), 12);
        assert_eq!(highest_placeholder("$"), 0);
    }

    #[test]
    fn test_serde_where_rename() {
        let json = r#"{"table": "todos", "where": "done = $1", "params": ["true"]}"#;
        let shape: ShapeDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(shape.where_clause.as_deref(), Some("done = $1"));
        assert_eq!(shape.params, vec!["true"]);
        assert!(shape.columns.is_none());

        let out = serde_json::to_string(&ShapeDefinition::table("todos")).unwrap();
        assert_eq!(out, r#"{"table":"todos"}"#);
    }
}
