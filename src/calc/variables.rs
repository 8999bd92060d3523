//! Temporary variable table
//!
//! Lives for one calculation pass. Later statements read what earlier
//! statements assigned. Names are truncated to [`MAX_VAR_NAME_LEN`]
//! characters on both store and lookup.

use heapless::{String as HString, Vec as HVec};
use thiserror::Error;

/// Maximum number of temporary variables per pass
pub const MAX_TEMP_VARS: usize = 50;

/// Maximum variable name length in characters
pub const MAX_VAR_NAME_LEN: usize = 5;

/// Truncated variable name
pub type VarName = HString<MAX_VAR_NAME_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariableError {
    #[error("variable table full ({capacity} entries), '{name}' dropped")]
    TableFull { name: String, capacity: usize },
}

/// Truncate a name to the stored length
pub fn var_name(name: &str) -> VarName {
    let mut out = VarName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Ordered, bounded name-to-value table
#[derive(Debug, Clone, Default)]
pub struct TempVars {
    entries: HVec<(VarName, f64), MAX_TEMP_VARS>,
}

impl TempVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let key = var_name(name);
        self.entries
            .iter()
            .find(|(n, _)| *n == key)
            .map(|(_, value)| *value)
    }

    /// Insert or update a variable
    ///
    /// Existing names can always be updated; a new name is rejected once
    /// the table is full.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), VariableError> {
        let key = var_name(name);
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == key) {
            entry.1 = value;
            return Ok(());
        }

        self.entries
            .push((key, value))
            .map_err(|(key, _)| VariableError::TableFull {
                name: key.as_str().to_string(),
                capacity: MAX_TEMP_VARS,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut vars = TempVars::new();
        vars.set("flow", 3.5).unwrap();

        assert_eq!(vars.get("flow"), Some(3.5));
        assert_eq!(vars.get("level"), None);

        vars.set("flow", 4.0).unwrap();
        assert_eq!(vars.get("flow"), Some(4.0));
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn test_names_truncated() {
        let mut vars = TempVars::new();
        vars.set("temperature", 21.0).unwrap();

        assert_eq!(vars.iter().next(), Some(("tempe", 21.0)));
        assert_eq!(vars.get("tempe"), Some(21.0));
        assert_eq!(vars.get("temperature"), Some(21.0));
        assert_eq!(vars.get("tempXYZ"), None);
    }

    #[test]
    fn test_table_full_keeps_existing_updatable() {
        let mut vars = TempVars::new();
        for i in 0..MAX_TEMP_VARS {
            vars.set(&format!("v{}", i), i as f64).unwrap();
        }
        assert_eq!(vars.len(), MAX_TEMP_VARS);

        let err = vars.set("extra", 1.0).unwrap_err();
        assert!(matches!(err, VariableError::TableFull { .. }));
        assert_eq!(vars.get("extra"), None);

        vars.set("v3", 100.0).unwrap();
        assert_eq!(vars.get("v3"), Some(100.0));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut vars = TempVars::new();
        vars.set("b", 1.0).unwrap();
        vars.set("a", 2.0).unwrap();
        vars.set("b", 3.0).unwrap();

        let names: Vec<&str> = vars.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);

        vars.clear();
        assert!(vars.is_empty());
    }
}
