use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::source::{
    ColumnDesc, ColumnSchema, RowStream, Scanner, SourceCapabilities, SourceHandle,
    SourceRegistry,
};
use crate::value::{Value, ValueType};

/// Registry backed by a case-insensitive in-memory map.
#[derive(Default)]
pub struct MemoryRegistry {
    sources: RwLock<HashMap<String, SourceHandle>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `caps` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, caps: SourceCapabilities) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        self.sources.write().insert(key, SourceHandle::new(name, caps));
    }

    /// Registers a table under `name`.
    pub fn register_table(&self, name: impl Into<String>, table: MemoryTable) {
        self.register(name, table.into_capabilities());
    }

    /// Builder form of [`MemoryRegistry::register`].
    pub fn with_source(self, name: impl Into<String>, caps: SourceCapabilities) -> Self {
        self.register(name, caps);
        self
    }

    /// Builder form of [`MemoryRegistry::register_table`].
    pub fn with_table(self, name: impl Into<String>, table: MemoryTable) -> Self {
        self.register_table(name, table);
        self
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .read()
            .values()
            .map(|handle| handle.name().to_owned())
            .collect();
        names.sort();
        names
    }
}

impl SourceRegistry for MemoryRegistry {
    fn resolve(&self, name: &str) -> Result<SourceHandle> {
        self.sources
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| QuarryError::SourceNotFound {
                source_name: name.to_owned(),
            })
    }
}

/// Row-oriented table held in memory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryTable {
    /// Column layout.
    pub columns: Vec<ColumnDesc>,
    /// Rows in insertion order, positional against `columns`.
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    /// Creates an empty table with `columns`.
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates an empty table whose columns are all `ty`.
    pub fn with_columns<I, S>(names: I, ty: ValueType) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|n| ColumnDesc::new(n, ty)).collect())
    }

    /// Appends a row.
    pub fn row<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rows.push(values.into_iter().map(Into::into).collect());
        self
    }

    /// Wraps the table as a scanner with a column schema.
    pub fn into_capabilities(self) -> SourceCapabilities {
        let table = Arc::new(self);
        SourceCapabilities::new()
            .with_scanner(table.clone())
            .with_schema(table)
    }
}

impl Scanner for MemoryTable {
    fn open(&self) -> Result<Box<dyn RowStream>> {
        Ok(Box::new(VecStream::new(
            self.columns.iter().map(|c| c.name.clone()).collect(),
            self.rows.clone(),
        )))
    }
}

impl ColumnSchema for MemoryTable {
    fn columns(&self) -> Vec<ColumnDesc> {
        self.columns.clone()
    }
}

/// Session variables exposed as a single row of `@@name` columns.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemVariables {
    vars: BTreeMap<String, Value>,
}

impl Default for SystemVariables {
    fn default() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("max_allowed_packet".to_owned(), Value::Int(4_194_304));
        vars.insert("autocommit".to_owned(), Value::Int(1));
        vars.insert("version".to_owned(), Value::from(env!("CARGO_PKG_VERSION")));
        vars.insert("version_comment".to_owned(), Value::from("quarry"));
        Self { vars }
    }
}

impl SystemVariables {
    /// Default variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` (with or without the `@@` prefix).
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        let name = name.trim_start_matches("@@").to_ascii_lowercase();
        self.vars.insert(name, value.into());
        self
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars
            .get(&name.trim_start_matches("@@").to_ascii_lowercase())
    }

    /// Wraps the variables as a scanner with a column schema.
    pub fn into_capabilities(self) -> SourceCapabilities {
        let vars = Arc::new(self);
        SourceCapabilities::new()
            .with_scanner(vars.clone())
            .with_schema(vars)
    }
}

impl Scanner for SystemVariables {
    fn open(&self) -> Result<Box<dyn RowStream>> {
        let header = self.vars.keys().map(|k| format!("@@{k}")).collect();
        let row = self.vars.values().cloned().collect();
        Ok(Box::new(VecStream::new(header, vec![row])))
    }
}

impl ColumnSchema for SystemVariables {
    fn columns(&self) -> Vec<ColumnDesc> {
        self.vars
            .iter()
            .map(|(name, value)| {
                let ty = match value {
                    Value::Bool(_) => ValueType::Bool,
                    Value::Int(_) => ValueType::Int,
                    Value::Float(_) => ValueType::Float,
                    Value::Null | Value::String(_) => ValueType::String,
                };
                ColumnDesc::new(format!("@@{name}"), ty)
            })
            .collect()
    }
}

struct VecStream {
    header: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl VecStream {
    fn new(header: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            header,
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecStream {
    fn columns(&self) -> &[String] {
        &self.header
    }

    fn try_next(&mut self) -> Result<Option<Vec<Value>>> {
        match self.rows.next() {
            Some(row) if row.len() != self.header.len() => Err(QuarryError::scan(
                "memory",
                format!(
                    "row has {} values for {} columns",
                    row.len(),
                    self.header.len()
                ),
            )),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_case_insensitively() {
        let registry = MemoryRegistry::new().with_table(
            "Users",
            MemoryTable::with_columns(["id"], ValueType::Int).row([1]),
        );
        let handle = registry.resolve("users").expect("resolve");
        assert_eq!(handle.name(), "Users");
        assert!(handle.scanner().is_some());
        assert!(handle.schema().is_some());
        assert!(handle.planner().is_none());

        let err = registry.resolve("orders").expect_err("missing");
        assert_eq!(err.code(), "SourceNotFound");
    }

    #[test]
    fn table_stream_yields_rows_in_order() {
        let table = MemoryTable::with_columns(["a", "b"], ValueType::Int)
            .row([1, 2])
            .row([3, 4]);
        let mut stream = table.open().expect("open");
        assert_eq!(stream.columns(), ["a", "b"]);
        assert_eq!(
            stream.try_next().expect("row"),
            Some(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            stream.try_next().expect("row"),
            Some(vec![Value::Int(3), Value::Int(4)])
        );
        assert_eq!(stream.try_next().expect("end"), None);
    }

    #[test]
    fn ragged_row_fails_the_scan() {
        let mut table = MemoryTable::with_columns(["a", "b"], ValueType::Int);
        table.rows.push(vec![Value::Int(1)]);
        let mut stream = table.open().expect("open");
        let err = stream.try_next().expect_err("ragged");
        assert_eq!(err.code(), "ScanFailed");
    }

    #[test]
    fn system_variables_expose_prefixed_columns() {
        let vars = SystemVariables::new().set("@@sql_mode", "ANSI");
        assert_eq!(vars.get("max_allowed_packet"), Some(&Value::Int(4_194_304)));
        let names: Vec<String> = ColumnSchema::columns(&vars)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(names.contains(&"@@sql_mode".to_owned()));
        let mut stream = vars.open().expect("open");
        let row = stream.try_next().expect("row").expect("single row");
        assert_eq!(row.len(), names.len());
        assert_eq!(stream.try_next().expect("end"), None);
    }
}
