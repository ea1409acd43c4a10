//! Data-source contracts consumed by the plan builder.
//!
//! A resolved [`SourceHandle`] carries an explicit [`SourceCapabilities`]
//! value. The planner reads the capability slots directly; it never inspects a
//! source by downcasting.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::exec::Task;
use crate::statement::SourceRef;
use crate::value::{Value, ValueType};

/// In-memory sources and registry.
pub mod memory;

pub use memory::{MemoryRegistry, MemoryTable, SystemVariables};

/// Column descriptor reported by a [`ColumnSchema`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    /// Column name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: ValueType,
}

impl ColumnDesc {
    /// Creates a descriptor.
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Forward-only stream of positional rows.
pub trait RowStream: Send {
    /// Header naming each position of the emitted rows.
    fn columns(&self) -> &[String];
    /// Next row, or `None` once exhausted.
    fn try_next(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Capability to produce rows.
pub trait Scanner: Send + Sync {
    /// Opens a new stream positioned before the first row.
    fn open(&self) -> Result<Box<dyn RowStream>>;
}

/// Capability to describe the source's columns.
pub trait ColumnSchema: Send + Sync {
    /// Columns in positional order.
    fn columns(&self) -> Vec<ColumnDesc>;
}

/// Planner a delegating source hands back for one planning pass.
pub trait SubPlanner {
    /// Plans `from` entirely; the returned task must be runnable.
    ///
    /// `Ok(None)` means the planner produced nothing, which the plan builder
    /// rejects with `EmptyDelegatePlan`.
    fn plan_sub_select(&self, from: &SourceRef) -> Result<Option<Arc<dyn Task>>>;
}

/// Capability to build a source's own sub-plan.
pub trait SourcePlanner: Send + Sync {
    /// Creates the planner used for one FROM entry.
    fn builder(&self) -> Result<Box<dyn SubPlanner>>;
}

/// Capability set attached to a resolved source.
#[derive(Clone, Default)]
pub struct SourceCapabilities {
    /// Row production.
    pub scanner: Option<Arc<dyn Scanner>>,
    /// Planning delegation.
    pub planner: Option<Arc<dyn SourcePlanner>>,
    /// Column description.
    pub schema: Option<Arc<dyn ColumnSchema>>,
}

impl SourceCapabilities {
    /// Empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the scanner capability.
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Adds the planner capability.
    pub fn with_planner(mut self, planner: Arc<dyn SourcePlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Adds the column schema capability.
    pub fn with_schema(mut self, schema: Arc<dyn ColumnSchema>) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl fmt::Debug for SourceCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCapabilities")
            .field("scanner", &self.scanner.is_some())
            .field("planner", &self.planner.is_some())
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// Resolved source borrowed by the planner for one FROM entry.
#[derive(Clone, Debug)]
pub struct SourceHandle {
    name: String,
    caps: SourceCapabilities,
}

impl SourceHandle {
    /// Creates a handle named `name` with `caps`.
    pub fn new(name: impl Into<String>, caps: SourceCapabilities) -> Self {
        Self {
            name: name.into(),
            caps,
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability set.
    pub fn capabilities(&self) -> &SourceCapabilities {
        &self.caps
    }

    /// Scanner slot.
    pub fn scanner(&self) -> Option<&Arc<dyn Scanner>> {
        self.caps.scanner.as_ref()
    }

    /// Planner slot.
    pub fn planner(&self) -> Option<&Arc<dyn SourcePlanner>> {
        self.caps.planner.as_ref()
    }

    /// Schema slot.
    pub fn schema(&self) -> Option<&Arc<dyn ColumnSchema>> {
        self.caps.schema.as_ref()
    }
}

/// Name to source resolution.
pub trait SourceRegistry: Send + Sync {
    /// Resolves `name`; unknown names fail with `SourceNotFound`.
    fn resolve(&self, name: &str) -> Result<SourceHandle>;
}
