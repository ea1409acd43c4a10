//! Quarry: SELECT plan builder for a pluggable SQL engine.
//!
//! A parsed [`Statement`] is turned into a runnable task graph by
//! [`PlanBuilder`]. Sources are resolved through a [`SourceRegistry`] and
//! advertise what they can do through [`SourceCapabilities`]: scan rows,
//! plan themselves, or describe their columns.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod exec;
pub mod plan;
pub mod source;
pub mod statement;
pub mod value;

pub use config::{ConfigError, PlannerConfig};
pub use error::{ErrorKind, QuarryError, Result};
pub use exec::{execute, ExplainNode, QueryResult, Row, Task, TaskKind, TaskRunner};
pub use plan::{PlanBuilder, PlannedSource, SelectPlan};
pub use source::{
    MemoryRegistry, MemoryTable, SourceCapabilities, SourceRegistry, SystemVariables,
};
pub use statement::{col, lit, var, Expr, SelectBuilder, SourceRef, Statement};
pub use value::{Value, ValueType};
