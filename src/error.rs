#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Broad classification of a [`QuarryError`].
///
/// Planning failures are always fatal to the whole build; none of them are
/// retried by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Statement shape cannot be planned.
    PlanningInput,
    /// Named source is absent or lacks a mandatory capability.
    SourceResolution,
    /// A delegating source planner failed its own sub-build.
    Delegation,
    /// A produced task broke the runnable contract.
    InternalConsistency,
    /// A stage failed while running a built plan.
    Execution,
    /// Configuration could not be loaded.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PlanningInput => "planning-input",
            ErrorKind::SourceResolution => "source-resolution",
            ErrorKind::Delegation => "delegation",
            ErrorKind::InternalConsistency => "internal-consistency",
            ErrorKind::Execution => "execution",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Structured errors emitted while building or running a select plan.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Statement has no FROM clause and is not a system query.
    #[error("no FROM clause for {statement}")]
    MissingFrom { statement: String },
    /// WHERE clause shape is not supported (e.g. a sub-query predicate).
    #[error("unsupported WHERE clause in {scope}")]
    UnsupportedWhere { scope: String },
    /// A delegating source planner produced an empty plan.
    #[error("source planner for '{source_name}' produced no task")]
    EmptyDelegatePlan { source_name: String },
    /// Derived source references a column its schema does not expose.
    #[error("unknown column '{column}' for source '{source_name}'")]
    UnknownColumn { source_name: String, column: String },
    /// Statement could not be assembled by the builder.
    #[error("invalid statement: {reason}")]
    InvalidStatement { reason: &'static str },
    /// Join condition cannot be expressed as an ordered key comparison.
    #[error("cannot key join between '{left}' and '{right}': {reason}")]
    UnkeyableJoin {
        left: String,
        right: String,
        reason: String,
    },
    /// Source name is not registered.
    #[error("could not find source for '{source_name}'")]
    SourceNotFound { source_name: String },
    /// Source offers neither a planner nor a scanner.
    #[error("source '{source_name}' must implement Scanner")]
    MissingScanner { source_name: String },
    /// Source cannot describe its columns but column indexing is required.
    #[error("source '{source_name}' must implement ColumnSchema to build a column index")]
    MissingColumnSchema { source_name: String },
    /// Failure reported by a delegating source planner.
    #[error("source planner for '{source_name}' failed: {reason}")]
    Delegate { source_name: String, reason: String },
    /// A task handed to a graph is not runnable.
    #[error("task '{task}' does not implement TaskRunner")]
    NotRunnable { task: String },
    /// Column reference did not match any column of the row.
    #[error("column '{column}' not found in row")]
    UnresolvedColumn { column: String },
    /// Unqualified column reference matched more than one column.
    #[error("column reference '{column}' is ambiguous")]
    AmbiguousColumn { column: String },
    /// Operator applied to incompatible values.
    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    /// Value could not be cast to the requested type.
    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: &'static str, to: &'static str },
    /// Stage received a flow shape it cannot consume.
    #[error("stage '{stage}' expected {expected} input")]
    UnexpectedFlow {
        stage: String,
        expected: &'static str,
    },
    /// Merge join produced more rows than the configured limit.
    #[error("join output exceeds {limit} rows")]
    JoinRowLimit { limit: usize },
    /// Row source failed while streaming.
    #[error("scan of '{source_name}' failed: {reason}")]
    Scan { source_name: String, reason: String },
    /// A parallel branch panicked.
    #[error("parallel stage '{stage}' lost a worker")]
    WorkerPanicked { stage: String },
    /// Planner configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QuarryError {
    /// Builds the error a delegating planner reports for its own failures.
    pub fn delegate(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        QuarryError::Delegate {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`QuarryError::Scan`] for a failing row stream.
    pub fn scan(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        QuarryError::Scan {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuarryError::MissingFrom { .. }
            | QuarryError::UnsupportedWhere { .. }
            | QuarryError::EmptyDelegatePlan { .. }
            | QuarryError::UnknownColumn { .. }
            | QuarryError::InvalidStatement { .. }
            | QuarryError::UnkeyableJoin { .. } => ErrorKind::PlanningInput,
            QuarryError::SourceNotFound { .. }
            | QuarryError::MissingScanner { .. }
            | QuarryError::MissingColumnSchema { .. } => ErrorKind::SourceResolution,
            QuarryError::Delegate { .. } => ErrorKind::Delegation,
            QuarryError::NotRunnable { .. } => ErrorKind::InternalConsistency,
            QuarryError::UnresolvedColumn { .. }
            | QuarryError::AmbiguousColumn { .. }
            | QuarryError::TypeMismatch { .. }
            | QuarryError::InvalidCast { .. }
            | QuarryError::UnexpectedFlow { .. }
            | QuarryError::JoinRowLimit { .. }
            | QuarryError::Scan { .. }
            | QuarryError::WorkerPanicked { .. } => ErrorKind::Execution,
            QuarryError::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QuarryError::MissingFrom { .. } => "MissingFrom",
            QuarryError::UnsupportedWhere { .. } => "UnsupportedWhere",
            QuarryError::EmptyDelegatePlan { .. } => "EmptyDelegatePlan",
            QuarryError::UnknownColumn { .. } => "UnknownColumn",
            QuarryError::InvalidStatement { .. } => "InvalidStatement",
            QuarryError::UnkeyableJoin { .. } => "UnkeyableJoin",
            QuarryError::SourceNotFound { .. } => "SourceNotFound",
            QuarryError::MissingScanner { .. } => "MissingScanner",
            QuarryError::MissingColumnSchema { .. } => "MissingColumnSchema",
            QuarryError::Delegate { .. } => "Delegate",
            QuarryError::NotRunnable { .. } => "NotRunnable",
            QuarryError::UnresolvedColumn { .. } => "UnresolvedColumn",
            QuarryError::AmbiguousColumn { .. } => "AmbiguousColumn",
            QuarryError::TypeMismatch { .. } => "TypeMismatch",
            QuarryError::InvalidCast { .. } => "InvalidCast",
            QuarryError::UnexpectedFlow { .. } => "UnexpectedFlow",
            QuarryError::JoinRowLimit { .. } => "JoinRowLimit",
            QuarryError::Scan { .. } => "ScanFailed",
            QuarryError::WorkerPanicked { .. } => "WorkerPanicked",
            QuarryError::Config(_) => "Config",
        }
    }
}

/// Convenience wrapper that formats errors with their codes.
pub struct ErrorWithCode<'a>(pub &'a QuarryError);

impl fmt::Display for ErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
