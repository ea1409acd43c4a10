//! Task graph primitives and the minimal runtime that runs them.
//!
//! Every plan node implements [`Task`]. Nodes that can actually run also
//! implement [`TaskRunner`]; containers only accept runners, so a stub task
//! is rejected the moment it is composed into a graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::config::PlannerConfig;
use crate::error::{QuarryError, Result};
use crate::statement::ColumnRef;
use crate::value::Value;

/// Explain trees and plan hashing.
pub mod explain;
/// Merge join stage.
pub mod join;
/// Source, filter, key and projection stages.
pub mod stages;

pub use explain::{explain, plan_hash, ExplainNode, ExplainProp};
pub use join::MergeJoinStage;
pub use stages::{FilterStage, JoinKeyStage, ProjectionStage, ScanStage, SourceJoinStage};

/// One row flowing between stages.
///
/// Columns keep their insertion order and are named `alias.column` until the
/// projection renames them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
    join_key: Option<Vec<Value>>,
}

impl Row {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty row with room for `capacity` columns.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
            join_key: None,
        }
    }

    /// Appends a column.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Looks up a column reference.
    ///
    /// Qualified references match `qualifier.name` exactly. Unqualified ones
    /// match a bare `name` or any `alias.name`, and fail when more than one
    /// column qualifies.
    pub fn get(&self, column: &ColumnRef) -> Result<&Value> {
        if let Some(qualifier) = &column.qualifier {
            return self
                .columns
                .iter()
                .find(|(key, _)| {
                    key.split_once('.')
                        .is_some_and(|(q, n)| q == qualifier && n == column.name)
                })
                .map(|(_, value)| value)
                .ok_or_else(|| QuarryError::UnresolvedColumn {
                    column: column.to_string(),
                });
        }
        let mut matches = self.columns.iter().filter(|(key, _)| {
            key == &column.name
                || key
                    .split_once('.')
                    .is_some_and(|(_, n)| n == column.name)
        });
        match (matches.next(), matches.next()) {
            (Some((_, value)), None) => Ok(value),
            (Some(_), Some(_)) => Err(QuarryError::AmbiguousColumn {
                column: column.name.clone(),
            }),
            (None, _) => Err(QuarryError::UnresolvedColumn {
                column: column.name.clone(),
            }),
        }
    }

    /// Columns in order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(k, _)| k.as_str())
    }

    /// Values in order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, v)| v)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True for a row without columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Attached merge key.
    pub fn join_key(&self) -> Option<&[Value]> {
        self.join_key.as_deref()
    }

    /// Attaches a merge key.
    pub fn set_join_key(&mut self, key: Vec<Value>) {
        self.join_key = Some(key);
    }

    /// Detaches the merge key.
    pub fn clear_join_key(&mut self) {
        self.join_key = None;
    }

    /// Concatenates two rows; the result carries no join key.
    pub fn concat(left: &Row, right: &Row) -> Row {
        let mut out = Row::with_capacity(left.len() + right.len());
        out.columns.extend(left.columns.iter().cloned());
        out.columns.extend(right.columns.iter().cloned());
        out
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Data handed from one stage to the next.
#[derive(Clone, Debug, PartialEq)]
pub enum Flow {
    /// No input; source stages start from here.
    Empty,
    /// Row batch.
    Rows(Vec<Row>),
    /// Output of a parallel stage, consumed by a join.
    Pair {
        /// Left branch rows.
        left: Vec<Row>,
        /// Right branch rows.
        right: Vec<Row>,
    },
}

impl Flow {
    /// Unwraps a row batch.
    pub fn into_rows(self, stage: &str) -> Result<Vec<Row>> {
        match self {
            Flow::Rows(rows) => Ok(rows),
            _ => Err(QuarryError::UnexpectedFlow {
                stage: stage.to_owned(),
                expected: "row",
            }),
        }
    }

    /// Unwraps a parallel pair.
    pub fn into_pair(self, stage: &str) -> Result<(Vec<Row>, Vec<Row>)> {
        match self {
            Flow::Pair { left, right } => Ok((left, right)),
            _ => Err(QuarryError::UnexpectedFlow {
                stage: stage.to_owned(),
                expected: "paired",
            }),
        }
    }

    /// Checks that a source stage received no input.
    pub fn expect_empty(&self, stage: &str) -> Result<()> {
        match self {
            Flow::Empty => Ok(()),
            _ => Err(QuarryError::UnexpectedFlow {
                stage: stage.to_owned(),
                expected: "empty",
            }),
        }
    }
}

/// Stage classification used by explain output and graph assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Ordered container.
    Sequential,
    /// Two-way concurrent container.
    Parallel,
    /// Plain source scan.
    Scan,
    /// Join-aware source scan.
    SourceJoin,
    /// Join key extraction.
    JoinKey,
    /// Naive merge join.
    MergeJoin,
    /// Per-source WHERE.
    WhereFilter,
    /// Final WHERE over joined rows.
    WhereFinal,
    /// Terminal projection.
    Projection,
    /// Stage supplied by a delegating source.
    Custom(&'static str),
}

impl TaskKind {
    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sequential => "Sequential",
            TaskKind::Parallel => "Parallel",
            TaskKind::Scan => "Scan",
            TaskKind::SourceJoin => "SourceJoin",
            TaskKind::JoinKey => "JoinKey",
            TaskKind::MergeJoin => "MergeJoin",
            TaskKind::WhereFilter => "WhereFilter",
            TaskKind::WhereFinal => "WhereFinal",
            TaskKind::Projection => "Projection",
            TaskKind::Custom(name) => *name,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schedulable plan node.
pub trait Task: fmt::Debug + Send + Sync {
    /// Stage classification.
    fn kind(&self) -> TaskKind;

    /// Diagnostic name.
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Narrows the task to its runnable form; `None` for plannable stubs.
    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>>;
}

/// Plan node that can be run.
pub trait TaskRunner: Task {
    /// Nested stages, for containers.
    fn children(&self) -> &[Arc<dyn TaskRunner>] {
        &[]
    }

    /// Properties rendered by explain.
    fn props(&self) -> Vec<ExplainProp> {
        Vec::new()
    }

    /// Consumes `input` and produces this stage's output.
    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow>;
}

/// Narrows `task` to a runner or fails with `NotRunnable`.
pub fn runnable(task: Arc<dyn Task>) -> Result<Arc<dyn TaskRunner>> {
    let name = task.name();
    task.into_runner()
        .ok_or(QuarryError::NotRunnable { task: name })
}

/// Ordered composition.
#[derive(Debug)]
pub struct Sequential {
    name: String,
    tasks: Vec<Arc<dyn TaskRunner>>,
}

impl Sequential {
    /// Builds the container, rejecting any task that is not runnable.
    pub fn new(name: impl Into<String>, tasks: Vec<Arc<dyn Task>>) -> Result<Self> {
        let tasks = tasks
            .into_iter()
            .map(runnable)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            tasks,
        })
    }

    /// Builds the container from tasks already known to be runnable.
    pub fn from_runners(name: impl Into<String>, tasks: Vec<Arc<dyn TaskRunner>>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    /// Container name.
    pub fn label(&self) -> &str {
        &self.name
    }

    /// Stages in order.
    pub fn tasks(&self) -> &[Arc<dyn TaskRunner>] {
        &self.tasks
    }
}

impl Task for Sequential {
    fn kind(&self) -> TaskKind {
        TaskKind::Sequential
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for Sequential {
    fn children(&self) -> &[Arc<dyn TaskRunner>] {
        &self.tasks
    }

    fn props(&self) -> Vec<ExplainProp> {
        vec![ExplainProp::plain("name", self.name.clone())]
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        let mut flow = input;
        for task in &self.tasks {
            flow = task.run(ctx, flow)?;
        }
        Ok(flow)
    }
}

/// Two producers run side by side; emits [`Flow::Pair`].
#[derive(Debug)]
pub struct Parallel {
    name: String,
    concurrent: bool,
    sides: Vec<Arc<dyn TaskRunner>>,
}

impl Parallel {
    /// Builds the container over exactly two producers.
    pub fn new(
        name: impl Into<String>,
        config: &PlannerConfig,
        left: Arc<dyn TaskRunner>,
        right: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            concurrent: config.concurrent_sources,
            sides: vec![left, right],
        }
    }

    fn run_concurrently(
        &self,
        ctx: &RunContext,
        left: &Arc<dyn TaskRunner>,
        right: &Arc<dyn TaskRunner>,
    ) -> Result<(Flow, Flow)> {
        thread::scope(|scope| {
            let l = scope.spawn(|| left.run(ctx, Flow::Empty));
            let r = scope.spawn(|| right.run(ctx, Flow::Empty));
            let panicked = || QuarryError::WorkerPanicked {
                stage: self.name.clone(),
            };
            let l = l.join().map_err(|_| panicked())?;
            let r = r.join().map_err(|_| panicked())?;
            Ok((l?, r?))
        })
    }
}

impl Task for Parallel {
    fn kind(&self) -> TaskKind {
        TaskKind::Parallel
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for Parallel {
    fn children(&self) -> &[Arc<dyn TaskRunner>] {
        &self.sides
    }

    fn props(&self) -> Vec<ExplainProp> {
        vec![
            ExplainProp::plain("name", self.name.clone()),
            ExplainProp::plain("concurrent", self.concurrent.to_string()),
        ]
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        input.expect_empty(&self.name)?;
        let [left, right] = self.sides.as_slice() else {
            return Err(QuarryError::UnexpectedFlow {
                stage: self.name.clone(),
                expected: "two-sided",
            });
        };
        let (l, r) = if self.concurrent {
            self.run_concurrently(ctx, left, right)?
        } else {
            (left.run(ctx, Flow::Empty)?, right.run(ctx, Flow::Empty)?)
        };
        debug!(stage = %self.name, concurrent = self.concurrent, "exec.parallel.joined");
        Ok(Flow::Pair {
            left: l.into_rows(&self.name)?,
            right: r.into_rows(&self.name)?,
        })
    }
}

/// Counters collected while a plan runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecStats {
    /// Rows read from sources.
    pub rows_scanned: u64,
    /// Rows emitted by merge joins.
    pub rows_joined: u64,
    /// Rows dropped by filters.
    pub rows_filtered: u64,
}

/// Shared state for one plan run.
#[derive(Debug, Default)]
pub struct RunContext {
    rows_scanned: AtomicU64,
    rows_joined: AtomicU64,
    rows_filtered: AtomicU64,
}

impl RunContext {
    /// Fresh context with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_scanned(&self, rows: usize) {
        self.rows_scanned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_joined(&self, rows: usize) {
        self.rows_joined.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self, rows: usize) {
        self.rows_filtered.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> ExecStats {
        ExecStats {
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            rows_joined: self.rows_joined.load(Ordering::Relaxed),
            rows_filtered: self.rows_filtered.load(Ordering::Relaxed),
        }
    }
}

/// Rows and counters produced by [`execute`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct QueryResult {
    /// Projected rows.
    pub rows: Vec<Row>,
    /// Execution counters.
    pub stats: ExecStats,
}

/// Runs a built plan to completion.
pub fn execute(root: &dyn TaskRunner) -> Result<QueryResult> {
    let ctx = RunContext::new();
    let rows = root.run(&ctx, Flow::Empty)?.into_rows(&root.name())?;
    let stats = ctx.snapshot();
    debug!(
        rows = rows.len(),
        scanned = stats.rows_scanned,
        joined = stats.rows_joined,
        filtered = stats.rows_filtered,
        "exec.select.finished"
    );
    Ok(QueryResult { rows, stats })
}
