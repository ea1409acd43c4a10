//! SELECT plan builder.
//!
//! Translates one [`Statement`] into a task graph rooted at a single
//! [`Sequential`]. Sources are resolved through a [`SourceRegistry`]; each
//! resolved handle either plans itself (delegation) or is scanned by the
//! engine, and multi-source statements are folded left to right into
//! parallel fan-ins followed by merge joins.

use std::mem;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::PlannerConfig;
use crate::error::{QuarryError, Result};
use crate::exec::{
    self, explain, plan_hash, runnable, ExplainNode, FilterStage, JoinKeyStage, MergeJoinStage,
    Parallel, ProjectionStage, QueryResult, ScanStage, Sequential, SourceJoinStage, TaskRunner,
};
use crate::source::{SourceHandle, SourceRegistry};
use crate::statement::{
    ColumnIndex, Expr, SelectColumn, SourceRef, Statement, StatementShape, WhereClause,
};

/// Pipeline planned for one FROM entry.
#[derive(Clone, Debug)]
pub struct PlannedSource {
    /// Source as planned: rewritten, indexed and flagged as needed.
    pub source: SourceRef,
    /// Runnable pipeline producing the source's rows.
    pub task: Arc<dyn TaskRunner>,
}

/// Built plan plus its explain tree and hash.
#[derive(Clone, Debug)]
pub struct SelectPlan {
    /// Root container.
    pub root: Arc<dyn TaskRunner>,
    /// Explain tree of `root`.
    pub explain: ExplainNode,
    /// Deterministic hash of `explain`.
    pub plan_hash: u64,
}

impl SelectPlan {
    /// Runs the plan.
    pub fn execute(&self) -> Result<QueryResult> {
        exec::execute(self.root.as_ref())
    }
}

/// Stage accumulator for one container.
#[derive(Default)]
pub struct Tasks {
    stages: Vec<Arc<dyn TaskRunner>>,
    projected: bool,
}

impl Tasks {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn add(&mut self, stage: Arc<dyn TaskRunner>) {
        self.stages.push(stage);
    }

    /// Appends stages in order.
    pub fn extend(&mut self, stages: impl IntoIterator<Item = Arc<dyn TaskRunner>>) {
        self.stages.extend(stages);
    }

    /// Appends the projection stage; a second call is ignored with a warning.
    pub fn add_projection(&mut self, columns: &[SelectColumn]) -> bool {
        if self.projected {
            warn!(columns = columns.len(), "plan.projection.duplicate");
            return false;
        }
        self.projected = true;
        self.stages
            .push(Arc::new(ProjectionStage::new(columns.to_vec())));
        true
    }

    /// Stages added so far.
    pub fn stages(&self) -> &[Arc<dyn TaskRunner>] {
        &self.stages
    }

    /// Wraps the stages in a named container.
    pub fn into_sequential(self, name: &str) -> Sequential {
        Sequential::from_runners(name, self.stages)
    }
}

/// Builds task graphs for SELECT statements.
pub struct PlanBuilder {
    config: PlannerConfig,
    registry: Arc<dyn SourceRegistry>,
}

impl PlanBuilder {
    /// Creates a builder resolving sources through `registry`.
    pub fn new(config: PlannerConfig, registry: Arc<dyn SourceRegistry>) -> Self {
        Self { config, registry }
    }

    /// Active configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Builds the plan for `stmt` together with its explain tree and hash.
    pub fn plan(&self, stmt: &Statement) -> Result<SelectPlan> {
        let root: Arc<dyn TaskRunner> = Arc::new(self.visit_select(stmt)?);
        let explain = explain(root.as_ref());
        let plan_hash = plan_hash(&explain);
        debug!(plan_hash, stages = explain.inputs.len(), "plan.select.built");
        Ok(SelectPlan {
            root,
            explain,
            plan_hash,
        })
    }

    /// Plans a whole statement into `Sequential("select")`.
    pub fn visit_select(&self, stmt: &Statement) -> Result<Sequential> {
        debug!(
            sources = stmt.from.len(),
            system = stmt.is_system_query(),
            "plan.select.start"
        );
        let mut tasks = Tasks::new();
        match stmt.shape() {
            StatementShape::NoSource if stmt.is_system_query() => {
                return self.visit_select_system_info(stmt);
            }
            StatementShape::NoSource => {
                warn!(statement = %stmt, "plan.select.missing_from");
                return Err(QuarryError::MissingFrom {
                    statement: stmt.to_string(),
                });
            }
            StatementShape::SingleSource(from) => {
                let planned = self.visit_sub_select(from)?;
                tasks.add(planned.task);
            }
            StatementShape::MultiSource(sources) => {
                self.fold_sources(stmt, sources, &mut tasks)?;
            }
        }
        if let Some(filter) = self.final_where(stmt)? {
            tasks.add(filter);
        }
        tasks.add_projection(&stmt.columns);
        Ok(tasks.into_sequential("select"))
    }

    /// Plans one FROM entry.
    ///
    /// A source that can plan itself is delegated to entirely and its task is
    /// returned as is. Otherwise the source must be scannable and gets a scan
    /// pipeline: a join-aware scan plus join-key stage for derived join
    /// participants, a plain scan otherwise. In between come the derived
    /// query's own WHERE, its select list when it reshapes columns, and the
    /// predicates pushed down from the parent.
    pub fn visit_sub_select(&self, from: &SourceRef) -> Result<PlannedSource> {
        let handle = self.registry.resolve(from.source_name())?;

        if let Some(planner) = handle.planner() {
            debug!(source = %from.name, "plan.sub_select.delegate");
            let planned = planner
                .builder()
                .and_then(|builder| builder.plan_sub_select(from))
                .map_err(|err| {
                    error!(source = %from.name, %err, "plan.sub_select.delegate_failed");
                    err
                })?;
            let Some(task) = planned else {
                warn!(source = %from.name, "plan.sub_select.empty_delegate");
                return Err(QuarryError::EmptyDelegatePlan {
                    source_name: from.name.clone(),
                });
            };
            return Ok(PlannedSource {
                source: from.clone(),
                task: runnable(task)?,
            });
        }

        let Some(scanner) = handle.scanner() else {
            return Err(QuarryError::MissingScanner {
                source_name: from.name.clone(),
            });
        };

        let join_aware = from.is_join_participant() && from.sub_statement.is_some();
        let source = self.build_col_index(from, &handle, join_aware)?;
        debug!(
            source = %source.name,
            join_aware,
            seekable = source.seekable,
            indexed = source.col_index.as_ref().map_or(0, ColumnIndex::len),
            "plan.sub_select.scan"
        );

        let mut tasks = Tasks::new();
        if join_aware {
            tasks.add(Arc::new(SourceJoinStage::new(
                source.clone(),
                Arc::clone(scanner),
            )?));
        } else {
            tasks.add(Arc::new(ScanStage::new(source.clone(), Arc::clone(scanner))));
        }
        if let Some(sub) = source.sub_statement.as_deref() {
            if let Some(filter) = source_where(sub, &source)? {
                tasks.add(filter);
            }
            if !sub.is_plain_projection() {
                tasks.add(Arc::new(ProjectionStage::derived(&source, sub)));
            }
        }
        if let Some(pushed) = Expr::conjunction(source.pushed.iter().cloned()) {
            tasks.add(Arc::new(FilterStage::per_source(&source, &pushed)));
        }
        if join_aware {
            tasks.add(Arc::new(JoinKeyStage::new(&source)?));
        }

        let task = runnable(Arc::new(tasks.into_sequential("sub-select")))?;
        Ok(PlannedSource { source, task })
    }

    /// Plans a statement without a table source into
    /// `Sequential("select-schemainfo")` over the configured pseudo-source.
    pub fn visit_select_system_info(&self, stmt: &Statement) -> Result<Sequential> {
        let pseudo = stmt
            .from
            .first()
            .cloned()
            .unwrap_or_else(|| SourceRef::new(self.config.system_source.clone()));
        debug!(source = %pseudo.name, "plan.select.system_info");
        let planned = self.visit_sub_select(&pseudo)?;

        let mut tasks = Tasks::new();
        tasks.add(planned.task);
        if let Some(filter) = self.final_where(stmt)? {
            tasks.add(filter);
        }
        tasks.add_projection(&stmt.columns);
        Ok(tasks.into_sequential("select-schemainfo"))
    }

    /// Attaches a column index built from the handle's schema.
    ///
    /// Sources without a sub-statement are returned unchanged. A missing
    /// schema is only an error when `required`; otherwise the scan falls back
    /// to the stream header.
    pub fn build_col_index(
        &self,
        from: &SourceRef,
        handle: &SourceHandle,
        required: bool,
    ) -> Result<SourceRef> {
        if from.sub_statement.is_none() {
            return Ok(from.clone());
        }
        let Some(schema) = handle.schema() else {
            if required {
                return Err(QuarryError::MissingColumnSchema {
                    source_name: from.name.clone(),
                });
            }
            debug!(source = %from.name, "plan.col_index.no_schema");
            return Ok(from.clone());
        };
        let index = ColumnIndex::build(from, &schema.columns())?;
        Ok(from.clone().with_col_index(index))
    }

    fn fold_sources(
        &self,
        stmt: &Statement,
        sources: &[SourceRef],
        tasks: &mut Tasks,
    ) -> Result<()> {
        let mut pending: Vec<Arc<dyn TaskRunner>> = Vec::new();
        let mut folded: Vec<SourceRef> = Vec::with_capacity(sources.len());

        for (i, from) in sources.iter().enumerate() {
            let prepared = from.rewrite(stmt).into_seekable();
            let PlannedSource { source, task } = self.visit_sub_select(&prepared)?;
            if i == 0 {
                pending.push(task);
                folded.push(source);
                continue;
            }

            let left: Arc<dyn TaskRunner> = match mem::take(&mut pending) {
                mut stages if stages.len() == 1 => stages.remove(0),
                stages => Arc::new(Sequential::from_runners("join-fold", stages)),
            };
            let [parallel, join] = self.plan_join(left, task, &folded, &source)?;
            debug!(
                left = folded.len(),
                right = %source.qualifier(),
                "plan.select.fold"
            );
            folded.push(source);
            pending = vec![parallel, join];
        }

        tasks.extend(pending);
        Ok(())
    }

    /// Pairs two pipelines in a `Parallel` and builds the merge join that
    /// consumes it.
    fn plan_join(
        &self,
        left: Arc<dyn TaskRunner>,
        right: Arc<dyn TaskRunner>,
        left_from: &[SourceRef],
        right_from: &SourceRef,
    ) -> Result<[Arc<dyn TaskRunner>; 2]> {
        let join: Arc<dyn TaskRunner> =
            Arc::new(MergeJoinStage::new(left_from, right_from, &self.config)?);
        let parallel: Arc<dyn TaskRunner> =
            Arc::new(Parallel::new("select-sources", &self.config, left, right));
        Ok([parallel, join])
    }

    fn final_where(&self, stmt: &Statement) -> Result<Option<Arc<dyn TaskRunner>>> {
        match &stmt.where_clause {
            None => Ok(None),
            Some(WhereClause::Expr(expr)) => {
                Ok(Some(Arc::new(FilterStage::final_filter(expr.clone()))))
            }
            Some(WhereClause::SubQuery(_)) => {
                warn!(statement = %stmt, "plan.where.unsupported");
                Err(QuarryError::UnsupportedWhere {
                    scope: "select".to_owned(),
                })
            }
        }
    }
}

fn source_where(sub: &Statement, from: &SourceRef) -> Result<Option<Arc<dyn TaskRunner>>> {
    match &sub.where_clause {
        None => Ok(None),
        Some(WhereClause::Expr(expr)) => Ok(Some(Arc::new(FilterStage::per_source(from, expr)))),
        Some(WhereClause::SubQuery(_)) => {
            warn!(source = %from.name, "plan.where.unsupported");
            Err(QuarryError::UnsupportedWhere {
                scope: from.qualifier().to_owned(),
            })
        }
    }
}
