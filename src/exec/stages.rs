use std::sync::Arc;

use tracing::trace;

use crate::error::{QuarryError, Result};
use crate::exec::join::{eval_key, key_cmp, side_keys};
use crate::exec::{ExplainProp, Flow, RunContext, Row, Task, TaskKind, TaskRunner};
use crate::source::Scanner;
use crate::statement::{ColumnIndex, ColumnRef, Expr, SelectColumn, SourceRef, Statement};

/// Plain scan of one source.
///
/// Positional values are named through the source's column index when one
/// was built, otherwise through the stream header.
#[derive(Clone)]
pub struct ScanStage {
    source: SourceRef,
    scanner: Arc<dyn Scanner>,
}

impl ScanStage {
    /// Scans `source` with `scanner`.
    pub fn new(source: SourceRef, scanner: Arc<dyn Scanner>) -> Self {
        Self { source, scanner }
    }
}

impl std::fmt::Debug for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStage")
            .field("source", &self.source.name)
            .finish()
    }
}

impl Task for ScanStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Scan
    }

    fn name(&self) -> String {
        format!("scan({})", self.source.qualifier())
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for ScanStage {
    fn props(&self) -> Vec<ExplainProp> {
        source_props(&self.source)
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        input.expect_empty(&self.name())?;
        let index = self.source.col_index.as_ref().filter(|idx| !idx.is_empty());
        let rows = scan_rows(&self.source, self.scanner.as_ref(), index)?;
        ctx.record_scanned(rows.len());
        Ok(Flow::Rows(rows))
    }
}

/// Join-aware scan: emits only indexed columns and attaches each row's
/// merge key.
#[derive(Clone)]
pub struct SourceJoinStage {
    source: SourceRef,
    scanner: Arc<dyn Scanner>,
    index: ColumnIndex,
    keys: Vec<Expr>,
}

impl SourceJoinStage {
    /// Fails when `source` carries no column index.
    ///
    /// Keys name the source's output columns, so a source whose derived
    /// query renames columns leaves keying to the downstream join-key stage.
    pub fn new(source: SourceRef, scanner: Arc<dyn Scanner>) -> Result<Self> {
        let index = source
            .col_index
            .clone()
            .ok_or_else(|| QuarryError::MissingColumnSchema {
                source_name: source.name.clone(),
            })?;
        let keys = if source.renames_columns() {
            Vec::new()
        } else {
            side_keys(&source)
        };
        Ok(Self {
            source,
            scanner,
            index,
            keys,
        })
    }
}

impl std::fmt::Debug for SourceJoinStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceJoinStage")
            .field("source", &self.source.name)
            .field("index", &self.index)
            .field("keys", &self.keys)
            .finish()
    }
}

impl Task for SourceJoinStage {
    fn kind(&self) -> TaskKind {
        TaskKind::SourceJoin
    }

    fn name(&self) -> String {
        format!("source-join({})", self.source.qualifier())
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for SourceJoinStage {
    fn props(&self) -> Vec<ExplainProp> {
        let mut props = source_props(&self.source);
        let columns: Vec<&str> = self.index.iter().map(|(name, _)| name).collect();
        props.push(ExplainProp::plain("columns", columns.join(", ")));
        if !self.keys.is_empty() {
            props.push(ExplainProp::plain("key", list(&self.keys)));
        }
        props
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        input.expect_empty(&self.name())?;
        let mut rows = scan_rows(&self.source, self.scanner.as_ref(), Some(&self.index))?;
        if !self.keys.is_empty() {
            for row in &mut rows {
                let key = eval_key(&self.keys, row)?;
                row.set_join_key(key);
            }
        }
        ctx.record_scanned(rows.len());
        Ok(Flow::Rows(rows))
    }
}

/// Derives the merge key of every row and, for seekable sources, orders
/// rows by it.
#[derive(Clone, Debug)]
pub struct JoinKeyStage {
    qualifier: String,
    keys: Vec<Expr>,
    ordered: bool,
}

impl JoinKeyStage {
    /// Keys are the columns of `from`'s join conditions that belong to it.
    pub fn new(from: &SourceRef) -> Result<Self> {
        let keys = side_keys(from);
        if keys.is_empty() {
            let partners: Vec<String> = from
                .join_nodes
                .iter()
                .flat_map(|node| node.columns())
                .filter_map(|c| c.qualifier.clone())
                .filter(|q| q != from.qualifier())
                .collect();
            return Err(QuarryError::UnkeyableJoin {
                left: from.qualifier().to_owned(),
                right: partners.join(","),
                reason: "no column equality references this source".to_owned(),
            });
        }
        Ok(Self {
            qualifier: from.qualifier().to_owned(),
            keys,
            ordered: from.seekable,
        })
    }
}

impl Task for JoinKeyStage {
    fn kind(&self) -> TaskKind {
        TaskKind::JoinKey
    }

    fn name(&self) -> String {
        format!("join-key({})", self.qualifier)
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for JoinKeyStage {
    fn props(&self) -> Vec<ExplainProp> {
        vec![
            ExplainProp::plain("source", self.qualifier.clone()),
            ExplainProp::plain("key", list(&self.keys)),
            ExplainProp::plain("ordered", self.ordered.to_string()),
        ]
    }

    fn run(&self, _ctx: &RunContext, input: Flow) -> Result<Flow> {
        let mut rows = input.into_rows(&self.name())?;
        for row in &mut rows {
            if row.join_key().is_none() {
                let key = eval_key(&self.keys, row)?;
                row.set_join_key(key);
            }
        }
        if self.ordered {
            rows.sort_by(|a, b| key_cmp(a.join_key().unwrap_or(&[]), b.join_key().unwrap_or(&[])));
        }
        Ok(Flow::Rows(rows))
    }
}

/// WHERE predicate over a row batch; keeps rows where it is true.
#[derive(Clone, Debug)]
pub struct FilterStage {
    kind: TaskKind,
    scope: String,
    predicate: Expr,
}

impl FilterStage {
    /// Filter over one source's rows.
    ///
    /// Columns qualified with the source's registry name, or with the name
    /// its derived query gives its own FROM entry, are re-pointed at the
    /// alias, which is how scanned rows are named.
    pub fn per_source(from: &SourceRef, predicate: &Expr) -> Self {
        let predicate = to_alias(from, predicate);
        Self {
            kind: TaskKind::WhereFilter,
            scope: from.qualifier().to_owned(),
            predicate,
        }
    }

    /// Filter over fully joined rows.
    pub fn final_filter(predicate: Expr) -> Self {
        Self {
            kind: TaskKind::WhereFinal,
            scope: "select".to_owned(),
            predicate,
        }
    }

    /// Filter expression.
    pub fn predicate(&self) -> &Expr {
        &self.predicate
    }
}

impl Task for FilterStage {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn name(&self) -> String {
        format!("where({})", self.scope)
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for FilterStage {
    fn props(&self) -> Vec<ExplainProp> {
        vec![
            ExplainProp::plain("scope", self.scope.clone()),
            ExplainProp::literal("predicate", self.predicate.to_string()),
        ]
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        let rows = input.into_rows(&self.name())?;
        let before = rows.len();
        let mut kept = Vec::with_capacity(before);
        for row in rows {
            if self.predicate.eval(&row)?.is_true() {
                kept.push(row);
            }
        }
        ctx.record_filtered(before - kept.len());
        trace!(scope = %self.scope, before, after = kept.len(), "exec.filter.applied");
        Ok(Flow::Rows(kept))
    }
}

/// Shapes rows into a select list.
///
/// The statement's own projection is terminal and emits bare output names.
/// A derived source's projection keeps its rows qualified with the alias so
/// joins and pushed predicates still see `alias.column`.
#[derive(Clone, Debug)]
pub struct ProjectionStage {
    columns: Vec<SelectColumn>,
    scope: Option<String>,
}

impl ProjectionStage {
    /// Projects `columns` in order.
    pub fn new(columns: Vec<SelectColumn>) -> Self {
        Self {
            columns,
            scope: None,
        }
    }

    /// Projects a derived source's rows into its query's select list.
    pub fn derived(from: &SourceRef, query: &Statement) -> Self {
        let columns = query
            .columns
            .iter()
            .map(|column| match column {
                SelectColumn::Wildcard => SelectColumn::Wildcard,
                SelectColumn::Expr { expr, .. } => SelectColumn::Expr {
                    expr: to_alias(from, expr),
                    alias: Some(column.output_name()),
                },
            })
            .collect();
        Self {
            columns,
            scope: Some(from.qualifier().to_owned()),
        }
    }

    /// Output columns.
    pub fn columns(&self) -> &[SelectColumn] {
        &self.columns
    }

    fn project(&self, row: &Row) -> Result<Row> {
        let mut out = Row::with_capacity(self.columns.len());
        for column in &self.columns {
            match (column, &self.scope) {
                (SelectColumn::Wildcard, None) => expand_wildcard(row, &mut out),
                (SelectColumn::Wildcard, Some(_)) => {
                    for (name, value) in row.columns() {
                        out.push(name, value.clone());
                    }
                }
                (SelectColumn::Expr { expr, .. }, None) => {
                    out.push(column.output_name(), expr.eval(row)?)
                }
                (SelectColumn::Expr { expr, .. }, Some(scope)) => {
                    out.push(format!("{scope}.{}", column.output_name()), expr.eval(row)?)
                }
            }
        }
        Ok(out)
    }
}

impl Task for ProjectionStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Projection
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for ProjectionStage {
    fn props(&self) -> Vec<ExplainProp> {
        let columns: Vec<String> = self.columns.iter().map(ToString::to_string).collect();
        let mut props = Vec::with_capacity(2);
        if let Some(scope) = &self.scope {
            props.push(ExplainProp::plain("scope", scope.clone()));
        }
        let literal = self.columns.iter().any(|column| match column {
            SelectColumn::Expr { expr, .. } => expr.has_literal(),
            SelectColumn::Wildcard => false,
        });
        props.push(if literal {
            ExplainProp::literal("columns", columns.join(", "))
        } else {
            ExplainProp::plain("columns", columns.join(", "))
        });
        props
    }

    fn run(&self, _ctx: &RunContext, input: Flow) -> Result<Flow> {
        let rows = input.into_rows("projection")?;
        rows.iter()
            .map(|row| self.project(row))
            .collect::<Result<Vec<_>>>()
            .map(Flow::Rows)
    }
}

/// `*` keeps bare column names unless two sources share one.
fn expand_wildcard(row: &Row, out: &mut Row) {
    let short = |name: &str| -> String {
        name.split_once('.')
            .map_or(name, |(_, n)| n)
            .to_owned()
    };
    let shorts: Vec<String> = row.names().map(short).collect();
    for ((name, value), bare) in row.columns().zip(&shorts) {
        let clashes = shorts.iter().filter(|s| *s == bare).count() > 1;
        let output = if clashes { name.to_owned() } else { bare.clone() };
        out.push(output, value.clone());
    }
}

fn scan_rows(
    source: &SourceRef,
    scanner: &dyn Scanner,
    index: Option<&ColumnIndex>,
) -> Result<Vec<Row>> {
    let mut stream = scanner.open()?;
    let qualifier = source.qualifier();
    let layout: Vec<(String, usize)> = match index {
        Some(index) => index
            .iter()
            .map(|(name, pos)| (format!("{qualifier}.{name}"), pos))
            .collect(),
        None => stream
            .columns()
            .iter()
            .enumerate()
            .map(|(pos, name)| (format!("{qualifier}.{name}"), pos))
            .collect(),
    };
    let mut rows = Vec::new();
    while let Some(values) = stream.try_next()? {
        let mut row = Row::with_capacity(layout.len());
        for (name, pos) in &layout {
            let value = values.get(*pos).cloned().ok_or_else(|| {
                QuarryError::scan(
                    source.name.clone(),
                    format!("row has no value at position {pos} for '{name}'"),
                )
            })?;
            row.push(name.clone(), value);
        }
        rows.push(row);
    }
    trace!(source = %source.name, rows = rows.len(), "exec.scan.finished");
    Ok(rows)
}

fn to_alias(source: &SourceRef, expr: &Expr) -> Expr {
    let alias = source.qualifier();
    let inner = source
        .sub_statement
        .as_deref()
        .and_then(|sub| sub.from.first())
        .map(SourceRef::qualifier);
    let mut out = expr.clone();
    for name in [Some(source.name.as_str()), inner].into_iter().flatten() {
        if name != alias {
            out = requalify(&out, name, alias);
        }
    }
    out
}

fn requalify(expr: &Expr, from: &str, to: &str) -> Expr {
    let again = |inner: &Expr| Box::new(requalify(inner, from, to));
    match expr {
        Expr::Column(c) if c.qualifier.as_deref() == Some(from) => {
            Expr::Column(ColumnRef::qualified(to, c.name.clone()))
        }
        Expr::Column(_) | Expr::Variable(_) | Expr::Literal(_) => expr.clone(),
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: again(left),
            right: again(right),
        },
        Expr::Not(inner) => Expr::Not(again(inner)),
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: again(expr),
            negated: *negated,
        },
        Expr::Cast { expr, to: ty } => Expr::Cast {
            expr: again(expr),
            to: *ty,
        },
    }
}

fn source_props(source: &SourceRef) -> Vec<ExplainProp> {
    let mut props = vec![ExplainProp::plain("source", source.name.clone())];
    if let Some(alias) = &source.alias {
        props.push(ExplainProp::plain("as", alias.clone()));
    }
    if source.seekable {
        props.push(ExplainProp::plain("seekable", "true"));
    }
    props
}

fn list(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
