//! Parsed SELECT statement model consumed by the plan builder.
//!
//! Statements arrive fully parsed (or assembled with [`SelectBuilder`]); the
//! planner only reads them. Per-source state the planner derives, such as the
//! column index or the seekable flag, lives on copies of [`SourceRef`]
//! returned from planning calls.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::source::ColumnDesc;

/// Fluent statement builder.
pub mod builder;
/// Expression tree and evaluation.
pub mod expr;

pub use builder::SelectBuilder;
pub use expr::{col, lit, var, BinaryOp, ColumnRef, Expr};

/// One parsed SELECT query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Output column list.
    pub columns: Vec<SelectColumn>,
    /// FROM sources in written order.
    #[serde(default)]
    pub from: Vec<SourceRef>,
    /// Optional WHERE clause.
    #[serde(default, rename = "where")]
    pub where_clause: Option<WhereClause>,
    /// Set by the parser for introspection queries (`SELECT @@var`).
    #[serde(default)]
    pub system_query: bool,
}

/// Statement shape, decided once before planning.
#[derive(Clone, Copy, Debug)]
pub enum StatementShape<'a> {
    /// No FROM clause.
    NoSource,
    /// Exactly one source.
    SingleSource(&'a SourceRef),
    /// Two or more sources folded into joins.
    MultiSource(&'a [SourceRef]),
}

impl Statement {
    /// Classifies the FROM clause.
    pub fn shape(&self) -> StatementShape<'_> {
        match self.from.as_slice() {
            [] => StatementShape::NoSource,
            [single] => StatementShape::SingleSource(single),
            many => StatementShape::MultiSource(many),
        }
    }

    /// True for introspection queries that have no real table source.
    pub fn is_system_query(&self) -> bool {
        self.system_query
    }

    /// Direct WHERE predicate, if the clause is an expression.
    pub fn where_expr(&self) -> Option<&Expr> {
        match &self.where_clause {
            Some(WhereClause::Expr(expr)) => Some(expr),
            _ => None,
        }
    }

    fn has_wildcard(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c, SelectColumn::Wildcard))
    }

    /// True when every output column is `*` or a bare column keeping its
    /// own name, so rows need no reshaping to match the select list.
    pub fn is_plain_projection(&self) -> bool {
        self.columns.iter().all(|column| match column {
            SelectColumn::Wildcard => true,
            SelectColumn::Expr {
                expr: Expr::Column(c),
                alias,
            } => alias.as_deref().map_or(true, |a| a == c.name),
            SelectColumn::Expr { .. } => false,
        })
    }
}

/// Output column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectColumn {
    /// `*`
    Wildcard,
    /// Expression with optional `AS` alias.
    Expr {
        /// Projected expression.
        expr: Expr,
        /// Output name override.
        #[serde(default)]
        alias: Option<String>,
    },
}

impl SelectColumn {
    /// Name the column carries in result rows.
    pub fn output_name(&self) -> String {
        match self {
            SelectColumn::Wildcard => "*".to_owned(),
            SelectColumn::Expr {
                alias: Some(alias), ..
            } => alias.clone(),
            SelectColumn::Expr { expr, .. } => match expr {
                Expr::Column(col) => col.name.clone(),
                other => other.to_string(),
            },
        }
    }
}

impl fmt::Display for SelectColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectColumn::Wildcard => f.write_str("*"),
            SelectColumn::Expr {
                expr,
                alias: Some(alias),
            } => write!(f, "{expr} AS {alias}"),
            SelectColumn::Expr { expr, alias: None } => write!(f, "{expr}"),
        }
    }
}

/// WHERE clause shapes produced by the parser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhereClause {
    /// Direct boolean expression.
    Expr(Expr),
    /// Correlated or nested sub-query predicate.
    SubQuery(Box<Statement>),
}

/// One FROM-clause entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Registry name of the source.
    pub name: String,
    /// `AS` alias.
    #[serde(default)]
    pub alias: Option<String>,
    /// Embedded query when the source is derived.
    #[serde(default)]
    pub sub_statement: Option<Box<Statement>>,
    /// Terms of this source's `JOIN ... ON` condition.
    #[serde(default)]
    pub on: Vec<Expr>,
    /// Join conditions of the parent statement linking this source to
    /// another one.
    #[serde(default)]
    pub join_nodes: Vec<Expr>,
    /// Parent predicates (WHERE or ON terms) that only reference this
    /// source; applied to its output rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pushed: Vec<Expr>,
    /// Pipeline must expose key-ordered access (merge-join input).
    #[serde(default)]
    pub seekable: bool,
    /// Column name to source position map.
    #[serde(skip)]
    pub col_index: Option<ColumnIndex>,
}

impl SourceRef {
    /// Plain table reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            sub_statement: None,
            on: Vec::new(),
            join_nodes: Vec::new(),
            pushed: Vec::new(),
            seekable: false,
            col_index: None,
        }
    }

    /// Sets the `AS` alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Registry name used for resolution.
    pub fn source_name(&self) -> &str {
        &self.name
    }

    /// Name columns of this source are qualified with.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether the source takes part in a join.
    pub fn is_join_participant(&self) -> bool {
        !self.join_nodes.is_empty()
    }

    /// Returns a copy flagged for key-ordered access.
    pub fn into_seekable(mut self) -> Self {
        self.seekable = true;
        self
    }

    /// Returns a copy carrying `index`.
    pub fn with_col_index(mut self, index: ColumnIndex) -> Self {
        self.col_index = Some(index);
        self
    }

    /// Whether rows scanned from the source must be reshaped into its
    /// derived query's select list (aliases or computed columns).
    pub fn renames_columns(&self) -> bool {
        self.sub_statement
            .as_deref()
            .is_some_and(|sub| !sub.is_plain_projection())
    }

    /// Propagates the parent's join context into this source.
    ///
    /// ON terms linking this source to another become its join nodes. ON
    /// terms and parent WHERE conjuncts that only reference this source are
    /// pushed down. A plain table gets a generated sub-statement selecting
    /// the columns the parent needs from it; a derived source keeps its own
    /// query, whose select list is all the parent can see.
    pub fn rewrite(&self, parent: &Statement) -> SourceRef {
        let qualifier = self.qualifier().to_owned();
        let (local, linking): (Vec<&Expr>, Vec<&Expr>) = parent
            .from
            .iter()
            .flat_map(|from| from.on.iter())
            .flat_map(|on| on.conjuncts())
            .filter(|term| term.references(&qualifier))
            .partition(|term| term.only_references(&qualifier));
        let join_nodes: Vec<Expr> = linking.into_iter().cloned().collect();
        let mut pushed: Vec<Expr> = local.into_iter().cloned().collect();
        if let Some(parent_where) = parent.where_expr() {
            pushed.extend(
                parent_where
                    .conjuncts()
                    .into_iter()
                    .filter(|term| term.only_references(&qualifier))
                    .cloned(),
            );
        }

        let sub = match &self.sub_statement {
            Some(existing) => existing.as_ref().clone(),
            None => {
                let mut sub = Statement {
                    from: vec![SourceRef::new(self.name.clone())],
                    ..Statement::default()
                };
                if parent.has_wildcard() {
                    sub.columns.push(SelectColumn::Wildcard);
                } else {
                    let mut wanted: Vec<ColumnRef> = Vec::new();
                    let mut note = |c: &ColumnRef| {
                        if c.may_belong_to(&qualifier) && !wanted.contains(c) {
                            wanted.push(c.clone());
                        }
                    };
                    for column in &parent.columns {
                        if let SelectColumn::Expr { expr, .. } = column {
                            expr.walk_columns(&mut note);
                        }
                    }
                    for term in join_nodes.iter().chain(&pushed) {
                        term.walk_columns(&mut note);
                    }
                    if let Some(expr) = parent.where_expr() {
                        expr.walk_columns(&mut note);
                    }
                    sub.columns = wanted
                        .into_iter()
                        .map(|c| SelectColumn::Expr {
                            expr: Expr::Column(c),
                            alias: None,
                        })
                        .collect();
                }
                sub
            }
        };

        SourceRef {
            sub_statement: Some(Box::new(sub)),
            join_nodes,
            pushed,
            ..self.clone()
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_statement {
            Some(sub) => write!(f, "({sub})")?,
            None => f.write_str(&self.name)?,
        }
        if let Some(alias) = &self.alias {
            write!(f, " AS {alias}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{column}")?;
        }
        for (i, from) in self.from.iter().enumerate() {
            if i == 0 {
                write!(f, " FROM {from}")?;
            } else {
                write!(f, " JOIN {from}")?;
            }
            if let Some(on) = Expr::conjunction(from.on.iter().cloned()) {
                write!(f, " ON {on}")?;
            }
        }
        match &self.where_clause {
            Some(WhereClause::Expr(expr)) => write!(f, " WHERE {expr}"),
            Some(WhereClause::SubQuery(sub)) => write!(f, " WHERE ({sub})"),
            None => Ok(()),
        }
    }
}

/// Name to position map used to interpret positional source rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    entries: Vec<(String, usize)>,
}

impl ColumnIndex {
    /// Indexes the columns `source`'s sub-statement reads against `schema`.
    ///
    /// Only the sub-statement's select list and WHERE are walked: they name
    /// the underlying columns, while join nodes and pushed predicates name
    /// the source's output. Unqualified names missing from the schema are
    /// skipped since they may belong to a sibling source; qualified ones are
    /// an error.
    pub fn build(source: &SourceRef, schema: &[ColumnDesc]) -> Result<ColumnIndex> {
        let mut index = ColumnIndex::default();
        let Some(sub) = source.sub_statement.as_deref() else {
            return Ok(index);
        };
        if sub.has_wildcard() {
            for (pos, desc) in schema.iter().enumerate() {
                index.insert(&desc.name, pos);
            }
        }

        let qualifier = source.qualifier();
        let inner = sub.from.first().map(SourceRef::qualifier);
        let mut refs: Vec<&ColumnRef> = Vec::new();
        for column in &sub.columns {
            if let SelectColumn::Expr { expr, .. } = column {
                expr.walk_columns(&mut |c| refs.push(c));
            }
        }
        if let Some(expr) = sub.where_expr() {
            expr.walk_columns(&mut |c| refs.push(c));
        }

        for c in refs {
            let owned = match c.qualifier.as_deref() {
                None => true,
                Some(q) => q == qualifier || q == source.name || Some(q) == inner,
            };
            if !owned {
                continue;
            }
            match schema.iter().position(|desc| desc.name == c.name) {
                Some(pos) => index.insert(&c.name, pos),
                None if c.qualifier.is_some() => {
                    return Err(QuarryError::UnknownColumn {
                        source_name: source.name.clone(),
                        column: c.to_string(),
                    })
                }
                None => {}
            }
        }
        Ok(index)
    }

    fn insert(&mut self, name: &str, pos: usize) {
        if !self.entries.iter().any(|(n, _)| n == name) {
            self.entries.push((name.to_owned(), pos));
        }
    }

    /// Position of `name` in the source row.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pos)| *pos)
    }

    /// Indexed columns in the order they were first referenced.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(n, pos)| (n.as_str(), *pos))
    }

    /// Number of indexed columns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no column is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
