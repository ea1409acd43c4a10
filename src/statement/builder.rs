//! Fluent SELECT statement builder.

use crate::error::{QuarryError, Result};
use crate::statement::{
    expr::{col, Expr},
    SelectColumn, SourceRef, Statement, WhereClause,
};

/// Fluent builder for [`Statement`] values.
///
/// Misuse is recorded and reported by [`SelectBuilder::build`] so call chains
/// stay linear.
#[derive(Default)]
pub struct SelectBuilder {
    stmt: Statement,
    error: Option<QuarryError>,
}

impl SelectBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an output expression.
    pub fn column(mut self, expr: Expr) -> Self {
        self.stmt
            .columns
            .push(SelectColumn::Expr { expr, alias: None });
        self
    }

    /// Adds an output expression renamed to `alias`.
    pub fn column_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        if alias.trim().is_empty() {
            self.fail("projection alias cannot be empty");
            return self;
        }
        self.stmt.columns.push(SelectColumn::Expr {
            expr,
            alias: Some(alias),
        });
        self
    }

    /// Adds column references parsed from `alias.column` strings.
    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self = self.column(col(name.as_ref()));
        }
        self
    }

    /// Adds `*`.
    pub fn wildcard(mut self) -> Self {
        self.stmt.columns.push(SelectColumn::Wildcard);
        self
    }

    /// Adds the first FROM source.
    pub fn from(self, name: impl Into<String>) -> Self {
        self.from_source(SourceRef::new(name))
    }

    /// Adds the first FROM source under an alias.
    pub fn from_as(self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.from_source(SourceRef::new(name).with_alias(alias))
    }

    /// Adds a derived source `(query) AS alias`; the source resolves to the
    /// query's own first FROM entry.
    pub fn from_derived(mut self, query: Statement, alias: impl Into<String>) -> Self {
        let Some(inner) = query.from.first() else {
            self.fail("derived source requires a FROM clause");
            return self;
        };
        let mut source = SourceRef::new(inner.name.clone()).with_alias(alias);
        source.sub_statement = Some(Box::new(query));
        self.from_source(source)
    }

    /// Adds a pre-built source.
    pub fn from_source(mut self, source: SourceRef) -> Self {
        if !self.stmt.from.is_empty() {
            self.fail("additional sources must be added with join()");
            return self;
        }
        self.stmt.from.push(source);
        self
    }

    /// Joins another source with an `ON` condition.
    pub fn join(self, name: impl Into<String>, on: Expr) -> Self {
        self.join_source(SourceRef::new(name), on)
    }

    /// Joins another source under an alias.
    pub fn join_as(self, name: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        self.join_source(SourceRef::new(name).with_alias(alias), on)
    }

    /// Joins a pre-built (possibly derived) source.
    pub fn join_source(mut self, mut source: SourceRef, on: Expr) -> Self {
        if self.stmt.from.is_empty() {
            self.fail("join requires an existing FROM source");
            return self;
        }
        source.on = on.conjuncts().into_iter().cloned().collect();
        self.stmt.from.push(source);
        self
    }

    /// Adds a WHERE predicate, AND-ed with any existing one.
    pub fn filter(mut self, predicate: Expr) -> Self {
        let combined = match self.stmt.where_clause.take() {
            None => predicate,
            Some(WhereClause::Expr(existing)) => existing.and(predicate),
            Some(sub @ WhereClause::SubQuery(_)) => {
                self.stmt.where_clause = Some(sub);
                self.fail("cannot combine a predicate with a sub-query WHERE");
                return self;
            }
        };
        self.stmt.where_clause = Some(WhereClause::Expr(combined));
        self
    }

    /// Sets a sub-query WHERE clause.
    pub fn where_subquery(mut self, query: Statement) -> Self {
        if self.stmt.where_clause.is_some() {
            self.fail("WHERE clause already set");
            return self;
        }
        self.stmt.where_clause = Some(WhereClause::SubQuery(Box::new(query)));
        self
    }

    /// Flags the statement as a system/introspection query.
    pub fn system(mut self) -> Self {
        self.stmt.system_query = true;
        self
    }

    /// Finishes the statement.
    pub fn build(self) -> Result<Statement> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.stmt.columns.is_empty() {
            return Err(QuarryError::InvalidStatement {
                reason: "statement requires at least one output column",
            });
        }
        Ok(self.stmt)
    }

    fn fail(&mut self, reason: &'static str) {
        if self.error.is_none() {
            self.error = Some(QuarryError::InvalidStatement { reason });
        }
    }
}
