use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::PlannerConfig;
use crate::error::{QuarryError, Result};
use crate::exec::{ExplainProp, Flow, RunContext, Row, Task, TaskKind, TaskRunner};
use crate::statement::{ColumnRef, Expr, SourceRef};
use crate::value::Value;

/// Naive merge join over the two sides of a parallel stage.
///
/// Both inputs are ordered by key, equal-key groups are paired up, and each
/// pair is emitted as the concatenation of the left and right row. Only
/// conjunctions of `left.col = right.col` are keyable.
#[derive(Clone, Debug)]
pub struct MergeJoinStage {
    left_label: String,
    right_label: String,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    left_keyed: bool,
    right_keyed: bool,
    null_keys_match: bool,
    max_rows: Option<usize>,
}

impl MergeJoinStage {
    /// Joins the rows of every source folded so far (`left`) with `right`
    /// using `right`'s ON condition.
    pub fn new(left: &[SourceRef], right: &SourceRef, config: &PlannerConfig) -> Result<Self> {
        let qualifiers: Vec<&str> = left.iter().map(SourceRef::qualifier).collect();
        let left_label = qualifiers.join(",");
        let right_label = right.qualifier().to_owned();
        let unkeyable = |reason: String| QuarryError::UnkeyableJoin {
            left: left_label.clone(),
            right: right_label.clone(),
            reason,
        };

        if left.is_empty() {
            return Err(unkeyable("no left input".to_owned()));
        }
        if let Some(plain) = left.iter().chain([right]).find(|s| !s.seekable) {
            return Err(unkeyable(format!("'{}' is not seekable", plain.qualifier())));
        }
        if right.on.is_empty() {
            return Err(unkeyable("join has no ON condition".to_owned()));
        }

        let on_left = |c: &ColumnRef| {
            c.qualifier
                .as_deref()
                .is_some_and(|q| qualifiers.contains(&q))
        };
        let on_right = |c: &ColumnRef| c.qualifier.as_deref() == Some(right.qualifier());

        let mut left_keys = Vec::with_capacity(right.on.len());
        let mut right_keys = Vec::with_capacity(right.on.len());
        let single_source = |term: &Expr| {
            left.iter()
                .chain([right])
                .any(|s| term.only_references(s.qualifier()))
        };
        for term in &right.on {
            // filtered inside that source's pipeline
            if single_source(term) {
                continue;
            }
            let pair = term.as_column_equality().and_then(|(a, b)| {
                if on_left(a) && on_right(b) {
                    Some((a, b))
                } else if on_right(a) && on_left(b) {
                    Some((b, a))
                } else {
                    None
                }
            });
            let Some((l, r)) = pair else {
                return Err(unkeyable(format!(
                    "'{term}' is not an equality between both sides"
                )));
            };
            left_keys.push(Expr::Column(l.clone()));
            right_keys.push(Expr::Column(r.clone()));
        }

        if left_keys.is_empty() {
            return Err(unkeyable(
                "no column equality between both sides".to_owned(),
            ));
        }
        let left_keyed = left.len() == 1 && side_keys(&left[0]) == left_keys;
        let right_keyed = side_keys(right) == right_keys;
        Ok(Self {
            left_label,
            right_label,
            left_keys,
            right_keys,
            left_keyed,
            right_keyed,
            null_keys_match: config.null_keys_match,
            max_rows: config.max_join_rows,
        })
    }

    /// Whether the left rows' attached keys are reused.
    pub fn reuses_left_keys(&self) -> bool {
        self.left_keyed
    }

    /// Whether the right rows' attached keys are reused.
    pub fn reuses_right_keys(&self) -> bool {
        self.right_keyed
    }

    fn keyed(keys: &[Expr], reuse: bool, rows: Vec<Row>) -> Result<Vec<(Vec<Value>, Row)>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = match row.join_key() {
                Some(attached) if reuse => attached.to_vec(),
                _ => eval_key(keys, &row)?,
            };
            out.push((key, row));
        }
        out.sort_by(|a, b| key_cmp(&a.0, &b.0));
        Ok(out)
    }
}

impl Task for MergeJoinStage {
    fn kind(&self) -> TaskKind {
        TaskKind::MergeJoin
    }

    fn name(&self) -> String {
        format!("merge-join({}, {})", self.left_label, self.right_label)
    }

    fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
        Some(self)
    }
}

impl TaskRunner for MergeJoinStage {
    fn props(&self) -> Vec<ExplainProp> {
        let on: Vec<String> = self
            .left_keys
            .iter()
            .zip(&self.right_keys)
            .map(|(l, r)| format!("{l} = {r}"))
            .collect();
        vec![
            ExplainProp::plain("left", self.left_label.clone()),
            ExplainProp::plain("right", self.right_label.clone()),
            ExplainProp::plain("on", on.join(" AND ")),
        ]
    }

    fn run(&self, ctx: &RunContext, input: Flow) -> Result<Flow> {
        let name = self.name();
        let (left, right) = input.into_pair(&name)?;
        let left = Self::keyed(&self.left_keys, self.left_keyed, left)?;
        let right = Self::keyed(&self.right_keys, self.right_keyed, right)?;

        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match key_cmp(&left[i].0, &right[j].0) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    let i_end = group_end(&left, i);
                    let j_end = group_end(&right, j);
                    if self.null_keys_match || !left[i].0.iter().any(Value::is_null) {
                        for (_, l) in &left[i..i_end] {
                            for (_, r) in &right[j..j_end] {
                                out.push(Row::concat(l, r));
                            }
                        }
                        if let Some(limit) = self.max_rows {
                            if out.len() > limit {
                                return Err(QuarryError::JoinRowLimit { limit });
                            }
                        }
                    }
                    i = i_end;
                    j = j_end;
                }
            }
        }

        ctx.record_joined(out.len());
        debug!(
            join = %name,
            left = left.len(),
            right = right.len(),
            rows = out.len(),
            "exec.merge_join.finished"
        );
        Ok(Flow::Rows(out))
    }
}

/// Columns of `source`'s join conditions that belong to it, in condition
/// order.
pub(crate) fn side_keys(source: &SourceRef) -> Vec<Expr> {
    let qualifier = source.qualifier();
    let mut keys: Vec<Expr> = Vec::new();
    for node in &source.join_nodes {
        let Some((a, b)) = node.as_column_equality() else {
            continue;
        };
        for c in [a, b] {
            if c.qualifier.as_deref() == Some(qualifier) {
                keys.push(Expr::Column(c.clone()));
            }
        }
    }
    keys
}

pub(crate) fn eval_key(keys: &[Expr], row: &Row) -> Result<Vec<Value>> {
    keys.iter().map(|key| key.eval(row)).collect()
}

pub(crate) fn key_cmp(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn group_end(rows: &[(Vec<Value>, Row)], start: usize) -> usize {
    let key = &rows[start].0;
    start
        + rows[start..]
            .iter()
            .take_while(|(k, _)| key_cmp(k, key).is_eq())
            .count()
}
