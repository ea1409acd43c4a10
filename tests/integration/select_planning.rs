#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use quarry::{
    col, lit, var, ErrorKind, ExplainNode, MemoryRegistry, MemoryTable, PlanBuilder,
    PlannerConfig, SelectBuilder, SourceCapabilities, Statement, SystemVariables, ValueType,
};

fn registry(tables: usize) -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    for i in 0..tables {
        registry.register_table(
            format!("t{i}"),
            MemoryTable::with_columns(["k", "v"], ValueType::Int)
                .row([1, i as i64])
                .row([2, 10 + i as i64]),
        );
    }
    registry.register("system", SystemVariables::new().into_capabilities());
    registry
}

fn chain(tables: usize, with_where: bool) -> Statement {
    let mut builder = SelectBuilder::new().column(col("t0.v")).from("t0");
    for i in 1..tables {
        builder = builder
            .column(col(&format!("t{i}.v")))
            .join(
                format!("t{i}"),
                col(&format!("t{}.k", i - 1)).eq(col(&format!("t{i}.k"))),
            );
    }
    if with_where {
        builder = builder.filter(col("t0.v").ge(lit(0)));
    }
    builder.build().expect("statement")
}

fn count(node: &ExplainNode, op: &str) -> usize {
    usize::from(node.op == op) + node.inputs.iter().map(|n| count(n, op)).sum::<usize>()
}

fn sub_selects(node: &ExplainNode) -> usize {
    let here = usize::from(node.op == "Sequential" && node.prop("name") == Some("sub-select"));
    here + node.inputs.iter().map(sub_selects).sum::<usize>()
}

fn planner(tables: usize) -> PlanBuilder {
    PlanBuilder::new(PlannerConfig::deterministic(), Arc::new(registry(tables)))
}

proptest! {
    #[test]
    fn fold_produces_one_join_and_fan_in_per_extra_source(
        tables in 1usize..=6,
        with_where in any::<bool>(),
    ) {
        let plan = planner(tables).plan(&chain(tables, with_where)).expect("plan");
        let root = &plan.explain;
        prop_assert_eq!(root.prop("name"), Some("select"));
        prop_assert_eq!(sub_selects(root), tables);
        prop_assert_eq!(count(root, "MergeJoin"), tables - 1);
        prop_assert_eq!(count(root, "Parallel"), tables - 1);
        prop_assert_eq!(count(root, "Projection"), 1);
        prop_assert_eq!(count(root, "WhereFinal"), usize::from(with_where));

        let ops: Vec<&str> = root.inputs.iter().map(|n| n.op.as_str()).collect();
        prop_assert_eq!(ops.last().copied(), Some("Projection"));
        if with_where {
            prop_assert_eq!(ops[ops.len() - 2], "WhereFinal");
        }
        if tables > 1 {
            prop_assert_eq!(&ops[..2], &["Parallel", "MergeJoin"][..]);
        }
    }
}

#[test]
fn scenario_single_source_with_filter() {
    let stmt = SelectBuilder::new()
        .columns(["a", "b"])
        .from("t1")
        .filter(col("a").gt(lit(5)))
        .build()
        .unwrap();
    let registry = MemoryRegistry::new().with_table(
        "t1",
        MemoryTable::with_columns(["a", "b", "c"], ValueType::Int),
    );
    let plan = PlanBuilder::new(PlannerConfig::default(), Arc::new(registry))
        .plan(&stmt)
        .unwrap();
    assert_eq!(
        plan.explain.render_text(false),
        "Sequential [name=select]\n\
         \x20 Sequential [name=sub-select]\n\
         \x20   Scan [source=t1]\n\
         \x20 WhereFinal [scope=select, predicate=a > 5]\n\
         \x20 Projection [columns=a, b]\n"
    );
}

#[test]
fn scenario_two_way_join() {
    let stmt = SelectBuilder::new()
        .columns(["t0.v", "t1.v"])
        .from("t0")
        .join("t1", col("t0.k").eq(col("t1.k")))
        .build()
        .unwrap();
    let plan = planner(2).plan(&stmt).unwrap();
    let ops: Vec<&str> = plan.explain.inputs.iter().map(|n| n.op.as_str()).collect();
    assert_eq!(ops, ["Parallel", "MergeJoin", "Projection"]);

    let join = &plan.explain.inputs[1];
    assert_eq!(join.prop("on"), Some("t0.k = t1.k"));
    for side in &plan.explain.inputs[0].inputs {
        let stages: Vec<&str> = side.inputs.iter().map(|n| n.op.as_str()).collect();
        assert_eq!(stages, ["SourceJoin", "JoinKey"]);
        assert_eq!(side.inputs[0].prop("seekable"), Some("true"));
    }
}

#[test]
fn scenario_system_variable() {
    let stmt = SelectBuilder::new()
        .column(var("@@max_allowed_packet"))
        .system()
        .build()
        .unwrap();
    let plan = planner(0).plan(&stmt).expect("system path");
    assert_eq!(plan.explain.prop("name"), Some("select-schemainfo"));
}

#[test]
fn errors_carry_taxonomy() {
    let missing_from = SelectBuilder::new().column(lit(1)).build().unwrap();
    assert_eq!(
        planner(1).plan(&missing_from).unwrap_err().kind(),
        ErrorKind::PlanningInput
    );

    let unknown = SelectBuilder::new().wildcard().from("t9").build().unwrap();
    let err = planner(1).plan(&unknown).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceResolution);
    assert_eq!(err.to_string(), "could not find source for 't9'");

    let registry = registry(1);
    registry.register("bare", SourceCapabilities::new());
    let stmt = SelectBuilder::new().wildcard().from("bare").build().unwrap();
    let err = PlanBuilder::new(PlannerConfig::default(), Arc::new(registry))
        .plan(&stmt)
        .unwrap_err();
    assert_eq!(err.code(), "MissingScanner");
}

#[test]
fn statement_round_trips_through_json() {
    let stmt = chain(3, true);
    let json = serde_json::to_string(&stmt).expect("serialize");
    let back: Statement = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, stmt);
    let a = planner(3).plan(&stmt).unwrap().plan_hash;
    let b = planner(3).plan(&back).unwrap().plan_hash;
    assert_eq!(a, b);
}
