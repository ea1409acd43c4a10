#![allow(missing_docs)]

use std::io::Write;
use std::sync::Arc;

use quarry::source::ColumnDesc;
use quarry::{
    col, lit, var, MemoryRegistry, MemoryTable, PlanBuilder, PlannerConfig, QueryResult,
    SelectBuilder, SourceCapabilities, SourceRef, Statement, SystemVariables, Value, ValueType,
};
use tempfile::NamedTempFile;

fn shop() -> MemoryRegistry {
    MemoryRegistry::new()
        .with_table(
            "users",
            MemoryTable::new(vec![
                ColumnDesc::new("id", ValueType::Int),
                ColumnDesc::new("name", ValueType::String),
                ColumnDesc::new("age", ValueType::Int),
            ])
            .row([Value::Int(1), Value::from("ada"), Value::Int(36)])
            .row([Value::Int(2), Value::from("grace"), Value::Int(45)])
            .row([Value::Int(3), Value::from("alan"), Value::Null]),
        )
        .with_table(
            "orders",
            MemoryTable::with_columns(["id", "user_id", "total"], ValueType::Int)
                .row([10, 1, 250])
                .row([11, 2, 40])
                .row([12, 1, 75])
                .row([13, 9, 5]),
        )
        .with_table(
            "items",
            MemoryTable::with_columns(["order_id", "sku"], ValueType::Int)
                .row([10, 100])
                .row([10, 101])
                .row([12, 102]),
        )
        .with_source(
            "system",
            SystemVariables::new()
                .set("sql_mode", "ANSI")
                .into_capabilities(),
        )
}

fn run(stmt: &Statement, config: PlannerConfig) -> QueryResult {
    PlanBuilder::new(config, Arc::new(shop()))
        .plan(stmt)
        .expect("plan")
        .execute()
        .expect("execute")
}

fn table(result: &QueryResult) -> Vec<Vec<Value>> {
    result
        .rows
        .iter()
        .map(|row| row.values().cloned().collect())
        .collect()
}

fn users_with_orders() -> Statement {
    SelectBuilder::new()
        .column(col("u.name"))
        .column_as(col("o.total"), "total")
        .from_as("users", "u")
        .join_as("orders", "o", col("u.id").eq(col("o.user_id")))
        .build()
        .unwrap()
}

#[test]
fn inner_join_matches_keys() {
    let result = run(&users_with_orders(), PlannerConfig::deterministic());
    let mut rows = table(&result);
    rows.sort_by(|a, b| a[1].total_cmp(&b[1]));
    assert_eq!(
        rows,
        vec![
            vec![Value::from("grace"), Value::Int(40)],
            vec![Value::from("ada"), Value::Int(75)],
            vec![Value::from("ada"), Value::Int(250)],
        ]
    );
    assert_eq!(result.stats.rows_scanned, 7);
    assert_eq!(result.stats.rows_joined, 3);
    let names: Vec<&str> = result.rows[0].names().collect();
    assert_eq!(names, ["name", "total"]);
}

#[test]
fn concurrent_and_sequential_runs_agree() {
    let stmt = users_with_orders();
    let a = run(&stmt, PlannerConfig::default());
    let b = run(&stmt, PlannerConfig::deterministic());
    assert_eq!(a.rows, b.rows);
}

#[test]
fn where_splits_between_sources_and_final_filter() {
    let stmt = SelectBuilder::new()
        .columns(["u.name", "o.total"])
        .from_as("users", "u")
        .join_as("orders", "o", col("u.id").eq(col("o.user_id")))
        .filter(col("o.total").gt(lit(50)).and(col("u.age").lt(col("o.total"))))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    let mut rows = table(&result);
    rows.sort_by(|a, b| a[1].total_cmp(&b[1]));
    assert_eq!(
        rows,
        vec![
            vec![Value::from("ada"), Value::Int(75)],
            vec![Value::from("ada"), Value::Int(250)],
        ]
    );
    assert_eq!(result.stats.rows_filtered, 2);
}

#[test]
fn three_way_join_chains_keys() {
    let stmt = SelectBuilder::new()
        .columns(["u.name", "i.sku"])
        .from_as("users", "u")
        .join_as("orders", "o", col("u.id").eq(col("o.user_id")))
        .join_as("items", "i", col("o.id").eq(col("i.order_id")))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::default());
    let mut skus: Vec<Value> = result
        .rows
        .iter()
        .map(|row| row.values().nth(1).cloned().unwrap())
        .collect();
    skus.sort_by(Value::total_cmp);
    assert_eq!(skus, [Value::Int(100), Value::Int(101), Value::Int(102)]);
    assert!(result
        .rows
        .iter()
        .all(|row| row.values().next() == Some(&Value::from("ada"))));
}

#[test]
fn wildcard_keeps_clashing_names_qualified() {
    let stmt = SelectBuilder::new()
        .wildcard()
        .from_as("orders", "o")
        .join_as("items", "i", col("o.id").eq(col("i.order_id")))
        .filter(col("i.sku").eq(lit(102)))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    assert_eq!(result.rows.len(), 1);
    let names: Vec<&str> = result.rows[0].names().collect();
    assert_eq!(names, ["id", "user_id", "total", "order_id", "sku"]);
}

#[test]
fn null_comparison_never_passes_filter() {
    let stmt = SelectBuilder::new()
        .column(col("name"))
        .from("users")
        .filter(col("age").lt(lit(40)).or(col("age").is_null().not()).not())
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    assert!(result.rows.is_empty());
}

#[test]
fn projection_casts_and_computes() {
    let stmt = SelectBuilder::new()
        .column_as(col("total").cast(ValueType::String), "label")
        .column_as(col("total").mul(lit(2)), "double")
        .from("orders")
        .filter(col("id").eq(lit(11)))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    assert_eq!(table(&result), vec![vec![Value::from("40"), Value::Int(80)]]);
}

#[test]
fn derived_source_joins_on_inner_columns() {
    let big = SelectBuilder::new()
        .columns(["id", "user_id"])
        .from("orders")
        .filter(col("total").gt(lit(60)))
        .build()
        .unwrap();
    let mut derived = SourceRef::new("orders").with_alias("big");
    derived.sub_statement = Some(Box::new(big));
    let stmt = SelectBuilder::new()
        .columns(["u.name", "big.id"])
        .from_as("users", "u")
        .join_source(derived, col("u.id").eq(col("big.user_id")))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    let mut ids: Vec<Value> = result
        .rows
        .iter()
        .map(|row| row.values().nth(1).cloned().unwrap())
        .collect();
    ids.sort_by(Value::total_cmp);
    assert_eq!(ids, [Value::Int(10), Value::Int(12)]);
}

#[test]
fn derived_source_exposes_its_select_list() {
    let amounts = SelectBuilder::new()
        .column_as(col("total"), "amount")
        .from("orders")
        .build()
        .unwrap();
    let stmt = SelectBuilder::new()
        .wildcard()
        .from_derived(amounts, "d")
        .filter(col("d.amount").lt(lit(60)))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    let names: Vec<&str> = result.rows[0].names().collect();
    assert_eq!(names, ["amount"]);
    assert_eq!(table(&result), vec![vec![Value::Int(40)], vec![Value::Int(5)]]);
}

#[test]
fn derived_aliases_join_and_filter() {
    let spend = SelectBuilder::new()
        .column(col("user_id"))
        .column_as(col("total"), "amount")
        .column_as(col("total").mul(lit(2)), "doubled")
        .from("orders")
        .filter(col("total").gt(lit(60)))
        .build()
        .unwrap();
    let mut derived = SourceRef::new("orders").with_alias("d");
    derived.sub_statement = Some(Box::new(spend));
    let stmt = SelectBuilder::new()
        .columns(["u.name", "d.amount", "d.doubled"])
        .from_as("users", "u")
        .join_source(derived, col("u.id").eq(col("d.user_id")))
        .filter(col("d.amount").lt(lit(200)))
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::default());
    assert_eq!(
        table(&result),
        vec![vec![Value::from("ada"), Value::Int(75), Value::Int(150)]]
    );
}

#[test]
fn single_source_on_terms_filter_that_source() {
    let stmt = SelectBuilder::new()
        .columns(["u.name", "o.total"])
        .from_as("users", "u")
        .join_as(
            "orders",
            "o",
            col("u.id").eq(col("o.user_id")).and(col("o.total").gt(lit(50))),
        )
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    let mut rows = table(&result);
    rows.sort_by(|a, b| a[1].total_cmp(&b[1]));
    assert_eq!(
        rows,
        vec![
            vec![Value::from("ada"), Value::Int(75)],
            vec![Value::from("ada"), Value::Int(250)],
        ]
    );
    assert_eq!(result.stats.rows_joined, 2);
}

#[test]
fn variable_names_ignore_case() {
    let stmt = SelectBuilder::new()
        .column(var("@@MAX_ALLOWED_PACKET"))
        .column(var("SQL_Mode"))
        .system()
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::deterministic());
    assert_eq!(
        table(&result),
        vec![vec![Value::Int(4_194_304), Value::from("ANSI")]]
    );
}

#[test]
fn system_variables_are_selectable() {
    let stmt = SelectBuilder::new()
        .column(var("@@max_allowed_packet"))
        .column_as(var("sql_mode"), "mode")
        .system()
        .build()
        .unwrap();
    let result = run(&stmt, PlannerConfig::default());
    assert_eq!(
        table(&result),
        vec![vec![Value::Int(4_194_304), Value::from("ANSI")]]
    );
}

#[test]
fn join_row_limit_from_toml_config() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "concurrent_sources = false\nmax_join_rows = 2").expect("write config");
    let config = PlannerConfig::load(file.path()).expect("config");
    assert_eq!(config.max_join_rows, Some(2));

    let err = PlanBuilder::new(config, Arc::new(shop()))
        .plan(&users_with_orders())
        .expect("plan")
        .execute()
        .expect_err("three rows exceed the limit");
    assert_eq!(err.code(), "JoinRowLimit");
}

#[test]
fn delegating_source_runs_inside_join() {
    use quarry::error::Result;
    use quarry::exec::{Flow, RunContext};
    use quarry::source::{SourcePlanner, SubPlanner};
    use quarry::{Row, Task, TaskKind, TaskRunner};

    #[derive(Debug)]
    struct Remote;

    impl Task for Remote {
        fn kind(&self) -> TaskKind {
            TaskKind::Custom("Remote")
        }

        fn into_runner(self: Arc<Self>) -> Option<Arc<dyn TaskRunner>> {
            Some(self)
        }
    }

    impl TaskRunner for Remote {
        fn run(&self, _ctx: &RunContext, _input: Flow) -> Result<Flow> {
            let mut row = Row::new();
            row.push("r.user_id", Value::Int(2));
            row.push("r.country", Value::from("US"));
            Ok(Flow::Rows(vec![row]))
        }
    }

    struct RemotePlanner;

    impl SourcePlanner for RemotePlanner {
        fn builder(&self) -> Result<Box<dyn SubPlanner>> {
            Ok(Box::new(RemotePlanner))
        }
    }

    impl SubPlanner for RemotePlanner {
        fn plan_sub_select(&self, _from: &SourceRef) -> Result<Option<Arc<dyn Task>>> {
            Ok(Some(Arc::new(Remote)))
        }
    }

    let registry = shop().with_source(
        "remote",
        SourceCapabilities::new().with_planner(Arc::new(RemotePlanner)),
    );
    let stmt = SelectBuilder::new()
        .columns(["u.name", "r.country"])
        .from_as("users", "u")
        .join_as("remote", "r", col("u.id").eq(col("r.user_id")))
        .build()
        .unwrap();
    let result = PlanBuilder::new(PlannerConfig::default(), Arc::new(registry))
        .plan(&stmt)
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(
        table(&result),
        vec![vec![Value::from("grace"), Value::from("US")]]
    );
}
