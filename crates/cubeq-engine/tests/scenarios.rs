use cubeq_engine::{ErrorKind, Qb, QbError, QueryResult, TaskScope};
use cubeq_ir::Query;
use cubeq_registry::AggregateRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn qb() -> Qb {
    Qb::new(Arc::new(AggregateRegistry::default()))
}

fn query(value: Value) -> Query {
    Query::from_json(value).unwrap()
}

fn rows() -> Vec<Value> {
    vec![
        json!({"c": "a", "n": 1}),
        json!({"c": "a", "n": 3}),
        json!({"c": "b", "n": 5}),
    ]
}

#[test]
fn test_scenario_a_set_domain_sum() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "sum"},
        "edges": [{"name": "c", "domain": {"type": "set", "partitions": ["a", "b"]}}]
    }));
    let cube = qb().cube(&q, &rows()).unwrap();
    assert_eq!(cube.dims(), &[2]);
    assert_eq!(cube.to_json(), json!([4, 5]));
}

#[test]
fn test_scenario_b_null_partition() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "sum"},
        "edges": [{"name": "c", "allowNulls": true, "domain": {"type": "set", "partitions": ["a"]}}]
    }));
    let cube = qb().cube(&q, &rows()).unwrap();
    assert_eq!(cube.to_json(), json!([4, 5]));

    let domain = &cube.edges()[0].domain;
    assert_eq!(domain.partition_at(0).unwrap().name, "a");
    assert!(domain.partition_at(1).unwrap().is_null());
}

#[test]
fn test_nulls_dropped_without_allow_nulls() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "sum"},
        "edges": [{"name": "c", "domain": {"type": "set", "partitions": ["a"]}}]
    }));
    assert_eq!(qb().cube(&q, &rows()).unwrap().to_json(), json!([4]));
}

#[test]
fn test_scenario_c_one_conflict() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "one"},
        "edges": [{"name": "c"}]
    }));
    let err = qb().cube(&q, &rows()).unwrap_err();
    assert!(matches!(err, QbError::Aggregate(_)));
    assert_eq!(err.kind(), ErrorKind::DataInvariant);
}

#[test]
fn test_discovered_domain_sorted() {
    let q = query(json!({
        "from": "rows",
        "select": [{"name": "count", "aggregate": "count"}, {"value": "n", "aggregate": "max"}],
        "edges": [{"name": "c"}]
    }));
    let mut data = rows();
    data.reverse();
    let cube = qb().cube(&q, &data).unwrap();
    assert_eq!(
        cube.to_json(),
        json!([{"count": 2, "n": 3}, {"count": 1, "n": 5}])
    );
}

#[test]
fn test_empty_cells_take_defaults() {
    let q = query(json!({
        "from": "rows",
        "select": [
            {"name": "avg", "value": "n", "aggregate": "average", "default": 0},
            {"name": "count", "aggregate": "count"}
        ],
        "edges": [{"name": "c", "domain": {"type": "set", "partitions": ["a", "b", "z"]}}]
    }));
    let cube = qb().cube(&q, &rows()).unwrap();
    assert_eq!(cube.to_json()[0], json!({"avg": 2, "count": 2}));
    assert_eq!(cube.to_json()[2], json!({"avg": 0, "count": 0}));
}

#[test]
fn test_ranged_edge_multiplies_rows() {
    let q = query(json!({
        "from": "bugs",
        "select": {"aggregate": "count"},
        "edges": [{
            "name": "open",
            "range": {"min": "opened", "max": "closed"},
            "domain": {"type": "time", "interval": "day", "min": "2024-03-01", "max": "2024-03-05"}
        }]
    }));
    let bugs = vec![
        json!({"opened": "2024-03-01T10:00:00Z", "closed": "2024-03-03T00:00:00Z"}),
        json!({"opened": "2024-03-02T00:00:00Z"}),
    ];
    let cube = qb().cube(&q, &bugs).unwrap();
    assert_eq!(cube.to_json(), json!([1, 2, 1, 1]));

    let domain = &cube.edges()[0].domain;
    let labels: Vec<String> = domain.partitions().iter().map(|p| domain.label(p)).collect();
    assert_eq!(labels, vec!["2024-03-01", "2024-03-02", "2024-03-03", "2024-03-04"]);
}

#[test]
fn test_partition_filter_edge() {
    let q = query(json!({
        "from": "bugs",
        "select": {"aggregate": "count"},
        "edges": [{"name": "team", "domain": {"type": "set", "partitions": [
            {"name": "core", "esfilter": {"term": {"product": "core"}}},
            {"name": "other", "esfilter": {"not": {"term": {"product": "core"}}}}
        ]}}]
    }));
    let bugs = vec![
        json!({"product": "core"}),
        json!({"product": "core"}),
        json!({"product": "firefox"}),
    ];
    assert_eq!(qb().cube(&q, &bugs).unwrap().to_json(), json!([2, 1]));
}

#[test]
fn test_composite_key_edge() {
    let q = query(json!({
        "from": "bugs",
        "select": {"aggregate": "count"},
        "edges": [{"name": "pc", "allowNulls": true, "domain": {
            "type": "set",
            "key": ["product", "component"],
            "partitions": [
                {"product": "core", "component": "js"},
                {"product": "core", "component": "dom"}
            ]
        }}]
    }));
    let bugs = vec![
        json!({"product": "core", "component": "dom"}),
        json!({"product": "core", "component": "js"}),
        json!({"product": "core", "component": "dom"}),
        json!({"product": "firefox", "component": "js"}),
    ];
    assert_eq!(qb().cube(&q, &bugs).unwrap().to_json(), json!([1, 2, 1]));
}

#[test]
fn test_list_sorted_and_limited() {
    let q = query(json!({
        "from": "rows",
        "select": [{"name": "count", "aggregate": "count"}, {"name": "total", "value": "n", "aggregate": "sum"}],
        "edges": [{"name": "c"}],
        "sort": [{"value": "total", "sort": -1}],
        "limit": 1
    }));
    let list = qb().list(&q, &rows()).unwrap();
    assert_eq!(list, vec![json!({"c": "b", "count": 1, "total": 5})]);
}

#[test]
fn test_setop_projection() {
    let q = query(json!({
        "from": "rows",
        "select": [{"value": "c"}, {"value": "n"}],
        "filter": {"term": {"c": "a"}},
        "sort": [{"value": "n", "sort": -1}]
    }));
    let list = qb().list(&q, &rows()).unwrap();
    assert_eq!(list, vec![json!({"c": "a", "n": 3}), json!({"c": "a", "n": 1})]);

    let single = query(json!({"from": "rows", "select": {"value": "n"}, "where": "n >= 3"}));
    assert_eq!(qb().list(&single, &rows()).unwrap(), vec![json!(3), json!(5)]);
}

#[test]
fn test_aggop_single_cell() {
    let q = query(json!({
        "from": "rows",
        "select": [{"name": "total", "value": "n", "aggregate": "sum"}, {"name": "p", "value": "n", "aggregate": "median"}]
    }));
    let result = qb().run(&q, &rows()).unwrap();
    let cube = result.as_cube().unwrap();
    assert!(cube.dims().is_empty());
    assert_eq!(cube.to_json(), json!({"total": 9, "p": 3}));
    assert_eq!(qb().list(&q, &rows()).unwrap(), vec![json!({"total": 9, "p": 3})]);
}

#[test]
fn test_time_values_keep_their_type() {
    let q = query(json!({
        "from": "bugs",
        "select": {"value": "opened", "aggregate": "max"},
        "edges": [{"name": "c"}]
    }));
    let bugs = vec![
        json!({"c": "a", "opened": "2024-03-01T10:00:00Z"}),
        json!({"c": "a", "opened": "2024-03-04T00:00:00Z"}),
    ];
    assert_eq!(qb().cube(&q, &bugs).unwrap().to_json(), json!(["2024-03-04T00:00:00Z"]));
}

#[tokio::test]
async fn test_cancelled_scan_returns_no_cube() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "sum"},
        "edges": [{"name": "c"}]
    }));
    let token = CancellationToken::new();
    token.cancel();
    let result = qb().with_yield_every(1).run_task(&q, &rows(), &token).await;
    assert!(matches!(result, Err(QbError::Cancelled)));
}

#[tokio::test]
async fn test_scan_in_task_scope() {
    let q = query(json!({
        "from": "rows",
        "select": {"value": "n", "aggregate": "sum"},
        "edges": [{"name": "c"}]
    }));
    let data = Arc::new(rows());
    let mut scope: TaskScope<QueryResult> = TaskScope::new();
    for _ in 0..2 {
        let (qb, q, data) = (qb().with_yield_every(1), q.clone(), data.clone());
        scope.spawn(move |token| async move { qb.run_task(&q, &data, &token).await });
    }
    let results = scope.join_all().await.unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result.as_cube().unwrap().to_json(), json!([4, 5]));
    }
}
