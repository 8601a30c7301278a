//! End-to-end scenarios against the public `Engine` façade (spec §8
//! "Concrete end-to-end scenarios").
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};

use hybriddb::query::spec::{AttributePredicate, ForceStorage, WhereClause};
use hybriddb::{AggregateOp, ColumnarConfig, Edge, Engine, EngineConfig, QuerySpec, Strategy, Value};

async fn engine() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let cfg = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    (dir, Engine::with_config(cfg).await.expect("engine init"))
}

fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

#[tokio::test]
async fn transactional_get_by_id() {
    let (_dir, engine) = engine().await;
    engine
        .save_entity(
            "business-partner",
            "BP001",
            attrs(&[
                ("name", Value::String("TechCorp".into())),
                ("revenue", Value::Number(2_500_000.0)),
                ("region", Value::String("Northeast".into())),
            ]),
            BTreeMap::new(),
        )
        .await
        .expect("save");

    let spec = QuerySpec {
        primary: "business-partner".into(),
        id: Some("BP001".into()),
        include: Some(vec!["*".to_string()]),
        ..Default::default()
    };
    let result = engine.enhanced_query(&spec, true).await.expect("query");
    assert_eq!(result.outcome.rows.len(), 1);
    assert_eq!(result.outcome.strategy, Strategy::EntityOnly);
    assert!(result.outcome.plan.reason.contains("transactional"));
    assert!(result.metrics.is_some());
}

async fn seed_business_partners(engine: &Engine) {
    engine
        .enable_columnar_storage(
            "business-partner",
            ColumnarConfig {
                columns: BTreeSet::from([
                    "revenue".to_string(),
                    "region".to_string(),
                    "customerClass".to_string(),
                    "industry".to_string(),
                    "employeeCount".to_string(),
                ]),
                indexes: BTreeSet::from(["region".to_string(), "customerClass".to_string(), "industry".to_string()]),
                ..Default::default()
            },
        )
        .await
        .expect("enable columnar");

    let rows = [
        ("BP001", 2_500_000.0, "Northeast", "TechCorp"),
        ("BP002", 1_800_000.0, "West", "Acme"),
        ("BP003", 950_000.0, "South", "Southworks"),
        ("BP004", 250_000.0, "West", "Smallco"),
    ];
    for (id, revenue, region, name) in rows {
        engine
            .save_entity(
                "business-partner",
                id,
                attrs(&[
                    ("name", Value::String(name.into())),
                    ("revenue", Value::Number(revenue)),
                    ("region", Value::String(region.into())),
                ]),
                BTreeMap::new(),
            )
            .await
            .expect("save");
    }
}

#[tokio::test]
async fn analytical_group_by_sum() {
    let (_dir, engine) = engine().await;
    seed_business_partners(&engine).await;

    let spec = QuerySpec {
        primary: "business-partner".into(),
        aggregate: Some(BTreeMap::from([("revenue".to_string(), AggregateOp::Sum)])),
        group_by: Some(vec!["region".to_string()]),
        ..Default::default()
    };
    let outcome = engine.query(&spec).await.expect("query");
    assert_eq!(outcome.strategy, Strategy::ColumnarOnly);

    let mut by_group: BTreeMap<String, f64> = BTreeMap::new();
    for row in &outcome.rows {
        let group = row["group"].as_str().expect("group").to_string();
        let value = row["value"].as_f64().expect("value");
        by_group.insert(group, value);
    }
    assert_eq!(by_group.get("Northeast"), Some(&2_500_000.0));
    assert_eq!(by_group.get("West"), Some(&2_050_000.0));
    assert_eq!(by_group.get("South"), Some(&950_000.0));
}

#[tokio::test]
async fn hybrid_filter_plus_full_record() {
    let (_dir, engine) = engine().await;
    seed_business_partners(&engine).await;

    let spec = QuerySpec {
        primary: "business-partner".into(),
        where_clause: Some(WhereClause {
            attributes: BTreeMap::from([
                ("region".to_string(), AttributePredicate::eq(Value::String("West".into()))),
                (
                    "revenue".to_string(),
                    AttributePredicate {
                        gt: Some(Value::Number(500_000.0)),
                        ..Default::default()
                    },
                ),
            ]),
            ..Default::default()
        }),
        include: Some(vec!["*".to_string()]),
        ..Default::default()
    };
    let outcome = engine.query(&spec).await.expect("query");
    assert_eq!(outcome.strategy, Strategy::Hybrid);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0]["id"], "BP002");
    assert_eq!(outcome.rows[0]["attributes"]["name"], "Acme");
}

#[tokio::test]
async fn forced_strategy_disagreement_detection() {
    let (_dir, engine) = engine().await;
    seed_business_partners(&engine).await;

    let base = QuerySpec {
        primary: "business-partner".into(),
        aggregate: Some(BTreeMap::from([("revenue".to_string(), AggregateOp::Sum)])),
        group_by: Some(vec!["region".to_string()]),
        ..Default::default()
    };

    let mut as_entity = base.clone();
    as_entity.force_storage = Some(ForceStorage::Entity);
    let mut as_columnar = base.clone();
    as_columnar.force_storage = Some(ForceStorage::Columnar);

    let entity_outcome = engine.query(&as_entity).await.expect("entity query");
    let columnar_outcome = engine.query(&as_columnar).await.expect("columnar query");

    assert_ne!(entity_outcome.strategy, columnar_outcome.strategy);

    let sum_of = |rows: &[serde_json::Value]| -> f64 {
        rows.iter().filter_map(|r| r["value"].as_f64()).sum()
    };
    assert!((sum_of(&entity_outcome.rows) - sum_of(&columnar_outcome.rows)).abs() < f64::EPSILON);
}

#[tokio::test]
async fn edge_and_path_traversal() {
    let (_dir, engine) = engine().await;
    engine.save_entity("customer", "C1", BTreeMap::new(), BTreeMap::new()).await.expect("save customer");
    engine.save_entity("user", "U1", BTreeMap::new(), BTreeMap::new()).await.expect("save u1");
    engine.save_entity("user", "U2", BTreeMap::new(), BTreeMap::new()).await.expect("save u2");

    engine
        .add_edge(
            "customer",
            "C1",
            Edge {
                id: "e1".into(),
                edge_type: "EMPLOYS".into(),
                target: "user:U1".into(),
                properties: None,
                weight: None,
                temporal: None,
            },
        )
        .await
        .expect("add edge 1");
    engine
        .add_edge(
            "user",
            "U1",
            Edge {
                id: "e2".into(),
                edge_type: "EMPLOYS".into(),
                target: "user:U2".into(),
                properties: None,
                weight: None,
                temporal: None,
            },
        )
        .await
        .expect("add edge 2");

    let paths = engine.find_paths("customer:C1", "user:U2", 3).await;
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].len(), 3);
}

#[tokio::test]
async fn crash_recovery_preserves_versions() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let cfg = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let mut expected_versions = BTreeMap::new();
    {
        let engine = Engine::with_config(cfg.clone()).await.expect("engine init");
        for kind in ["customer", "user", "order"] {
            for i in 0..50 {
                let id = format!("{kind}-{i}");
                let entity = engine
                    .save_entity(kind, &id, attrs(&[("seq", Value::Number(f64::from(i)))]), BTreeMap::new())
                    .await
                    .expect("save");
                expected_versions.insert((kind.to_string(), id), entity.metadata.version);
            }
        }
        // No explicit close(): simulates an abrupt process exit — only the
        // WAL persists.
    }

    let engine = Engine::with_config(cfg).await.expect("reopen");
    for kind in ["customer", "user", "order"] {
        let all = engine.get_all_entities(kind).await;
        assert_eq!(all.len(), 50);
        for entity in all {
            let expected = expected_versions[&(kind.to_string(), entity.id.clone())];
            assert_eq!(entity.metadata.version, expected);
        }
    }
}
