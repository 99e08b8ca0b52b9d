//! End-to-end view-syncer scenarios against the in-memory replica and
//! CVR store.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use zync_core::models::permissions::{
    anyone_can, AllowRule, AssetPolicies, PermissionsConfig, TablePolicies,
};
use zync_core::models::query::{
    Ast, Condition, Correlation, CorrelatedSubquery, ExistsOp, SimpleCondition, SimpleOperator,
    ValuePosition,
};
use zync_core::models::row::RowValue;
use zync_core::models::schema::{ClientSchema, ColumnSpec, SchemaVersions, TableSpec, ValueType};
use zync_core::protocol::{Downstream, ErrorKind, QueriesPatch, RowsPatch};
use zync_core::storage::StoredPermissions;
use zync_storage::MemCvrStore;
use zync_syncer::replica::{MemReplica, CLIENTS_TABLE};
use zync_syncer::view_syncer::{ConnectionInit, ViewSyncer, ViewSyncerConfig};

fn spec(name: &str, columns: &[&str], pk: &[&str]) -> TableSpec {
    TableSpec {
        schema: "public".to_string(),
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| (c.to_string(), ColumnSpec { data_type: ValueType::Text, not_null: false }))
            .collect(),
        primary_key: pk.iter().map(|c| c.to_string()).collect(),
        unique_indexes: vec![],
    }
}

fn replica() -> Arc<MemReplica> {
    let replica = MemReplica::new(SchemaVersions {
        min_supported_version: 1,
        max_supported_version: 3,
    });
    replica.create_table(spec("users", &["id", "name"], &["id"]));
    replica.create_table(spec("issues", &["id", "project_id", "rank"], &["id"]));
    replica.create_table(spec(
        "project_members",
        &["id", "project_id", "user_id"],
        &["id"],
    ));
    replica.create_table(spec(
        CLIENTS_TABLE,
        &["client_group_id", "client_id", "last_mutation_id"],
        &["client_group_id", "client_id"],
    ));
    Arc::new(replica)
}

fn row(v: Value) -> RowValue {
    v.as_object().unwrap().clone()
}

fn syncer(
    group: &str,
    store: &Arc<MemCvrStore>,
    replica: &Arc<MemReplica>,
) -> ViewSyncer<MemCvrStore> {
    ViewSyncer::new(
        group.to_string(),
        store.clone(),
        replica.clone(),
        ViewSyncerConfig::default(),
    )
}

fn init(client_id: &str, base_cookie: Option<&str>, auth: Value) -> ConnectionInit {
    ConnectionInit {
        client_id: client_id.to_string(),
        base_cookie: base_cookie.map(str::to_string),
        schema_version: 1,
        client_schema: ClientSchema::default(),
        auth_data: auth,
    }
}

async fn recv(stream: &mut ReceiverStream<Downstream>) -> Downstream {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream closed")
}

async fn assert_idle(stream: &mut ReceiverStream<Downstream>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err(),
        "expected no further frames"
    );
}

/// Collects the frames of exactly one poke (start..end).
async fn recv_poke(stream: &mut ReceiverStream<Downstream>) -> Vec<Downstream> {
    let mut frames = Vec::new();
    let start = recv(stream).await;
    assert!(matches!(start, Downstream::PokeStart(_)), "expected pokeStart, got {start:?}");
    frames.push(start);
    loop {
        let frame = recv(stream).await;
        let done = matches!(frame, Downstream::PokeEnd(_));
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

fn rows_patches(frames: &[Downstream]) -> Vec<RowsPatch> {
    frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(part) => part.rows_patch.clone(),
            _ => None,
        })
        .flatten()
        .collect()
}

fn end_cookie(frames: &[Downstream]) -> String {
    match frames.last() {
        Some(Downstream::PokeEnd(end)) => end.cookie.clone(),
        other => panic!("expected pokeEnd, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_cold_connect_empty_db_then_insert() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);

    let mut stream = vs.connect(init("c1", None, json!({}))).await.unwrap();
    // The connection handshake brings the cold client to the CVR's
    // (initial) version.
    let frames = recv_poke(&mut stream).await;
    assert_eq!(rows_patches(&frames), vec![]);

    // Desiring query(users) hydrates it against the empty table: query
    // patches, no rows.
    vs.change_desired_queries(&"c1".to_string(), vec![Ast::table("users")], vec![])
        .await
        .unwrap();
    let frames = recv_poke(&mut stream).await;
    assert_eq!(rows_patches(&frames), vec![]);
    let has_got_put = frames.iter().any(|f| match f {
        Downstream::PokePart(part) => part
            .got_queries_patch
            .as_ref()
            .map(|p| matches!(p[0], QueriesPatch::Put { .. }))
            .unwrap_or(false),
        _ => false,
    });
    assert!(has_got_put, "hydration must announce the got query");
    let hydrated_cookie = end_cookie(&frames);

    // A row arrives: the next advance pokes it.
    replica
        .write()
        .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
        .commit()
        .unwrap();
    vs.advance().await.unwrap();

    let frames = recv_poke(&mut stream).await;
    assert_eq!(
        rows_patches(&frames),
        vec![RowsPatch::Put {
            table_name: "users".to_string(),
            value: row(json!({"id": "u1", "name": "Alice"})),
        }]
    );
    assert!(end_cookie(&frames) > hydrated_cookie);
    assert_idle(&mut stream).await;
}

#[test_log::test(tokio::test)]
async fn test_noop_and_unrelated_advances() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);

    let mut stream = vs.connect(init("c1", None, json!({}))).await.unwrap();
    recv_poke(&mut stream).await;
    vs.change_desired_queries(&"c1".to_string(), vec![Ast::table("users")], vec![])
        .await
        .unwrap();
    recv_poke(&mut stream).await;

    // No replica movement: no messages at all.
    vs.advance().await.unwrap();
    assert_idle(&mut stream).await;

    // A change in an unrelated table advances the cookie with an empty
    // poke: pokeStart/pokeEnd and nothing in between.
    replica
        .write()
        .upsert("issues", row(json!({"id": "i1", "project_id": "p9", "rank": 1})))
        .commit()
        .unwrap();
    vs.advance().await.unwrap();
    let frames = recv_poke(&mut stream).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(end_cookie(&frames), replica.head());

    // Replaying the advance emits nothing further.
    vs.advance().await.unwrap();
    assert_idle(&mut stream).await;
}

#[test_log::test(tokio::test)]
async fn test_catchup_of_lagging_client() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);

    let mut stream = vs.connect(init("c1", None, json!({}))).await.unwrap();
    recv_poke(&mut stream).await;
    vs.change_desired_queries(&"c1".to_string(), vec![Ast::table("users")], vec![])
        .await
        .unwrap();
    recv_poke(&mut stream).await;

    replica
        .write()
        .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
        .commit()
        .unwrap();
    vs.advance().await.unwrap();
    let acked = end_cookie(&recv_poke(&mut stream).await);

    // The client goes away; the world moves on.
    vs.close_connection(&"c1".to_string());
    drop(stream);
    replica
        .write()
        .upsert("users", row(json!({"id": "u2", "name": "Bob"})))
        .commit()
        .unwrap();
    vs.advance().await.unwrap();

    // Reconnecting at the acknowledged cookie replays only what is
    // missing: u2, not u1.
    let mut stream = vs
        .connect(init("c1", Some(&acked), json!({})))
        .await
        .unwrap();
    let frames = recv_poke(&mut stream).await;
    let rows = rows_patches(&frames);
    assert_eq!(rows.len(), 1);
    assert!(matches!(
        &rows[0],
        RowsPatch::Put { value, .. } if value["id"] == json!("u2")
    ));

    // A second, cold client of the same group receives the full view.
    let mut cold = vs.connect(init("c2", None, json!({}))).await.unwrap();
    let frames = recv_poke(&mut cold).await;
    let mut ids: Vec<String> = rows_patches(&frames)
        .iter()
        .map(|p| match p {
            RowsPatch::Put { value, .. } => value["id"].as_str().unwrap().to_string(),
            RowsPatch::Del { .. } => panic!("no deletes expected"),
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["u1", "u2"]);
}

#[test_log::test(tokio::test)]
async fn test_client_ahead_of_cvr_is_not_found() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);

    let err = vs
        .connect(init("c1", Some("zz"), json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClientNotFound);
}

fn membership_permissions() -> StoredPermissions {
    let membership = Condition::Correlated {
        related: CorrelatedSubquery {
            correlation: Correlation {
                parent_field: vec!["project_id".to_string()],
                child_field: vec!["project_id".to_string()],
            },
            subquery: Box::new(Ast {
                where_: Some(Condition::Simple(SimpleCondition {
                    op: SimpleOperator::Eq,
                    left: ValuePosition::column("user_id"),
                    right: ValuePosition::auth_param(["sub"]),
                })),
                ..Ast::table("project_members")
            }),
            system: Default::default(),
        },
        op: ExistsOp::Exists,
    };
    let mut tables = BTreeMap::new();
    tables.insert(
        "issues".to_string(),
        TablePolicies {
            row: Some(AssetPolicies {
                select: Some(vec![AllowRule(membership)]),
                ..Default::default()
            }),
            cell: BTreeMap::new(),
        },
    );
    tables.insert(
        "users".to_string(),
        TablePolicies {
            row: Some(AssetPolicies { select: Some(anyone_can()), ..Default::default() }),
            cell: BTreeMap::new(),
        },
    );
    tables.insert(
        "project_members".to_string(),
        TablePolicies {
            row: Some(AssetPolicies { select: Some(anyone_can()), ..Default::default() }),
            cell: BTreeMap::new(),
        },
    );
    tables.insert(
        CLIENTS_TABLE.to_string(),
        TablePolicies {
            row: Some(AssetPolicies { select: Some(anyone_can()), ..Default::default() }),
            cell: BTreeMap::new(),
        },
    );
    let config = PermissionsConfig { tables };
    let hash = config.hash();
    StoredPermissions { config, hash }
}

#[test_log::test(tokio::test)]
async fn test_permission_denial_via_nested_relationship() {
    let replica = replica();
    replica
        .write()
        .upsert("issues", row(json!({"id": "001", "project_id": "p1", "rank": 1})))
        .upsert("issues", row(json!({"id": "002", "project_id": "p1", "rank": 2})))
        .upsert("issues", row(json!({"id": "003", "project_id": "p1", "rank": 3})))
        .upsert(
            "project_members",
            row(json!({"id": "m1", "project_id": "p1", "user_id": "admin"})),
        )
        .commit()
        .unwrap();

    let issues_query = Ast::table("issues");

    // u2 is not a member of p1: the result set is empty even though the
    // issues exist.
    let store_u2 = Arc::new(MemCvrStore::new("g-u2"));
    store_u2.set_permissions(membership_permissions());
    let mut vs_u2 = syncer("g-u2", &store_u2, &replica);
    let mut stream_u2 = vs_u2
        .connect(init("c-u2", None, json!({"sub": "u2"})))
        .await
        .unwrap();
    recv_poke(&mut stream_u2).await;
    vs_u2
        .change_desired_queries(&"c-u2".to_string(), vec![issues_query.clone()], vec![])
        .await
        .unwrap();
    let frames = recv_poke(&mut stream_u2).await;
    assert_eq!(rows_patches(&frames), vec![], "no rows may leak to a non-member");

    // The admin sees all three issues through the same query.
    let store_admin = Arc::new(MemCvrStore::new("g-admin"));
    store_admin.set_permissions(membership_permissions());
    let mut vs_admin = syncer("g-admin", &store_admin, &replica);
    let mut stream_admin = vs_admin
        .connect(init("c-admin", None, json!({"sub": "admin"})))
        .await
        .unwrap();
    recv_poke(&mut stream_admin).await;
    vs_admin
        .change_desired_queries(&"c-admin".to_string(), vec![issues_query.clone()], vec![])
        .await
        .unwrap();
    let frames = recv_poke(&mut stream_admin).await;
    let mut ids: Vec<String> = rows_patches(&frames)
        .iter()
        .map(|p| match p {
            RowsPatch::Put { value, .. } => value["id"].as_str().unwrap().to_string(),
            RowsPatch::Del { .. } => panic!("no deletes expected"),
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["001", "002", "003"]);

    // Membership granted later flows through as an advance.
    replica
        .write()
        .upsert(
            "project_members",
            row(json!({"id": "m2", "project_id": "p1", "user_id": "u2"})),
        )
        .commit()
        .unwrap();
    vs_u2.advance().await.unwrap();
    let frames = recv_poke(&mut stream_u2).await;
    assert_eq!(rows_patches(&frames).len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_schema_version_out_of_range() {
    let replica = Arc::new({
        let r = MemReplica::new(SchemaVersions {
            min_supported_version: 2,
            max_supported_version: 3,
        });
        r.create_table(spec("users", &["id", "name"], &["id"]));
        r
    });
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);

    let mut connection = init("c1", None, json!({}));
    connection.schema_version = 1;
    let mut stream = vs.connect(connection).await.unwrap();

    // The subscription dies on the first poke attempt.
    let frame = recv(&mut stream).await;
    let Downstream::Error(body) = frame else {
        panic!("expected a terminal error, got {frame:?}");
    };
    assert_eq!(body.kind, ErrorKind::SchemaVersionNotSupported);
    assert!(body.message.contains("[2, 3]"));
}

#[test_log::test(tokio::test)]
async fn test_last_mutation_ids_and_big_integer_safety() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));
    let mut vs = syncer("g1", &store, &replica);
    let mut stream = vs.connect(init("c1", None, json!({}))).await.unwrap();
    recv_poke(&mut stream).await;

    // A normal mutation watermark rides in lastMutationIDChanges.
    replica
        .write()
        .upsert(
            CLIENTS_TABLE,
            row(json!({"client_group_id": "g1", "client_id": "c1", "last_mutation_id": 7})),
        )
        .commit()
        .unwrap();
    vs.advance().await.unwrap();
    let frames = recv_poke(&mut stream).await;
    let lmids: Vec<BTreeMap<String, i64>> = frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(part) => part.last_mutation_id_changes.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(lmids, vec![[("c1".to_string(), 7i64)].into_iter().collect()]);

    // A watermark beyond the safe integer range terminates the
    // subscription instead of silently truncating.
    let mut huge = RowValue::new();
    huge.insert("client_group_id".to_string(), json!("g1"));
    huge.insert("client_id".to_string(), json!("c1"));
    huge.insert(
        "last_mutation_id".to_string(),
        Value::Number(serde_json::Number::from_f64(9.8371234123423412e22).unwrap()),
    );
    replica
        .write()
        .upsert(CLIENTS_TABLE, huge)
        .commit()
        .unwrap();
    vs.advance().await.unwrap();

    let error = loop {
        match recv(&mut stream).await {
            Downstream::Error(body) => break body,
            _ => continue,
        }
    };
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.message.contains("exceeds the safe Number range"));
}

#[test_log::test(tokio::test)]
async fn test_lease_takeover_fails_old_instance() {
    let replica = replica();
    let store = Arc::new(MemCvrStore::new("g1"));

    let mut old = syncer("g1", &store, &replica);
    let mut old_stream = old.connect(init("c1", None, json!({}))).await.unwrap();
    recv_poke(&mut old_stream).await;
    old.change_desired_queries(&"c1".to_string(), vec![Ast::table("users")], vec![])
        .await
        .unwrap();
    recv_poke(&mut old_stream).await;

    // A new instance takes over the group: its first flush stamps a new
    // owner.
    let mut new = syncer("g1", &store, &replica);
    let mut new_stream = new.connect(init("c2", None, json!({}))).await.unwrap();
    recv_poke(&mut new_stream).await;

    // The old instance detects the takeover on its next CVR transaction.
    let err = old
        .change_desired_queries(&"c1".to_string(), vec![Ast::table("issues")], vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    // Its subscriptions are torn down.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), old_stream.next())
            .await
            .map(|f| f.is_none())
            .unwrap_or(false)
    );
}
