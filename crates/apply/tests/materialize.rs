use std::collections::BTreeMap;
use std::sync::Arc;

use declarative_apply::{owner_selector_fn, ApplyError, Materializer};
use declarative_core::{parse, DeclarativeObject, ObjectKey, ObjectSet};
use declarative_kubehub::{MemoryServer, Verb};
use serde_json::json;

fn owner() -> DeclarativeObject {
    DeclarativeObject::from_json(json!({
        "apiVersion": "addons.example.org/v1alpha1",
        "kind": "Dashboard",
        "metadata": {"name": "dash", "namespace": "ops", "uid": "0b5f-uid"},
    }))
    .unwrap()
}

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("addons.example.org/dashboard".to_string(), "dash".to_string())])
}

fn configmap(name: &str) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n  namespace: ops\n  labels:\n    addons.example.org/dashboard: dash\ndata:\n  k: v\n",
        name
    )
}

fn secret(name: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {}\n  namespace: ops\n  labels:\n    addons.example.org/dashboard: dash\n",
        name
    )
}

fn set(docs: &[String]) -> ObjectSet {
    parse(&docs.join("---\n")).unwrap()
}

fn key(kind: &str, name: &str) -> ObjectKey {
    ObjectKey { group: String::new(), kind: kind.to_string(), namespace: Some("ops".to_string()), name: name.to_string() }
}

#[tokio::test]
async fn prune_removes_objects_dropped_from_the_manifest() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());

    let report = m.materialize(&owner(), &mut set(&[configmap("x"), secret("y")]), Some(&labels())).await.unwrap();
    assert_eq!(report.created, vec![key("ConfigMap", "x"), key("Secret", "y")]);

    // Secret left the manifest entirely; its kind is still remembered
    let report = m.materialize(&owner(), &mut set(&[configmap("x")]), Some(&labels())).await.unwrap();
    assert_eq!(report.pruned, vec![key("Secret", "y")]);
    assert_eq!(report.unchanged, vec![key("ConfigMap", "x")]);
    assert!(server.object(&key("ConfigMap", "x")).is_some());
    assert!(server.object(&key("Secret", "y")).is_none());
}

#[tokio::test]
async fn without_prune_dropped_objects_remain() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());
    m.materialize(&owner(), &mut set(&[configmap("x"), configmap("y")]), None).await.unwrap();
    m.materialize(&owner(), &mut set(&[configmap("x")]), None).await.unwrap();
    assert!(server.object(&key("ConfigMap", "y")).is_some());
    assert_eq!(server.count(Verb::Delete), 0);
}

#[tokio::test]
async fn prune_stays_inside_label_and_namespace_scope() {
    let server = Arc::new(MemoryServer::new());
    server
        .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "unlabelled", "namespace": "ops"}}))
        .unwrap();
    server
        .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {
            "name": "elsewhere", "namespace": "other", "labels": {"addons.example.org/dashboard": "dash"},
            "ownerReferences": [{"apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
                "name": "dash", "uid": "0b5f-uid", "controller": true}]}}))
        .unwrap();
    server
        .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {
            "name": "hand-made", "namespace": "other", "labels": {"addons.example.org/dashboard": "dash"}}}))
        .unwrap();
    server
        .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {
            "name": "sibling", "namespace": "ops", "labels": {"addons.example.org/dashboard": "other-dash"}}}))
        .unwrap();

    let m = Materializer::new(server.clone());
    let report = m.materialize(&owner(), &mut set(&[configmap("x")]), Some(&labels())).await.unwrap();
    assert!(report.pruned.is_empty());
    assert_eq!(server.keys().len(), 5);

    // preserve-namespace widens the scope to every namespace, but only for
    // objects this owner controls
    let m = Materializer::new(server.clone()).with_preserve_namespace(true);
    let report = m.materialize(&owner(), &mut set(&[configmap("x")]), Some(&labels())).await.unwrap();
    assert_eq!(
        report.pruned,
        vec![ObjectKey { group: String::new(), kind: "ConfigMap".into(), namespace: Some("other".into()), name: "elsewhere".into() }]
    );
}

#[tokio::test]
async fn owner_selection_failure_writes_nothing() {
    let server = Arc::new(MemoryServer::new());
    let selector = owner_selector_fn(|owner, object, _| {
        if object.name() == "y" {
            anyhow::bail!("no owner for {}", object.name());
        }
        Ok(owner.clone())
    });
    let m = Materializer::new(server.clone()).with_owner_selector(Arc::new(selector));
    let err = m.materialize(&owner(), &mut set(&[configmap("x"), configmap("y")]), Some(&labels())).await.unwrap_err();
    assert!(matches!(err, ApplyError::Owner { ref object, .. } if object.name == "y"), "{}", err);
    assert_eq!(server.count(Verb::Create), 0);
    assert_eq!(server.count(Verb::Update), 0);
    assert!(server.keys().is_empty());
}

#[tokio::test]
async fn apply_is_best_effort_and_reports_every_failure() {
    let server = Arc::new(MemoryServer::new());
    server.fail_on(Verb::Create, "b");
    let m = Materializer::new(server.clone());
    let err = m
        .materialize(&owner(), &mut set(&[configmap("a"), configmap("b"), configmap("c")]), Some(&labels()))
        .await
        .unwrap_err();
    let report = err.report().expect("report");
    assert_eq!(report.created, vec![key("ConfigMap", "a"), key("ConfigMap", "c")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].key, key("ConfigMap", "b"));
    assert!(report.prune_skipped);
    assert_eq!(server.count(Verb::List), 0);
}

#[tokio::test]
async fn prune_list_failure_deletes_nothing() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());
    m.materialize(&owner(), &mut set(&[configmap("x"), secret("y")]), Some(&labels())).await.unwrap();

    server.fail_on(Verb::List, "Secret");
    let err = m.materialize(&owner(), &mut set(&[configmap("z")]), Some(&labels())).await.unwrap_err();
    assert!(matches!(err, ApplyError::PruneList { ref kind, .. } if kind.kind == "Secret"), "{}", err);
    assert_eq!(server.count(Verb::Delete), 0);
    assert!(server.object(&key("ConfigMap", "x")).is_some());
}

#[tokio::test]
async fn applied_objects_carry_the_owner_reference() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());
    m.materialize(&owner(), &mut set(&[configmap("x")]), None).await.unwrap();
    let live = server.object(&key("ConfigMap", "x")).unwrap();
    assert_eq!(
        live["metadata"]["ownerReferences"],
        json!([{
            "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard", "name": "dash",
            "uid": "0b5f-uid", "controller": true, "blockOwnerDeletion": true
        }])
    );
}

#[tokio::test]
async fn changed_objects_are_updated() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());
    m.materialize(&owner(), &mut set(&[configmap("x")]), None).await.unwrap();
    let changed = configmap("x").replace("k: v", "k: w");
    let report = m.materialize(&owner(), &mut set(&[changed]), None).await.unwrap();
    assert_eq!(report.updated, vec![key("ConfigMap", "x")]);
    assert_eq!(server.object(&key("ConfigMap", "x")).unwrap()["data"]["k"], json!("w"));
}

#[tokio::test]
async fn empty_prune_labels_are_rejected() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone());
    let err = m.materialize(&owner(), &mut set(&[configmap("x")]), Some(&BTreeMap::new())).await.unwrap_err();
    assert!(matches!(err, ApplyError::UnscopedPrune));
    assert!(server.calls().is_empty());
}

fn owner_in(namespace: &str, uid: &str) -> DeclarativeObject {
    DeclarativeObject::from_json(json!({
        "apiVersion": "addons.example.org/v1alpha1",
        "kind": "Dashboard",
        "metadata": {"name": "dash", "namespace": namespace, "uid": uid},
    }))
    .unwrap()
}

fn configmap_in(namespace: &str, name: &str) -> String {
    configmap(name).replace("namespace: ops", &format!("namespace: {}", namespace))
}

fn key_in(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey { group: String::new(), kind: "ConfigMap".into(), namespace: Some(namespace.into()), name: name.into() }
}

#[tokio::test]
async fn same_named_owners_never_prune_each_other() {
    let server = Arc::new(MemoryServer::new());
    let m = Materializer::new(server.clone()).with_preserve_namespace(true);
    let a = owner_in("team-a", "uid-a");
    let b = owner_in("team-b", "uid-b");

    m.materialize(&a, &mut set(&[configmap_in("team-a", "a-cfg")]), Some(&labels())).await.unwrap();
    let report = m.materialize(&b, &mut set(&[configmap_in("team-b", "b-cfg")]), Some(&labels())).await.unwrap();
    assert!(report.pruned.is_empty(), "{:?}", report.pruned);
    assert!(server.object(&key_in("team-a", "a-cfg")).is_some());

    // each owner still prunes its own leftovers
    let report = m.materialize(&b, &mut set(&[configmap_in("team-b", "b-new")]), Some(&labels())).await.unwrap();
    assert_eq!(report.pruned, vec![key_in("team-b", "b-cfg")]);
    assert!(server.object(&key_in("team-a", "a-cfg")).is_some());
}
