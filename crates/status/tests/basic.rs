use declarative_core::{parse, CommonStatus, DeclarativeObject, ObjectKey};
use declarative_kubehub::{MemoryServer, Verb};
use declarative_status::{BasicStatus, Status};
use serde_json::json;

const MANIFEST: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata: {name: web, namespace: ops}
---
apiVersion: v1
kind: Service
metadata: {name: web, namespace: ops}
"#;

fn owner(status: serde_json::Value) -> DeclarativeObject {
    DeclarativeObject::from_json(json!({
        "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
        "metadata": {"name": "dash", "namespace": "ops"},
        "spec": {"version": "2.0.0"},
        "status": status,
    }))
    .unwrap()
}

fn deployment(available: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "ops"},
        "status": {"conditions": [{"type": "Available", "status": available}]}
    })
}

#[tokio::test]
async fn unavailable_deployment_keeps_the_previous_version() {
    let server = MemoryServer::new();
    server.insert(deployment("False")).unwrap();
    let objects = parse(MANIFEST).unwrap();
    let status = BasicStatus.compute(&server, &owner(json!({"version": "1.0.0"})), &objects).await.unwrap();
    assert!(!status.healthy);
    assert_eq!(status.errors, vec!["Deployment.apps ops/web not available"]);
    assert_eq!(status.phase.as_deref(), Some("Progressing"));
    assert_eq!(status.version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn missing_deployment_is_reported() {
    let server = MemoryServer::new();
    let status = BasicStatus.compute(&server, &owner(json!({})), &parse(MANIFEST).unwrap()).await.unwrap();
    assert_eq!(status.errors, vec!["Deployment.apps ops/web not found"]);
}

#[tokio::test]
async fn available_rollout_is_healthy_and_persisted_once() {
    let server = MemoryServer::new();
    server.insert(deployment("True")).unwrap();
    server
        .insert(json!({
            "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
            "metadata": {"name": "dash", "namespace": "ops"}
        }))
        .unwrap();
    let owner = owner(json!({}));
    let status = BasicStatus.compute(&server, &owner, &parse(MANIFEST).unwrap()).await.unwrap();
    assert_eq!(
        status,
        CommonStatus { healthy: true, errors: vec![], phase: Some("Ready".into()), version: Some("2.0.0".into()) }
    );

    BasicStatus.persist(&server, &owner, &status).await.unwrap();
    let key = ObjectKey {
        group: "addons.example.org".into(),
        kind: "Dashboard".into(),
        namespace: Some("ops".into()),
        name: "dash".into(),
    };
    let live = server.object(&key).unwrap();
    assert_eq!(live["status"]["healthy"], json!(true));
    assert_eq!(live["status"]["version"], json!("2.0.0"));

    // owner already carries this status: nothing to write
    let refreshed = DeclarativeObject::from_json(live).unwrap();
    BasicStatus.persist(&server, &refreshed, &status).await.unwrap();
    assert_eq!(server.count(Verb::PatchStatus), 1);
}
