use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use declarative_core::DeclarativeObject;
use declarative_transform::{
    operation_fn, transform_fn, AddLabels, ImageRegistry, ManagedApplication, PinNamespace, Pipeline, SourceLabels,
    TransformError,
};
use serde_json::json;

const MANIFEST: &str = r#"
apiVersion: app.k8s.io/v1beta1
kind: Application
metadata:
  name: guestbook
spec:
  descriptor: {type: guestbook}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: frontend
  labels: {tier: frontend}
spec:
  template:
    spec:
      containers:
        - name: php-redis
          image: gcr.io/google-samples/gb-frontend:v4
---
apiVersion: v1
kind: Service
metadata:
  name: frontend
  namespace: somewhere-else
"#;

fn owner() -> DeclarativeObject {
    DeclarativeObject::from_json(json!({
        "apiVersion": "addons.example.org/v1alpha1",
        "kind": "Guestbook",
        "metadata": {"name": "guestbook", "namespace": "demo"},
        "spec": {"version": "0.2.0"},
    }))
    .unwrap()
}

fn full_pipeline() -> Pipeline {
    Pipeline::new()
        .with_operation(operation_fn(|_, text| Ok(text.replace("gb-frontend:v4", "gb-frontend:v5"))))
        .with_transform(PinNamespace)
        .with_transform(AddLabels::from_maker(Arc::new(SourceLabels)))
        .with_transform(ManagedApplication::new(Arc::new(SourceLabels)))
        .with_transform(ImageRegistry::new("registry.example.com", "regcred"))
}

#[test]
fn running_twice_yields_identical_objects() {
    let pipeline = full_pipeline();
    let first = pipeline.run(&owner(), MANIFEST.to_string()).unwrap();
    let mut second = first.clone();
    pipeline.transform(&owner(), &mut second).unwrap();
    assert_eq!(first, second);

    let rerun = pipeline.run(&owner(), MANIFEST.to_string()).unwrap();
    assert_eq!(first, rerun);
}

#[test]
fn every_stage_contributes() {
    let set = full_pipeline().run(&owner(), MANIFEST.to_string()).unwrap();
    assert!(set.iter().all(|o| o.namespace() == Some("demo")));
    assert!(set.iter().all(|o| o.labels().get("addons.example.org/guestbook").map(String::as_str) == Some("guestbook")));

    let deploy = &set.items[1];
    assert_eq!(deploy.labels().get("tier").map(String::as_str), Some("frontend"));
    assert_eq!(
        deploy.nested(&["spec", "template", "spec", "containers"]),
        Some(&json!([{"name": "php-redis", "image": "registry.example.com/gb-frontend:v5"}]))
    );

    let app = &set.items[0];
    assert_eq!(
        app.nested(&["spec", "selector", "matchLabels"]),
        Some(&json!({"addons.example.org/guestbook": "guestbook"}))
    );
    assert_eq!(app.nested_str(&["spec", "descriptor", "version"]), Some("0.2.0"));
    assert_eq!(app.nested_str(&["spec", "assemblyPhase"]), Some("Pending"));
}

#[test]
fn first_failing_transform_stops_the_rest() {
    let later = Arc::new(AtomicUsize::new(0));
    let seen = later.clone();
    let pipeline = Pipeline::new()
        .with_transform(PinNamespace)
        .with_transform(transform_fn("explode", |_, _| Err(anyhow::anyhow!("boom"))))
        .with_transform(transform_fn("count", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    match pipeline.run(&owner(), MANIFEST.to_string()) {
        Err(TransformError::Transform { name, source }) => {
            assert_eq!(name, "explode");
            assert_eq!(source.to_string(), "boom");
        }
        other => panic!("unexpected result: {:?}", other.map(|s| s.len())),
    }
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[test]
fn operation_and_parse_failures_are_distinguished() {
    let failing = Pipeline::new().with_operation(operation_fn(|_, _| Err(anyhow::anyhow!("template missing"))));
    assert!(matches!(
        failing.run(&owner(), MANIFEST.to_string()),
        Err(TransformError::Operation { index: 0, .. })
    ));

    let garbage = Pipeline::new().run(&owner(), "kind: [unterminated".to_string());
    assert!(matches!(garbage, Err(TransformError::Parse(_))));
}

#[test]
fn transforms_are_listed_in_registration_order() {
    assert_eq!(
        full_pipeline().transform_names(),
        vec!["pin-namespace", "add-labels", "managed-application", "image-registry"]
    );
}
