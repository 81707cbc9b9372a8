/// Write path through the service against the in-memory store
use maddash::error::{Error, StoredRecord};
use maddash::histogram::Num;
use maddash::implementations::InMemoryStore;
use maddash::service::HistogramService;
use maddash::traits::{CollectionRef, DocumentStore, StoreError};
use serde_json::{json, Value};
use std::sync::Arc;

fn histogram_x() -> Value {
    json!({
        "name": "X",
        "xmax": 10.0,
        "xmin": 0.0,
        "overflow": 1,
        "underflow": 2,
        "nan_count": 0,
        "bin_values": [1, 2, 3, 4],
        "expression": "energy"
    })
}

fn setup() -> (Arc<InMemoryStore>, HistogramService, CollectionRef) {
    let store = Arc::new(InMemoryStore::new());
    let service = HistogramService::new(store.clone());
    (store, service, CollectionRef::new("simprod_histos", "run_1"))
}

#[tokio::test]
async fn test_conflict_scenario() {
    let (_, service, scope) = setup();

    let first = service
        .post_histogram(&scope, &histogram_x(), false)
        .await
        .unwrap();
    assert!(!first.updated);
    let stored_before = service.find_histogram(&scope, "X").await.unwrap();

    let mut different = histogram_x();
    different["bin_values"] = json!([100, 100, 100, 100]);
    match service.post_histogram(&scope, &different, false).await {
        Err(Error::Conflict { name, existing }) => {
            assert_eq!(name, "X");
            assert_eq!(*existing, StoredRecord::Histogram(stored_before.clone()));
        }
        other => panic!("expected conflict, got {:?}", other.map(|o| o.updated)),
    }

    let stored_after = service.find_histogram(&scope, "X").await.unwrap();
    assert_eq!(stored_after, stored_before);
}

#[tokio::test]
async fn test_update_accumulates_and_keeps_extras() {
    let (_, service, scope) = setup();
    service
        .post_histogram(&scope, &histogram_x(), false)
        .await
        .unwrap();

    let mut delta = histogram_x();
    delta["expression"] = json!("energy / GeV");
    let merged = service.post_histogram(&scope, &delta, true).await.unwrap();
    assert!(merged.updated);

    let stored = service.find_histogram(&scope, "X").await.unwrap();
    assert_eq!(
        stored.bin_values(),
        &[Num::Int(2), Num::Int(4), Num::Int(6), Num::Int(8)]
    );
    assert_eq!(stored.overflow(), 2);
    assert_eq!(stored.underflow(), 4);
    assert_eq!(stored.history().len(), 2);
    assert_eq!(stored.extra()["expression"], json!("energy / GeV"));
    // the axis keeps its float spelling
    assert_eq!(stored.to_dict(&[])["xmax"], json!(10.0));
}

#[tokio::test]
async fn test_validation_names_field() {
    let (store, service, scope) = setup();

    let mut missing = histogram_x();
    missing.as_object_mut().unwrap().remove("underflow");
    match service.post_histogram(&scope, &missing, false).await {
        Err(Error::Validation(e)) => assert_eq!(e.field(), Some("underflow")),
        other => panic!("expected validation error, got {:?}", other.map(|o| o.updated)),
    }

    let mut with_history = histogram_x();
    with_history["history"] = json!([1.0]);
    assert!(matches!(
        service.post_histogram(&scope, &with_history, false).await,
        Err(Error::Validation(_))
    ));

    let mut reserved = histogram_x();
    reserved["name"] = json!("filelist");
    assert!(matches!(
        service.post_histogram(&scope, &reserved, false).await,
        Err(Error::Validation(_))
    ));

    // nothing was written
    assert_eq!(store.document_count().await, 0);
}

#[tokio::test]
async fn test_incompatible_update_rejected() {
    let (_, service, scope) = setup();
    service
        .post_histogram(&scope, &histogram_x(), false)
        .await
        .unwrap();

    let mut rebinned = histogram_x();
    rebinned["xmax"] = json!(20.0);
    assert!(matches!(
        service.post_histogram(&scope, &rebinned, true).await,
        Err(Error::Incompatible { .. })
    ));
}

#[tokio::test]
async fn test_filelist_idempotent_content() {
    let (_, service, scope) = setup();

    service
        .post_files(&scope, &json!(["a.i3", "b.i3"]), false)
        .await
        .unwrap();
    let first = service
        .post_files(&scope, &json!(["b.i3", "c.i3"]), true)
        .await
        .unwrap();
    let second = service
        .post_files(&scope, &json!(["b.i3", "c.i3"]), true)
        .await
        .unwrap();

    assert_eq!(first.record.files(), vec!["a.i3", "b.i3", "c.i3"]);
    assert_eq!(second.record.files(), first.record.files());
    assert_eq!(first.record.history().len() + 1, second.record.history().len());

    let conflict = service.post_files(&scope, &json!(["d.i3"]), false).await;
    match conflict {
        Err(Error::Conflict { existing, .. }) => match *existing {
            StoredRecord::FileList(list) => assert_eq!(list.len(), 3),
            other => panic!("unexpected record {:?}", other),
        },
        other => panic!("expected conflict, got {:?}", other.map(|o| o.updated)),
    }

    assert!(matches!(
        service.post_files(&scope, &json!("a.i3"), false).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_stale_write_rejected() {
    let (store, service, scope) = setup();
    service
        .post_histogram(&scope, &histogram_x(), false)
        .await
        .unwrap();

    // a second writer reads, then the first writer updates
    let observed = store.find_by_name(&scope, "X").await.unwrap().unwrap();
    service
        .post_histogram(&scope, &histogram_x(), true)
        .await
        .unwrap();

    let err = store
        .upsert(&scope, "X", observed.document, Some(observed.revision))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RevisionMismatch { .. }));

    let stored = service.find_histogram(&scope, "X").await.unwrap();
    assert_eq!(stored.bin_values()[0], Num::Int(2));
}

#[tokio::test]
async fn test_concurrent_updates_never_lose_counts() {
    let (_, service, scope) = setup();
    service
        .post_histogram(&scope, &histogram_x(), false)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let scope = scope.clone();
        tasks.push(tokio::spawn(async move {
            service.post_histogram(&scope, &histogram_x(), true).await
        }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => applied += 1,
            Err(Error::Stale { .. }) => {}
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    let stored = service.find_histogram(&scope, "X").await.unwrap();
    assert_eq!(stored.bin_values()[0], Num::Int(1 + applied));
    assert_eq!(stored.history().len() as i64, 1 + applied);
}

#[tokio::test]
async fn test_not_found() {
    let (_, service, scope) = setup();
    match service.find_histogram(&scope, "nope").await {
        Err(e @ Error::NotFound { .. }) => assert_eq!(e.to_string(), "histogram not found (nope)"),
        other => panic!("expected not found, got {:?}", other),
    }
}
