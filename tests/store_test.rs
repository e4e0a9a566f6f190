//! Integration tests for the control store.

use std::collections::BTreeMap;

use batchq::error::Error;
use batchq::model::{FieldMap, ItemFilter, ItemKey, ItemOutcome, Schema};
use batchq::store::{ControlStore, ImportMode};
use proptest::prelude::*;
use serde_json::{Value, json};

async fn test_store() -> ControlStore {
    ControlStore::in_memory().await.unwrap()
}

fn schema() -> Schema {
    Schema::new("id")
        .business_fields(["city"])
        .result_fields(["population"])
}

fn rows(keys: &[i64]) -> Vec<FieldMap> {
    keys.iter()
        .map(|k| row(json!({"id": k, "city": format!("city-{k}")})))
        .collect()
}

fn row(value: Value) -> FieldMap {
    value.as_object().cloned().unwrap()
}

fn result(population: i64) -> FieldMap {
    row(json!({"population": population}))
}

#[tokio::test]
async fn health_check_passes() {
    let store = test_store().await;
    assert!(store.health_check().await.is_ok());
}

#[tokio::test]
async fn import_tags_rows_unprocessed() {
    let store = test_store().await;
    let summary = store
        .import_source("r", &schema(), &rows(&[3, 1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 3);
    assert!(!summary.existing);

    let item = store.get_item("r", &ItemKey::Int(2)).await.unwrap();
    assert!(!item.is_processed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.str_field("city"), Some("city-2"));
    assert!(item.field("id").is_none(), "key column is not a business field");
    assert!(item.results.is_empty());

    assert_eq!(store.runs().await.unwrap(), ["r"]);
    assert_eq!(store.run_schema("r").await.unwrap(), Some(schema()));
}

#[tokio::test]
async fn import_rejects_bad_rows_and_writes_nothing() {
    let store = test_store().await;

    let mut bad = rows(&[1, 2]);
    bad.push(row(json!({"city": "nowhere"})));
    let err = store
        .import_source("r", &schema(), &bad, ImportMode::CreateIfAbsent)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));
    assert!(!store.has_rows("r").await.unwrap());

    let duplicated = rows(&[1, 2, 1]);
    let err = store
        .import_source("r", &schema(), &duplicated, ImportMode::CreateIfAbsent)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(msg) if msg.contains("more than once")));

    let fractional = vec![row(json!({"id": 1.5, "city": "x"}))];
    assert!(
        store
            .import_source("r", &schema(), &fractional, ImportMode::CreateIfAbsent)
            .await
            .is_err()
    );
    assert!(!store.has_rows("r").await.unwrap());
}

#[tokio::test]
async fn create_if_absent_keeps_existing_run_untouched() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let summary = store
        .import_source("r", &schema(), &rows(&[1, 2, 3]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    assert!(summary.existing);
    assert_eq!(summary.inserted, 0);
    assert_eq!(store.statistics("r", 3).await.unwrap().total, 2);
}

#[tokio::test]
async fn skip_if_exists_adds_only_new_keys() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    store
        .write_back("r", &[ItemOutcome::success(ItemKey::Int(1), result(10))], 3)
        .await
        .unwrap();

    let summary = store
        .import_source("r", &schema(), &rows(&[1, 2, 3]), ImportMode::SkipIfExists)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.skipped, 2);

    let first = store.get_item("r", &ItemKey::Int(1)).await.unwrap();
    assert!(first.is_processed, "existing progress survives");
    assert_eq!(store.statistics("r", 3).await.unwrap().total, 3);
}

#[tokio::test]
async fn overwrite_resets_control_fields() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    store
        .write_back(
            "r",
            &[
                ItemOutcome::success(ItemKey::Int(1), result(10)),
                ItemOutcome::failure(ItemKey::Int(2), "timeout"),
            ],
            3,
        )
        .await
        .unwrap();

    let fresh = vec![row(json!({"id": 1, "city": "renamed"}))];
    let summary = store
        .import_source("r", &schema(), &fresh, ImportMode::Overwrite)
        .await
        .unwrap();
    assert_eq!(summary.removed, 2);
    assert_eq!(summary.inserted, 1);

    let item = store.get_item("r", &ItemKey::Int(1)).await.unwrap();
    assert!(!item.is_processed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.str_field("city"), Some("renamed"));
    assert!(matches!(
        store.get_item("r", &ItemKey::Int(2)).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn resume_with_incompatible_schema_is_rejected() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let other = Schema::new("id").result_fields(["area"]);
    let err = store
        .import_source("r", &other, &rows(&[1]), ImportMode::SkipIfExists)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));

    // Overwrite replaces the layout.
    assert!(
        store
            .import_source("r", &other, &rows(&[1]), ImportMode::Overwrite)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn runs_are_isolated() {
    let store = test_store().await;
    store
        .import_source("a", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    store
        .import_source("b", &schema(), &rows(&[1]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    store
        .write_back("a", &[ItemOutcome::success(ItemKey::Int(1), result(1))], 3)
        .await
        .unwrap();

    assert_eq!(store.statistics("a", 3).await.unwrap().processed, 1);
    assert_eq!(store.statistics("b", 3).await.unwrap().processed, 0);
}

#[tokio::test]
async fn selection_is_ordered_bounded_and_idempotent() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[5, 3, 1, 4, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let first = store.select_next_batch("r", 2, 3).await.unwrap();
    let again = store.select_next_batch("r", 2, 3).await.unwrap();
    assert_eq!(first.keys(), [ItemKey::Int(1), ItemKey::Int(2)]);
    assert_eq!(first, again);

    store
        .write_back("r", &[ItemOutcome::success(ItemKey::Int(1), result(1))], 3)
        .await
        .unwrap();
    let next = store.select_next_batch("r", 2, 3).await.unwrap();
    assert_eq!(next.keys(), [ItemKey::Int(2), ItemKey::Int(3)]);
}

#[tokio::test]
async fn text_keys_select_after_integer_keys() {
    let store = test_store().await;
    let source = [
        row(json!({"id": "SKU-010", "city": "Oslo"})),
        row(json!({"id": 5, "city": "Bonn"})),
        row(json!({"id": "SKU-002", "city": "Lyon"})),
        row(json!({"id": "17", "city": "Graz"})),
        row(json!({"id": "Apple", "city": "Cork"})),
    ];
    store
        .import_source("r", &schema(), &source, ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let sku = |s: &str| ItemKey::Text(s.to_string());
    let batch = store.select_next_batch("r", 10, 3).await.unwrap();
    assert_eq!(
        batch.keys(),
        [
            ItemKey::Int(5),
            ItemKey::Int(17),
            sku("Apple"),
            sku("SKU-002"),
            sku("SKU-010"),
        ]
    );

    store
        .write_back(
            "r",
            &[
                ItemOutcome::success(sku("SKU-002"), result(9)),
                ItemOutcome::failure(sku("SKU-010"), "timeout"),
            ],
            3,
        )
        .await
        .unwrap();

    let done = store.get_item("r", &sku("SKU-002")).await.unwrap();
    assert!(done.is_processed);
    assert_eq!(done.str_field("city"), Some("Lyon"));
    assert_eq!(store.get_item("r", &sku("SKU-010")).await.unwrap().retry_count, 1);
    assert!(matches!(
        store.get_item("r", &sku("SKU-999")).await,
        Err(Error::NotFound(_))
    ));

    let next = store.select_next_batch("r", 2, 3).await.unwrap();
    assert_eq!(next.keys(), [ItemKey::Int(5), ItemKey::Int(17)]);
    let all = store.items("r", ItemFilter::Pending, 3, None).await.unwrap();
    assert_eq!(all.last().map(|i| i.key.clone()), Some(sku("SKU-010")));
}

#[tokio::test]
async fn numeric_text_and_integer_keys_are_the_same_item() {
    let store = test_store().await;
    let source = [
        row(json!({"id": 7, "city": "Bonn"})),
        row(json!({"id": "7", "city": "Bonn"})),
    ];
    let err = store
        .import_source("r", &schema(), &source, ImportMode::CreateIfAbsent)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(msg) if msg.contains("more than once")));
}

#[tokio::test]
async fn retry_budget_is_recorded_with_the_run() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    assert_eq!(store.run_max_retries("r").await.unwrap(), None);
    assert_eq!(store.resolve_max_retries("r", None, 3).await.unwrap(), 3);

    store.set_max_retries("r", 1).await.unwrap();
    assert_eq!(store.run_max_retries("r").await.unwrap(), Some(1));
    assert_eq!(store.resolve_max_retries("r", None, 3).await.unwrap(), 1);
    assert_eq!(store.resolve_max_retries("r", Some(5), 3).await.unwrap(), 5);

    // Re-importing keeps the recorded budget.
    store
        .import_source("r", &schema(), &rows(&[1, 2, 3]), ImportMode::SkipIfExists)
        .await
        .unwrap();
    assert_eq!(store.run_max_retries("r").await.unwrap(), Some(1));

    assert!(matches!(
        store.set_max_retries("missing", 2).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(store.resolve_max_retries("missing", None, 3).await.unwrap(), 3);
}

#[tokio::test]
async fn failures_count_until_exhausted() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let failure = [ItemOutcome::failure(ItemKey::Int(1), "upstream 503")];
    let first = store.write_back("r", &failure, 1).await.unwrap();
    assert_eq!(first.failed, 1);
    assert!(first.exhausted.is_empty());
    assert_eq!(store.select_next_batch("r", 10, 1).await.unwrap().len(), 1);

    let second = store.write_back("r", &failure, 1).await.unwrap();
    assert_eq!(second.exhausted, [ItemKey::Int(1)]);
    assert!(store.select_next_batch("r", 10, 1).await.unwrap().is_empty());

    let item = store.get_item("r", &ItemKey::Int(1)).await.unwrap();
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.last_error.as_deref(), Some("upstream 503"));
    assert_eq!(item.status(1), ItemFilter::Exhausted);

    let stats = store.statistics("r", 1).await.unwrap();
    assert_eq!((stats.pending, stats.exhausted), (0, 1));
    assert!(stats.is_settled());
}

#[tokio::test]
async fn duplicate_write_back_is_a_no_op() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();

    let outcome = [ItemOutcome::success(ItemKey::Int(1), result(7))];
    let first = store.write_back("r", &outcome, 3).await.unwrap();
    let second = store.write_back("r", &outcome, 3).await.unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 1);

    // A late failure cannot undo a success.
    let late = store
        .write_back("r", &[ItemOutcome::failure(ItemKey::Int(1), "late")], 3)
        .await
        .unwrap();
    assert_eq!(late.skipped, 1);
    let item = store.get_item("r", &ItemKey::Int(1)).await.unwrap();
    assert!(item.is_processed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.results["population"], json!(7));
}

#[tokio::test]
async fn items_filter_and_limit() {
    let store = test_store().await;
    store
        .import_source("r", &schema(), &rows(&[1, 2, 3, 4]), ImportMode::CreateIfAbsent)
        .await
        .unwrap();
    store
        .write_back(
            "r",
            &[
                ItemOutcome::success(ItemKey::Int(1), result(1)),
                ItemOutcome::failure(ItemKey::Int(2), "x"),
            ],
            0,
        )
        .await
        .unwrap();

    let keys = |items: Vec<batchq::model::WorkItem>| items.iter().map(|i| i.key.as_int().unwrap()).collect::<Vec<_>>();
    assert_eq!(keys(store.items("r", ItemFilter::All, 0, None).await.unwrap()), [1, 2, 3, 4]);
    assert_eq!(keys(store.items("r", ItemFilter::Processed, 0, None).await.unwrap()), [1]);
    assert_eq!(keys(store.items("r", ItemFilter::Exhausted, 0, None).await.unwrap()), [2]);
    assert_eq!(keys(store.items("r", ItemFilter::Pending, 0, None).await.unwrap()), [3, 4]);
    assert_eq!(keys(store.items("r", ItemFilter::All, 0, Some(2)).await.unwrap()), [1, 2]);

    let stats = store.statistics("r", 0).await.unwrap();
    assert_eq!(stats.total, stats.processed + stats.pending + stats.exhausted);
}

#[tokio::test]
async fn progress_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.db");

    {
        let store = ControlStore::open(&path).await.unwrap();
        store
            .import_source("r", &schema(), &rows(&[1, 2]), ImportMode::CreateIfAbsent)
            .await
            .unwrap();
        store
            .write_back("r", &[ItemOutcome::success(ItemKey::Int(1), result(42))], 3)
            .await
            .unwrap();
        store.close().await;
    }

    let store = ControlStore::open(&path).await.unwrap();
    let item = store.get_item("r", &ItemKey::Int(1)).await.unwrap();
    assert!(item.is_processed);
    assert_eq!(item.results["population"], json!(42));
    assert_eq!(
        store.select_next_batch("r", 10, 3).await.unwrap().keys(),
        [ItemKey::Int(2)]
    );
}

/// Unprocessed items with retries left, in key order.
fn eligible(model: &BTreeMap<i64, (bool, u32)>, max_retries: u32, limit: usize) -> Vec<ItemKey> {
    model
        .iter()
        .filter(|(_, (processed, retries))| !processed && *retries <= max_retries)
        .map(|(key, _)| ItemKey::Int(*key))
        .take(limit)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn selection_follows_write_backs(
        keys in proptest::collection::btree_set(-50i64..50, 1..16),
        batch_size in 1usize..5,
        max_retries in 0u32..3,
        outcomes in proptest::collection::vec(any::<bool>(), 0..64),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = test_store().await;
            let keys: Vec<i64> = keys.into_iter().collect();
            store
                .import_source("r", &schema(), &rows(&keys), ImportMode::CreateIfAbsent)
                .await
                .unwrap();

            let mut model: BTreeMap<i64, (bool, u32)> =
                keys.iter().map(|k| (*k, (false, 0))).collect();
            // Once the generated outcomes run out every item succeeds.
            let mut outcomes = outcomes.into_iter();

            loop {
                let batch = store.select_next_batch("r", batch_size, max_retries).await.unwrap();
                let again = store.select_next_batch("r", batch_size, max_retries).await.unwrap();
                prop_assert_eq!(&batch, &again);
                prop_assert!(batch.len() <= batch_size);
                prop_assert!(batch.keys().windows(2).all(|w| w[0] < w[1]));
                prop_assert!(batch.iter().all(|item| !item.is_processed));
                prop_assert_eq!(batch.keys(), eligible(&model, max_retries, batch_size));
                if batch.is_empty() {
                    break;
                }

                let written: Vec<ItemOutcome> = batch
                    .iter()
                    .map(|item| {
                        let key = item.key.as_int().unwrap();
                        let entry = model.get_mut(&key).unwrap();
                        if outcomes.next().unwrap_or(true) {
                            entry.0 = true;
                            ItemOutcome::success(item.key.clone(), result(key))
                        } else {
                            entry.1 += 1;
                            ItemOutcome::failure(item.key.clone(), "flaky")
                        }
                    })
                    .collect();
                store.write_back("r", &written, max_retries).await.unwrap();
            }

            let stats = store.statistics("r", max_retries).await.unwrap();
            let processed = model.values().filter(|(done, _)| *done).count() as u64;
            prop_assert_eq!(stats.total, keys.len() as u64);
            prop_assert_eq!(stats.processed, processed);
            prop_assert_eq!(stats.pending, 0);
            prop_assert_eq!(stats.exhausted, keys.len() as u64 - processed);
            Ok(())
        })?;
    }
}
