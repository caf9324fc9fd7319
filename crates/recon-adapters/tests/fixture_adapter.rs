use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use recon_adapters::{AdapterError, FixtureAdapter, SourceAdapter};
use recon_core::{DateRange, FixtureConfig, Origin};
use tempfile::NamedTempFile;

fn january() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
        NaiveDate::from_ymd_opt(2026, 1, 31).expect("date"),
    )
    .expect("range")
}

fn adapter(path: &Path, origin: Origin) -> FixtureAdapter {
    FixtureAdapter::new(
        "fixture".to_string(),
        FixtureConfig {
            path: path.to_path_buf(),
            origin,
        },
    )
}

#[tokio::test]
async fn workspace_demo_fixtures_load() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let backend = adapter(&root.join("fixtures/acme/backend.json"), Origin::Backend)
        .fetch(&january())
        .await
        .expect("backend fixture");
    let analytics = adapter(&root.join("fixtures/acme/analytics.json"), Origin::Analytics)
        .fetch(&january())
        .await
        .expect("analytics fixture");
    assert_eq!(backend.len(), 10);
    assert_eq!(analytics.len(), 9);
    assert!(backend.iter().any(|r| r.id == "5109"));
}

#[tokio::test]
async fn records_outside_range_are_skipped() {
    let mut file = NamedTempFile::new().expect("tempfile");
    write!(
        file,
        r#"[
            {{"id": "1", "value": "10", "date": "2026-01-10"}},
            {{"id": "2", "value": "20", "date": "2025-12-31T23:59:00"}},
            {{"id": "3", "value": "30"}}
        ]"#
    )
    .expect("write");
    let records = adapter(file.path(), Origin::Backend)
        .fetch(&january())
        .await
        .expect("fetch");
    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "3"]);
}

#[tokio::test]
async fn non_list_fixture_is_a_fetch_failure() {
    let mut file = NamedTempFile::new().expect("tempfile");
    write!(file, r#"{{"orders": []}}"#).expect("write");
    let err = adapter(file.path(), Origin::Backend)
        .fetch(&january())
        .await
        .expect_err("object payload");
    assert!(matches!(err, AdapterError::Malformed(_)));

    let missing = adapter(Path::new("/nonexistent/orders.json"), Origin::Backend)
        .fetch(&january())
        .await
        .expect_err("missing file");
    assert!(matches!(missing, AdapterError::Fixture { .. }));
}
