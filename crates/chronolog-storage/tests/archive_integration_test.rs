//! Integration tests for the file archive: write through the pool, read back
//! through the backend trait.

use std::sync::Arc;
use std::time::Duration;

use chronolog_core::{
    DeviceSchema, Epochstamp, PropertyDescriptor, PropertyIndexRecord, Timestamp, Value, ValueType,
};
use chronolog_storage::{
    ArchiveBackend, ArchiveConfig, ArchiveLayout, DeviceWriter, Error, FileBackend,
    HistoryQuery, HistoryReader, IndexBuilderService, PropertyRegistry, PropertyUpdate,
};
use tempfile::TempDir;

fn sensor_schema() -> DeviceSchema {
    DeviceSchema::new("Sensor")
        .with_property("temp", PropertyDescriptor::new(ValueType::Double))
        .with_property("label", PropertyDescriptor::new(ValueType::String))
        .with_property("raw", PropertyDescriptor::not_archived(ValueType::Int32))
}

fn temp(secs: f64, value: f64) -> PropertyUpdate {
    PropertyUpdate::new("temp", Timestamp::from_secs(secs), Value::Double(value))
}

async fn logging_backend(dir: &TempDir, device: &str) -> FileBackend {
    let backend = FileBackend::new(ArchiveConfig::with_directory(dir.path()));
    let pool = backend.pool();
    pool.start_logging(device).await.unwrap();
    pool.update_schema(device, sensor_schema(), Timestamp::from_secs(1.0))
        .await
        .unwrap();
    pool.complete(device, vec![], "op").await.unwrap();
    backend
}

#[tokio::test]
async fn test_history_after_index_build() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "deviceA").await;
    for (secs, value) in [(100.0, 1.0), (200.0, 2.0), (300.0, 3.0)] {
        backend
            .append_change("deviceA", vec![temp(secs, value)], "op")
            .await
            .unwrap();
    }

    let builder = Arc::clone(backend.reader().builder());
    let backend: Arc<dyn ArchiveBackend> = Arc::new(backend);
    let query = HistoryQuery::between(Epochstamp::from_f64(100.0), Epochstamp::from_f64(300.0));

    let first = backend.get_history("deviceA", "temp", query.clone()).await;
    assert!(matches!(first, Err(Error::NotYetIndexed { .. })));

    builder.wait_idle().await;
    let points = backend.get_history("deviceA", "temp", query).await.unwrap();

    let got: Vec<(u64, Value)> = points
        .iter()
        .map(|p| (p.timestamp.epoch.seconds, p.value.clone()))
        .collect();
    assert_eq!(
        got,
        vec![
            (100, Value::Double(1.0)),
            (200, Value::Double(2.0)),
            (300, Value::Double(3.0)),
        ]
    );
}

#[tokio::test]
async fn test_history_spans_segment_started_by_registration() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "dev").await;
    for secs in [100.0, 200.0, 300.0] {
        backend.append_change("dev", vec![temp(secs, secs)], "op").await.unwrap();
    }

    let query = HistoryQuery::between(Epochstamp::from_f64(100.0), Epochstamp::from_f64(400.0));
    assert!(matches!(
        backend.get_history("dev", "temp", query.clone()).await,
        Err(Error::NotYetIndexed { .. })
    ));
    backend.reader().builder().wait_idle().await;

    // The writer notices the registry change and indexes the next segment itself.
    backend.append_change("dev", vec![temp(400.0, 400.0)], "op").await.unwrap();

    let layout = ArchiveLayout::new(dir.path());
    assert!(layout.segment("dev", 1).exists());
    assert!(layout.property_index("dev", "temp", 1).exists());

    let points = backend.get_history("dev", "temp", query).await.unwrap();
    let stamps: Vec<u64> = points.iter().map(|p| p.timestamp.epoch.seconds).collect();
    assert_eq!(stamps, vec![100, 200, 300, 400]);
}

#[tokio::test]
async fn test_history_skips_record_pointing_at_other_property() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "dev").await;
    let label = PropertyUpdate::new("label", Timestamp::from_secs(150.0), Value::String("x".to_string()));
    backend.append_change("dev", vec![temp(100.0, 1.0)], "op").await.unwrap();
    backend.append_change("dev", vec![label], "op").await.unwrap();
    backend.append_change("dev", vec![temp(200.0, 2.0)], "op").await.unwrap();
    backend.append_change("dev", vec![temp(300.0, 3.0)], "op").await.unwrap();

    assert!(backend
        .get_history("dev", "temp", HistoryQuery::default())
        .await
        .is_err());
    backend.reader().builder().wait_idle().await;

    // Point the record of t=200 at the label line.
    let layout = ArchiveLayout::new(dir.path());
    let content = std::fs::read_to_string(layout.segment("dev", 0)).unwrap();
    let label_offset = content.lines().next().unwrap().len() as u64 + 1;
    let index_path = layout.property_index("dev", "temp", 0);
    let mut bytes = std::fs::read(&index_path).unwrap();
    assert_eq!(bytes.len(), 3 * PropertyIndexRecord::SIZE);
    bytes[PropertyIndexRecord::SIZE + 16..PropertyIndexRecord::SIZE + 24]
        .copy_from_slice(&label_offset.to_le_bytes());
    std::fs::write(&index_path, &bytes).unwrap();

    let points = backend
        .get_history("dev", "temp", HistoryQuery::default())
        .await
        .unwrap();
    let got: Vec<(u64, Value)> = points
        .iter()
        .map(|p| (p.timestamp.epoch.seconds, p.value.clone()))
        .collect();
    assert_eq!(got, vec![(100, Value::Double(1.0)), (300, Value::Double(3.0))]);
}

#[tokio::test]
async fn test_config_at_after_logout() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "dev").await;
    let label = |secs: f64, text: &str| {
        PropertyUpdate::new("label", Timestamp::from_secs(secs), Value::String(text.to_string()))
    };
    backend
        .append_change("dev", vec![temp(50.0, 1.0), label(50.0, "first\nline")], "op")
        .await
        .unwrap();
    backend.append_change("dev", vec![temp(200.0, 2.0)], "op").await.unwrap();
    backend
        .append_change(
            "dev",
            vec![
                temp(500.0, 5.0),
                PropertyUpdate::new("raw", Timestamp::from_secs(600.0), Value::Int32(7)),
            ],
            "op",
        )
        .await
        .unwrap();
    backend.pool().stop_logging("dev").await.unwrap();

    let at = backend
        .get_config_at("dev", Epochstamp::from_f64(1000.0))
        .await
        .unwrap();
    assert!(!at.was_online);
    assert_eq!(at.config_timestamp.seconds, 500);
    assert_eq!(at.configuration.value("temp"), Some(&Value::Double(5.0)));
    assert_eq!(
        at.configuration.value("label"),
        Some(&Value::String("first\nline".to_string()))
    );
    assert!(at.configuration.get("raw").is_none());
    assert_eq!(at.schema, sensor_schema());

    let during = backend
        .get_config_at("dev", Epochstamp::from_f64(300.0))
        .await
        .unwrap();
    assert!(during.was_online);
    assert_eq!(during.config_timestamp.seconds, 200);
    assert_eq!(during.configuration.value("temp"), Some(&Value::Double(2.0)));
}

#[tokio::test]
async fn test_thinned_history_keeps_segment_starts() {
    let dir = TempDir::new().unwrap();
    let config = ArchiveConfig {
        max_segment_size: 600,
        ..ArchiveConfig::with_directory(dir.path())
    };
    let layout = ArchiveLayout::new(dir.path());
    layout.create_device_dirs("dev").unwrap();
    PropertyRegistry::open(layout.registry("dev"))
        .unwrap()
        .register("temp")
        .unwrap();

    let mut writer = DeviceWriter::new("dev", &config);
    writer.start().unwrap();
    writer.update_schema(sensor_schema(), Timestamp::from_secs(0.5)).unwrap();
    writer.complete(&[], "op").unwrap();
    for i in 1..=200 {
        writer.append_batch(&[temp(i as f64, i as f64)], "op").unwrap();
    }
    writer.stop().unwrap();

    let segments = chronolog_storage::segment::list_segments(&layout, "dev").unwrap();
    assert!(segments.len() > 5);

    let builder = IndexBuilderService::start(layout.clone(), &config);
    let reader = HistoryReader::new(layout.clone(), builder);

    let all = reader
        .property_history("dev", "temp", &HistoryQuery::default())
        .unwrap();
    assert_eq!(all.len(), 200);

    let max_points = 15;
    let thinned = reader
        .property_history("dev", "temp", &HistoryQuery::default().with_max_points(max_points))
        .unwrap();
    assert!(thinned.len() <= max_points + segments.len());
    assert!(thinned.len() >= max_points);
    assert_eq!(thinned[0].timestamp.epoch.seconds, 1);
    assert!(thinned
        .windows(2)
        .all(|pair| pair[0].timestamp < pair[1].timestamp));
}

#[tokio::test]
async fn test_background_flush_picks_up_registry_change() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "dev").await;
    backend.append_change("dev", vec![temp(10.0, 1.0)], "op").await.unwrap();
    let flusher = Arc::clone(backend.pool()).start_background_flush(Duration::from_millis(10));

    let layout = ArchiveLayout::new(dir.path());
    PropertyRegistry::open(layout.registry("dev"))
        .unwrap()
        .register("temp")
        .unwrap();

    // No further change arrives; the flush alone rebuilds the closed segment.
    let index = layout.property_index("dev", "temp", 0);
    let mut indexed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if std::fs::metadata(&index).map(|m| m.len() == 32).unwrap_or(false) {
            indexed = true;
            break;
        }
    }
    flusher.abort();
    assert!(indexed);

    backend.shutdown().await.unwrap();
    assert_eq!(backend.pool().writer_count().await, 0);
}

#[tokio::test]
async fn test_query_errors() {
    let dir = TempDir::new().unwrap();
    let backend = logging_backend(&dir, "dev").await;

    assert!(matches!(
        backend.append_change("other", vec![temp(1.0, 1.0)], "op").await,
        Err(Error::NotLogging(_))
    ));
    assert!(matches!(
        backend.get_history("other", "temp", HistoryQuery::default()).await,
        Err(Error::MissingArchive { .. })
    ));
    assert!(matches!(
        backend.get_config_at("dev", Epochstamp::from_f64(0.1)).await,
        Err(Error::NoSchema { .. })
    ));
    assert!(HistoryQuery::from_iso(Some("not a time"), None, 0).is_err());
}
