//! Session persistence: collection through the engine, on-disk layout,
//! corruption handling and comparison

use byteorder::{LittleEndian, ReadBytesExt};
use probeweave::clock::ManualClock;
use probeweave::config::EngineConfig;
use probeweave::registry::TargetDescriptor;
use probeweave::session::{
    self, CollectionConfig, CollectionStatus, DeltaClass, DeltaReport, SessionHeader,
    SessionStore, CORRUPT_MAGIC, MAGIC,
};
use probeweave::Engine;
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine_in(dir: &TempDir) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let config = EngineConfig {
        session_dir: dir.path().to_path_buf(),
        ..EngineConfig::compact()
    };
    (Engine::with_clock(config, clock.clone()), clock)
}

#[test]
fn test_saved_file_layout_is_little_endian_and_interleaved() {
    let dir = TempDir::new().unwrap();
    let (engine, clock) = engine_in(&dir);
    let site = engine
        .weaver()
        .weave(TargetDescriptor::<()>::parse("Pawn.Tick"))
        .unwrap();

    let handle = engine
        .start_collection(site.slot(), &CollectionConfig::default())
        .unwrap();
    for calls in 1..=3u64 {
        for _ in 0..calls {
            site.call(|| clock.advance(Duration::from_millis(1)));
        }
        engine.end_cycle();
    }
    assert_eq!(
        handle.status(),
        CollectionStatus::Collecting {
            entries: 3,
            target: 2000
        }
    );

    let path = engine.save_session(&handle).unwrap();
    assert_eq!(path.file_name().unwrap(), "Pawn.Tick-0.data");

    let bytes = fs::read(&path).unwrap();
    let mut cursor = Cursor::new(&bytes);
    assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), MAGIC);
    assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 1);
    // "Pawn.Tick" with a one-byte length prefix, then " "
    assert_eq!(cursor.read_u8().unwrap(), 9);
    cursor.set_position(cursor.position() + 9);
    assert_eq!(cursor.read_u8().unwrap(), 1);
    assert_eq!(cursor.read_u8().unwrap(), b' ');
    assert_eq!(cursor.read_u8().unwrap(), 0);
    assert_eq!(cursor.read_u8().unwrap(), 0);
    assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 3);
    assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 2000);
    for calls in 1..=3 {
        assert_eq!(cursor.read_f64::<LittleEndian>().unwrap(), f64::from(calls));
        assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), calls);
    }
    assert_eq!(cursor.position() as usize, bytes.len());
}

#[test]
fn test_entry_per_call_collection_round_trips() {
    let dir = TempDir::new().unwrap();
    let (engine, clock) = engine_in(&dir);
    let site = engine
        .weaver()
        .weave(TargetDescriptor::<()>::parse("Path.Find"))
        .unwrap();

    let config = CollectionConfig {
        target_entries: 50,
        entry_per_call: true,
        custom_name: Some("per call".to_string()),
        ..CollectionConfig::default()
    };
    let handle = engine.start_collection(site.slot(), &config).unwrap();
    while !handle.is_complete() {
        for _ in 0..4 {
            site.call(|| clock.advance(Duration::from_millis(2)));
        }
        engine.end_cycle();
    }

    let path = engine.save_session(&handle).unwrap();
    let loaded = engine.load_session(&path).unwrap();
    assert_eq!(loaded.len(), 50);
    assert!(loaded.calls.is_none());
    assert!(loaded.durations.iter().all(|d| *d == 2.0));
    assert_eq!(loaded.header.display_name(), "per call");
}

#[test]
fn test_corrupt_header_reports_sentinel() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Broken-0.data");
    let mut bytes = 0i32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 32]);
    fs::write(&path, &bytes).unwrap();

    let store = SessionStore::new(dir.path());
    let header = store.read_header(&path);
    assert_eq!(header.magic, CORRUPT_MAGIC);
    assert!(!header.is_valid());

    let headers = store.headers_for("Broken").unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].1, SessionHeader::corrupt());
    assert!(matches!(
        store.load(&path),
        Err(session::SessionError::CorruptFile { found: 0, .. })
    ));
}

#[test]
fn test_truncated_body_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let (engine, clock) = engine_in(&dir);
    let site = engine
        .weaver()
        .weave(TargetDescriptor::<()>::parse("Foo.Bar"))
        .unwrap();
    let handle = engine
        .start_collection(site.slot(), &CollectionConfig::default())
        .unwrap();
    for _ in 0..4 {
        site.call(|| clock.advance(Duration::from_millis(1)));
        engine.end_cycle();
    }
    let path = engine.save_session(&handle).unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

    assert!(engine.store().read_header(&path).is_valid());
    assert!(matches!(
        engine.load_session(&path),
        Err(session::SessionError::Io(_))
    ));
}

#[test]
fn test_comparison_flags_regression() {
    let dir = TempDir::new().unwrap();
    let (engine, clock) = engine_in(&dir);
    let site = engine
        .weaver()
        .weave(TargetDescriptor::<()>::parse("Map.Render"))
        .unwrap();

    let collect = |millis: u64| {
        let config = CollectionConfig {
            target_entries: 50,
            ..CollectionConfig::default()
        };
        let handle = engine.start_collection(site.slot(), &config).unwrap();
        while !handle.is_complete() {
            site.call(|| clock.advance(Duration::from_millis(millis)));
            engine.end_cycle();
        }
        engine.save_session(&handle).unwrap()
    };
    let before = collect(2);
    let after = collect(3);

    let left = engine.load_session(&before).unwrap();
    let right = engine.load_session(&after).unwrap();
    let report: DeltaReport = engine.compare_sessions(&left, &right);

    assert_eq!(report.rows.len(), 10);
    let entries = report.row("Entries").unwrap();
    assert_eq!(entries.class, DeltaClass::Neutral);
    let calls = report.row("Total Calls").unwrap();
    assert_eq!(calls.class, DeltaClass::Neutral);
    let time = report.row("Avg Time/Call").unwrap();
    assert_eq!(time.class, DeltaClass::Regression);
    assert!((time.delta_percent - 50.0).abs() < 1e-9);

    let text = report.to_report_string();
    assert!(text.contains("REGRESSED"));
    assert!(text.contains("Map.Render"));
}
