use super::store::{load_session, read_header_at};
use super::*;
use proptest::prelude::*;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;

fn sample_session(entry_per_call: bool, only_entries_with_values: bool) -> Session {
    let durations = vec![0.25, 1.5, 3.125, 0.0, 7.75];
    let calls = (!entry_per_call).then(|| vec![1, 3, 2, 0, 9]);
    Session {
        header: SessionHeader {
            custom_label: "after fix".to_string(),
            entry_per_call,
            only_entries_with_values,
            entries: durations.len() as i32,
            target_entries: 50,
            ..SessionHeader::new("Pawn.Tick")
        },
        durations,
        calls,
    }
}

fn encode(session: &Session) -> Vec<u8> {
    let mut buf = Vec::new();
    write_session(&mut buf, session).unwrap();
    buf
}

#[test]
fn test_round_trip_all_mode_combinations() {
    for entry_per_call in [false, true] {
        for only_values in [false, true] {
            let session = sample_session(entry_per_call, only_values);
            let first = encode(&session);
            let decoded = read_session(&mut Cursor::new(&first), Path::new("mem")).unwrap();
            assert_eq!(decoded, session);
            assert_eq!(encode(&decoded), first);
        }
    }
}

#[test]
fn test_entry_per_call_omits_call_column() {
    let with_calls = encode(&sample_session(false, false));
    let without = encode(&sample_session(true, false));
    assert_eq!(with_calls.len() - without.len(), 5 * 4);
}

#[test]
fn test_write_rejects_inconsistent_sessions() {
    let mut session = sample_session(false, false);
    session.header.entries = 4;
    assert!(matches!(
        write_session(&mut Vec::new(), &session),
        Err(SessionError::InvalidLength { .. })
    ));

    let mut session = sample_session(false, false);
    session.header.target_entries = 2;
    assert!(matches!(
        write_session(&mut Vec::new(), &session),
        Err(SessionError::EntriesExceedTarget { .. })
    ));

    let mut session = sample_session(true, false);
    session.calls = Some(vec![1; 5]);
    assert!(session.validate().is_err());
}

#[test]
fn test_display_name_falls_back_to_target() {
    let mut header = SessionHeader::new("Pawn.Tick");
    assert_eq!(header.display_name(), "Pawn.Tick");
    header.custom_label = "baseline".to_string();
    assert_eq!(header.display_name(), "baseline");
}

#[test]
fn test_store_save_names_files_by_index() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"));

    let session = sample_session(false, false);
    let first = store.save(&session).unwrap();
    let second = store.save(&session).unwrap();

    assert_eq!(first.file_name().unwrap(), "Pawn.Tick-0.data");
    assert_eq!(second.file_name().unwrap(), "Pawn.Tick-1.data");
    assert_eq!(store.previous_entries_for("Pawn.Tick").unwrap(), vec![first.clone(), second]);
    assert!(store.previous_entries_for("Map.Draw").unwrap().is_empty());

    let loaded = store.load(&first).unwrap();
    assert_eq!(loaded, session);
}

#[test]
fn test_store_never_reuses_an_index_after_deletion() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let session = sample_session(false, false);

    let first = store.save(&session).unwrap();
    let second = store.save(&session).unwrap();
    let before = fs::read(&second).unwrap();
    fs::remove_file(&first).unwrap();

    let third = store.save(&sample_session(true, false)).unwrap();
    assert_ne!(second, third);
    assert_eq!(third.file_name().unwrap(), "Pawn.Tick-2.data");
    assert_eq!(fs::read(&second).unwrap(), before);
}

#[test]
fn test_store_lists_by_numeric_index() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let saved = store.save(&sample_session(false, false)).unwrap();
    for index in [2, 10] {
        fs::copy(&saved, dir.path().join(format!("Pawn.Tick-{}.data", index))).unwrap();
    }

    let names: Vec<String> = store
        .previous_entries_for("Pawn.Tick")
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Pawn.Tick-0.data", "Pawn.Tick-2.data", "Pawn.Tick-10.data"]);
    assert_eq!(store.next_index("Pawn.Tick").unwrap(), 11);
}

#[test]
fn test_store_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    store.save(&sample_session(true, true)).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Pawn.Tick-0.data".to_string()]);
}

#[test]
fn test_store_sanitizes_target_names() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let mut session = sample_session(false, false);
    session.header.target_name = "List<T>.Add item".to_string();

    let path = store.save(&session).unwrap();
    assert_eq!(path.file_name().unwrap(), "List_T_.Add_item-0.data");
    assert_eq!(store.previous_entries_for("List<T>.Add item").unwrap().len(), 1);
}

#[test]
fn test_headers_for_reads_every_file() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    store.save(&sample_session(false, false)).unwrap();
    store.save(&sample_session(true, false)).unwrap();

    let headers = store.headers_for("Pawn.Tick").unwrap();
    assert_eq!(headers.len(), 2);
    assert!(headers.iter().all(|(_, h)| h.is_valid()));
    assert!(headers[1].1.entry_per_call);
}

#[test]
fn test_corrupt_file_header_is_sentinel_and_load_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Pawn.Tick-0.data");

    let mut bytes = encode(&sample_session(false, false));
    bytes[..4].copy_from_slice(&0i32.to_le_bytes());
    fs::write(&path, bytes).unwrap();

    let header = read_header_at(&path);
    assert_eq!(header.magic, CORRUPT_MAGIC);

    match load_session(&path) {
        Err(SessionError::CorruptFile { path: p, found }) => {
            assert_eq!(p, path);
            assert_eq!(found, 0);
        }
        other => panic!("expected corrupt file error, got {:?}", other),
    }
}

#[test]
fn test_missing_file_header_is_sentinel() {
    let header = read_header_at("/nonexistent/session.data");
    assert_eq!(header, SessionHeader::corrupt());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_codec_round_trip(
        entry_per_call in any::<bool>(),
        only_values in any::<bool>(),
        label in "[ -~]{0,40}",
        rows in prop::collection::vec((-1.0e6f64..1.0e6, 0i32..10_000), 0..120),
        slack in 0i32..100,
    ) {
        let durations: Vec<f64> = rows.iter().map(|(d, _)| *d).collect();
        let calls = (!entry_per_call).then(|| rows.iter().map(|(_, c)| *c).collect::<Vec<_>>());
        let session = Session {
            header: SessionHeader {
                custom_label: label,
                entry_per_call,
                only_entries_with_values: only_values,
                entries: rows.len() as i32,
                target_entries: rows.len() as i32 + slack,
                ..SessionHeader::new("Prop.Target")
            },
            durations,
            calls,
        };

        let first = encode(&session);
        let decoded = read_session(&mut Cursor::new(&first), Path::new("mem")).unwrap();
        prop_assert_eq!(&decoded, &session);
        prop_assert_eq!(encode(&decoded), first);
    }
}
