#![no_main]

use libfuzzer_sys::fuzz_target;
use probeweave::session::{read_header, read_session, write_session};
use std::io::Cursor;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    // Header reads never fail; corrupt input yields the sentinel header
    let _ = read_header(&mut Cursor::new(data));

    // Anything that decodes must re-encode to a session that decodes equal
    if let Ok(session) = read_session(&mut Cursor::new(data), Path::new("fuzz")) {
        let mut encoded = Vec::new();
        write_session(&mut encoded, &session).expect("decoded session re-encodes");
        let again = read_session(&mut Cursor::new(&encoded), Path::new("fuzz"))
            .expect("re-encoded session decodes");
        assert_eq!(again.header, session.header);
        assert_eq!(again.len(), session.len());
    }
});
