//! Session directory
//!
//! Files are named `<sanitized target name>-<index>.data`, where the index is
//! one past the highest index already stored for that target. Saves go
//! through a temporary file in the same directory that is renamed into place
//! without replacing an existing file, so a crash mid-write never leaves a
//! truncated session behind and no save overwrites another.

use super::format::{read_header, read_session, write_session};
use super::{Result, Session, SessionHeader};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Extension of session files
pub const EXTENSION: &str = "data";

fn invalid_chars() -> &'static Regex {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    // constant pattern, compiled once
    INVALID.get_or_init(|| {
        Regex::new(r#"[<>:"/\\|?*\x00-\x1f]+"#).expect("file-name pattern is a valid regex")
    })
}

/// Replace every run of characters invalid in file names with `_`, then
/// every space with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    invalid_chars().replace_all(name, "_").replace(' ', "_")
}

/// Running index of `file_name` if it is `<stem>-<index>.data`
pub fn session_index(file_name: &str, stem: &str) -> Option<u64> {
    file_name
        .strip_prefix(stem)?
        .strip_prefix('-')?
        .strip_suffix(EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session files whose name contains the sanitized `target_name`.
    ///
    /// Files carrying a running index come first, by index; the rest follow
    /// by name. A missing directory has no sessions.
    pub fn previous_entries_for(&self, target_name: &str) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let needle = sanitize_file_name(target_name);

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().contains(&needle) {
                found.push(entry.path());
            }
        }
        found.sort_by_cached_key(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (session_index(&name, &needle).unwrap_or(u64::MAX), name)
        });
        Ok(found)
    }

    /// Index the next session for `target_name` will be saved under
    pub fn next_index(&self, target_name: &str) -> Result<u64> {
        let stem = sanitize_file_name(target_name);
        Ok(self
            .previous_entries_for(target_name)?
            .iter()
            .filter_map(|path| session_index(&path.file_name()?.to_string_lossy(), &stem))
            .max()
            .map_or(0, |highest| highest + 1))
    }

    /// Path the next session for `target_name` will be saved under
    pub fn next_path(&self, target_name: &str) -> Result<PathBuf> {
        let index = self.next_index(target_name)?;
        Ok(self.path_for(target_name, index))
    }

    fn path_for(&self, target_name: &str, index: u64) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{}",
            sanitize_file_name(target_name),
            index,
            EXTENSION
        ))
    }

    /// Write `session` atomically and return its path
    pub fn save(&self, session: &Session) -> Result<PathBuf> {
        session.validate()?;
        fs::create_dir_all(&self.dir)?;
        let target_name = &session.header.target_name;
        let mut index = self.next_index(target_name)?;

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            write_session(&mut writer, session)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;

        let path = loop {
            let path = self.path_for(target_name, index);
            match temp.persist_noclobber(&path) {
                Ok(_) => break path,
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("{} appeared while saving; trying the next index", path.display());
                    temp = e.file;
                    index += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            "Saved session '{}' ({} entries) to {}",
            session.header.display_name(),
            session.header.entries,
            path.display()
        );
        Ok(path)
    }

    /// Load a complete session
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Session> {
        load_session(path)
    }

    /// Header of the session at `path`; corrupt or unreadable files yield
    /// the sentinel header.
    pub fn read_header(&self, path: impl AsRef<Path>) -> SessionHeader {
        read_header_at(path)
    }

    /// Headers of all sessions stored for `target_name`
    pub fn headers_for(&self, target_name: &str) -> Result<Vec<(PathBuf, SessionHeader)>> {
        Ok(self
            .previous_entries_for(target_name)?
            .into_iter()
            .map(|path| {
                let header = read_header_at(&path);
                (path, header)
            })
            .collect())
    }
}

pub fn load_session(path: impl AsRef<Path>) -> Result<Session> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let session = read_session(&mut reader, path)?;
    debug!("Loaded {} entries from {}", session.len(), path.display());
    Ok(session)
}

pub fn read_header_at(path: impl AsRef<Path>) -> SessionHeader {
    match File::open(path.as_ref()) {
        Ok(file) => read_header(&mut BufReader::new(file)),
        Err(e) => {
            tracing::error!("Cannot open {}: {}", path.as_ref().display(), e);
            SessionHeader::corrupt()
        }
    }
}
