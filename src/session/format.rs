//! Binary session codec
//!
//! Little-endian throughout. Strings are a 7-bit varint byte length followed
//! by UTF-8 bytes; bools are one byte.
//!
//! ```text
//! i32  magic (440985710)
//! i32  version
//! str  target name
//! str  custom label
//! u8   entry_per_call
//! u8   only_entries_with_values
//! i32  entries
//! i32  target entries
//! ── `entries` rows ──
//! f64  duration (ms)
//! i32  calls            (omitted when entry_per_call)
//! ```

use super::{Result, Session, SessionError, SessionHeader, MAGIC};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::error;

/// Upper bound on rows reserved up front; longer files grow as they are read
const MAX_PREALLOCATED_ROWS: usize = 1 << 16;

pub fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    let mut len = value.len() as u32;
    while len >= 0x80 {
        writer.write_u8((len as u8) | 0x80)?;
        len >>= 7;
    }
    writer.write_u8(len as u8)?;
    writer.write_all(value.as_bytes())
}

pub fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8()?;
        if shift == 28 && byte > 0x0f {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "string length prefix overflows 32 bits",
            ));
        }
        len |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    if len > i32::MAX as u32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "negative string length",
        ));
    }

    let mut bytes = Vec::new();
    reader
        .by_ref()
        .take(u64::from(len))
        .read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_header<W: Write>(writer: &mut W, header: &SessionHeader) -> io::Result<()> {
    writer.write_i32::<LittleEndian>(header.magic)?;
    writer.write_i32::<LittleEndian>(header.version)?;
    write_string(writer, &header.target_name)?;
    write_string(writer, &header.custom_label)?;
    writer.write_u8(u8::from(header.entry_per_call))?;
    writer.write_u8(u8::from(header.only_entries_with_values))?;
    writer.write_i32::<LittleEndian>(header.entries)?;
    writer.write_i32::<LittleEndian>(header.target_entries)
}

/// Decode a header without checking its magic
pub fn read_raw_header<R: Read>(reader: &mut R) -> io::Result<SessionHeader> {
    Ok(SessionHeader {
        magic: reader.read_i32::<LittleEndian>()?,
        version: reader.read_i32::<LittleEndian>()?,
        target_name: read_string(reader)?,
        custom_label: read_string(reader)?,
        entry_per_call: reader.read_u8()? != 0,
        only_entries_with_values: reader.read_u8()? != 0,
        entries: reader.read_i32::<LittleEndian>()?,
        target_entries: reader.read_i32::<LittleEndian>()?,
    })
}

/// Decode a header, never failing.
///
/// A wrong magic, or a stream too short to hold a header, yields
/// [`SessionHeader::corrupt`] (magic = -1) and an error log line.
pub fn read_header<R: Read>(reader: &mut R) -> SessionHeader {
    match read_raw_header(reader) {
        Ok(header) if header.magic == MAGIC => header,
        Ok(header) => {
            error!(
                "Session header has magic {} instead of {}; the file is corrupt",
                header.magic, MAGIC
            );
            SessionHeader::corrupt()
        }
        Err(e) => {
            error!("Failed to read session header: {}", e);
            SessionHeader::corrupt()
        }
    }
}

/// Write a complete session (header + interleaved rows)
pub fn write_session<W: Write>(writer: &mut W, session: &Session) -> Result<()> {
    session.validate()?;
    write_header(writer, &session.header)?;

    for (i, duration) in session.durations.iter().enumerate() {
        writer.write_f64::<LittleEndian>(*duration)?;
        if let Some(calls) = &session.calls {
            writer.write_i32::<LittleEndian>(calls[i])?;
        }
    }
    Ok(())
}

/// Read a complete session; `origin` names the source in errors
pub fn read_session<R: Read>(reader: &mut R, origin: &Path) -> Result<Session> {
    let header = read_raw_header(reader)?;
    if header.magic != MAGIC {
        error!(
            "{}: session header has magic {} instead of {}",
            origin.display(),
            header.magic,
            MAGIC
        );
        return Err(SessionError::CorruptFile {
            path: origin.to_path_buf(),
            found: header.magic,
        });
    }
    if header.entries < 0 || header.target_entries < 0 {
        return Err(SessionError::NegativeCount {
            entries: header.entries,
            target: header.target_entries,
        });
    }
    if header.entries > header.target_entries {
        return Err(SessionError::EntriesExceedTarget {
            entries: header.entries,
            target: header.target_entries,
        });
    }

    let rows = header.entries as usize;
    let reserve = rows.min(MAX_PREALLOCATED_ROWS);
    let mut durations = Vec::with_capacity(reserve);
    let mut calls = (!header.entry_per_call).then(|| Vec::with_capacity(reserve));

    for _ in 0..rows {
        durations.push(reader.read_f64::<LittleEndian>()?);
        if let Some(calls) = calls.as_mut() {
            calls.push(reader.read_i32::<LittleEndian>()?);
        }
    }

    Ok(Session {
        header,
        durations,
        calls,
    })
}
