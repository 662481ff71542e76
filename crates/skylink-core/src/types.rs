//! Directory listing entries and their payload encoding
//!
//! A ListDirectory reply packs as many entries as fit in one payload:
//!
//! ```text
//! F<name>\t<size>\0    regular file
//! D<name>\0            directory
//! S\0                  skipped entry (keeps entry indices stable)
//! ```

use std::fmt;

use crate::MAX_DATA_LEN;

/// Type of listing entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Skip,
}

/// One directory listing entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub name: String,
    /// File size in bytes (0 for directories)
    pub size: u64,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            name: name.into(),
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            name: name.into(),
            size: 0,
        }
    }

    pub fn skip() -> Self {
        Self {
            kind: EntryKind::Skip,
            name: String::new(),
            size: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    fn encoded(&self) -> Vec<u8> {
        let text = match self.kind {
            EntryKind::File => format!("F{}\t{}", self.name, self.size),
            EntryKind::Directory => format!("D{}", self.name),
            EntryKind::Skip => "S".to_string(),
        };
        let mut bytes = text.into_bytes();
        bytes.push(0);
        bytes
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::File => write!(f, "{} ({} bytes)", self.name, self.size),
            EntryKind::Directory => write!(f, "{}/", self.name),
            EntryKind::Skip => write!(f, "<skipped>"),
        }
    }
}

/// Pack entries into one payload
///
/// Returns the payload and how many entries it holds. An entry that does not
/// fit on its own is replaced by a skip marker so the listing still advances.
pub fn pack_entries(entries: &[DirEntry]) -> (Vec<u8>, usize) {
    let mut payload = Vec::with_capacity(MAX_DATA_LEN);
    let mut count = 0;

    for entry in entries {
        let mut bytes = entry.encoded();
        if bytes.len() > MAX_DATA_LEN {
            bytes = DirEntry::skip().encoded();
        }
        if payload.len() + bytes.len() > MAX_DATA_LEN {
            break;
        }
        payload.extend_from_slice(&bytes);
        count += 1;
    }

    (payload, count)
}

/// Parse a listing payload
///
/// Returns every entry including skip markers, so callers can advance the
/// listing offset by the returned length.
pub fn parse_entries(payload: &[u8]) -> Vec<DirEntry> {
    payload
        .split(|b| *b == 0)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            let text = String::from_utf8_lossy(raw);
            let mut chars = text.chars();
            let tag = chars.next();
            let rest = chars.as_str();
            match tag {
                Some('F') => match rest.rsplit_once('\t') {
                    Some((name, size)) => DirEntry::file(name, size.parse().unwrap_or(0)),
                    None => DirEntry::file(rest, 0),
                },
                Some('D') => DirEntry::directory(rest),
                _ => DirEntry::skip(),
            }
        })
        .collect()
}
