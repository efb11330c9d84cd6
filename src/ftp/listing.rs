//! The directory listing text format: one NUL terminated record per entry, `F<name>\t<size>`
//!  for files, `D<name>` for directories, `S` for entries to skip.

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum DirEntryKind {
    File,
    Directory,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct DirEntry {
    pub kind: DirEntryKind,
    pub name: String,
    /// size in bytes; always 0 for directories
    pub size: u32,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: u32) -> DirEntry {
        DirEntry {
            kind: DirEntryKind::File,
            name: name.into(),
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> DirEntry {
        DirEntry {
            kind: DirEntryKind::Directory,
            name: name.into(),
            size: 0,
        }
    }
}

/// Parses one page of listing data. Unparseable records are skipped rather than failing the
///  whole page - servers routinely emit `S` markers and other noise.
pub fn parse_listing(data: &[u8]) -> Vec<DirEntry> {
    let mut result = Vec::new();
    for record in data.split(|&b| b == 0) {
        let Ok(record) = std::str::from_utf8(record) else {
            continue;
        };
        if record.is_empty() {
            continue;
        }
        if let Some(rest) = record.strip_prefix('F') {
            let (name, size) = match rest.split_once('\t') {
                Some((name, size_str)) => match size_str.parse::<u32>() {
                    Ok(size) => (name, size),
                    Err(_) => continue,
                },
                None => (rest, 0),
            };
            if !name.is_empty() {
                result.push(DirEntry::file(name, size));
            }
        } else if let Some(name) = record.strip_prefix('D') {
            if !name.is_empty() {
                result.push(DirEntry::directory(name));
            }
        }
        // 'S' and anything unknown is skipped
    }
    result
}

/// A single entry in the wire format, including the terminating NUL.
pub fn format_entry(entry: &DirEntry) -> String {
    match entry.kind {
        DirEntryKind::File => format!("F{}\t{}\0", entry.name, entry.size),
        DirEntryKind::Directory => format!("D{}\0", entry.name),
    }
}
