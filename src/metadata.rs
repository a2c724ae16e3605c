//! Metadata snapshots
//!
//! Each session records one entry per backed-up path in a flat text file,
//! `mirror_metadata.<time>.snapshot`, gzip-compressed once the session
//! commits. Records appear in strictly ascending index order:
//!
//! ```text
//! File .
//!   Kind dir
//!   Mtime 1700000000
//!   Uid 1000
//!   Gid 1000
//!   Mode 755
//! File docs/notes.txt
//!   Kind reg
//!   Size 12
//!   Mtime 1700000000
//!   Uid 1000
//!   Gid 1000
//!   Mode 644
//!   Sha256 5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03
//! ```
//!
//! Paths are byte strings with `\\`, `\n` and other control bytes escaped.
//! Because every record starts with a `File ` line, a reader can skip to an
//! index by looking only at header lines, never parsing the bodies it passes.

use crate::compression;
use crate::entry::{Entry, EntryKind, HardlinkKey};
use crate::error::{Result, RewindError};
use crate::index::Index;
use flate2::read::GzDecoder;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const HEADER: &[u8] = b"File ";
const INDENT: &[u8] = b"  ";

/// Escape a byte string for a record line
fn escape(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            0..=0x1f | 0x7f => out.extend_from_slice(format!("\\x{:02x}", b).as_bytes()),
            _ => out.push(b),
        }
    }
}

/// Reverse of [`escape`]
fn unescape(bytes: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(b'n') => {
                out.push(b'\n');
                i += 2;
            }
            Some(b'x') => {
                let hex = bytes
                    .get(i + 2..i + 4)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| "bad \\x escape".to_string())?;
                out.push(hex);
                i += 4;
            }
            _ => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

/// Serialize one entry as a record
pub fn encode_record(entry: &Entry) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(HEADER);
    if entry.index.is_root() {
        out.push(b'.');
    } else {
        escape(&entry.index.to_slash_bytes(), &mut out);
    }
    out.push(b'\n');

    let mut attr = |key: &str, value: &[u8]| {
        out.extend_from_slice(INDENT);
        out.extend_from_slice(key.as_bytes());
        out.push(b' ');
        out.extend_from_slice(value);
        out.push(b'\n');
    };

    attr("Kind", entry.kind.as_str().as_bytes());
    if entry.kind == EntryKind::Absent {
        return out;
    }
    if entry.is_reg() {
        attr("Size", entry.size.to_string().as_bytes());
    }
    attr("Mtime", entry.mtime.to_string().as_bytes());
    attr("Uid", entry.uid.to_string().as_bytes());
    attr("Gid", entry.gid.to_string().as_bytes());
    attr("Mode", format!("{:o}", entry.permissions).as_bytes());
    if let Some(target) = &entry.link_target {
        let mut escaped = Vec::new();
        escape(target.as_bytes(), &mut escaped);
        attr("Target", &escaped);
    }
    if let Some((major, minor)) = entry.device {
        attr("Device", format!("{} {}", major, minor).as_bytes());
    }
    if let Some(hash) = &entry.content_hash {
        attr("Sha256", hash.as_bytes());
    }
    if let Some(link) = &entry.hardlink {
        attr("Inode", format!("{} {}", link.dev, link.ino).as_bytes());
    }
    if entry.nlink > 1 {
        attr("Links", entry.nlink.to_string().as_bytes());
    }
    out
}

/// Sequential writer of a session's metadata snapshot
///
/// The snapshot stays uncompressed while the session runs so that it can be
/// truncated back to a checkpointed length when the session resumes.
pub struct MetadataWriter {
    path: PathBuf,
    out: BufWriter<File>,
    bytes: u64,
    records: u64,
    last: Option<Index>,
}

impl MetadataWriter {
    /// Create (or truncate) a snapshot file
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        debug!("Writing metadata snapshot {:?}", path);
        Ok(MetadataWriter {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            bytes: 0,
            records: 0,
            last: None,
        })
    }

    /// Reopen a snapshot, discarding everything past `len` bytes
    pub fn resume(path: &Path, len: u64, records: u64, last: Option<Index>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual < len {
            return Err(RewindError::InvalidCheckpoint(format!(
                "metadata snapshot {:?} holds {} bytes, checkpoint expects {}",
                path, actual, len
            )));
        }
        file.set_len(len)?;
        file.seek(SeekFrom::End(0))?;
        debug!("Resuming metadata snapshot {:?} at byte {}", path, len);
        Ok(MetadataWriter {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            bytes: len,
            records,
            last,
        })
    }

    /// Append one record
    pub fn write(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last {
            if entry.index <= *last {
                return Err(RewindError::OutOfOrder {
                    previous: last.to_string(),
                    current: entry.index.to_string(),
                });
            }
        }
        let record = encode_record(entry);
        self.out.write_all(&record)?;
        self.bytes += record.len() as u64;
        self.records += 1;
        self.last = Some(entry.index.clone());
        trace!("Recorded {}", entry.index);
        Ok(())
    }

    /// Flush buffered records and fsync; returns the durable length
    pub fn sync(&mut self) -> Result<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.bytes)
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Index of the last record written
    pub fn last_index(&self) -> Option<&Index> {
        self.last.as_ref()
    }

    /// Snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, sync and close
    pub fn finish(mut self) -> Result<PathBuf> {
        self.sync()?;
        Ok(self.path)
    }

    /// Finish and replace the snapshot with a gzip-compressed copy
    pub fn finish_compressed(self) -> Result<PathBuf> {
        let plain = self.finish()?;
        let mut name = plain.clone().into_os_string();
        name.push(".gz");
        let gz = PathBuf::from(name);
        compression::gzip_file(&plain, &gz)?;
        std::fs::remove_file(&plain)?;
        Ok(gz)
    }
}

/// Sequential reader of a metadata snapshot
pub struct MetadataReader {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    line: usize,
    pending: Option<(Index, usize)>,
    last: Option<Index>,
}

impl MetadataReader {
    /// Open a snapshot; `.gz` files are decompressed on the fly
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn BufRead + Send> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(MetadataReader {
            path: path.to_path_buf(),
            reader,
            line: 0,
            pending: None,
            last: None,
        })
    }

    /// Look up a single index with one forward scan
    pub fn find(path: &Path, index: &Index) -> Result<Option<Entry>> {
        let mut reader = Self::open(path)?;
        reader.advance_while(|i| i < index)?;
        match reader.next() {
            Some(Ok(entry)) if entry.index == *index => Ok(Some(entry)),
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Consume records at or before `index` without parsing their bodies
    pub fn skip_through(&mut self, index: &Index) -> Result<u64> {
        self.advance_while(|i| i <= index)
    }

    /// Consume leading records whose index satisfies `pred`
    pub fn advance_while(&mut self, pred: impl Fn(&Index) -> bool) -> Result<u64> {
        let mut skipped = 0;
        while let Some((index, line)) = self.next_header()? {
            if !pred(&index) {
                self.pending = Some((index, line));
                break;
            }
            self.check_order(&index, line)?;
            self.last = Some(index);
            while let Some(raw) = self.read_line()? {
                if raw.starts_with(HEADER) {
                    self.pending = Some(self.parse_header(&raw)?);
                    break;
                }
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    fn corrupt(&self, line: usize, reason: impl Into<String>) -> RewindError {
        RewindError::CorruptMetadata {
            path: self.path.clone(),
            line,
            reason: reason.into(),
        }
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else {
            return Err(self.corrupt(self.line, "truncated record"));
        }
        Ok(Some(buf))
    }

    fn parse_header(&self, raw: &[u8]) -> Result<(Index, usize)> {
        let escaped = &raw[HEADER.len()..];
        let bytes = unescape(escaped).map_err(|e| self.corrupt(self.line, e))?;
        Ok((Index::from_slash_bytes(&bytes), self.line))
    }

    fn next_header(&mut self) -> Result<Option<(Index, usize)>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        while let Some(raw) = self.read_line()? {
            if raw.is_empty() {
                continue;
            }
            if raw.starts_with(HEADER) {
                return self.parse_header(&raw).map(Some);
            }
            return Err(self.corrupt(self.line, "attribute line outside a record"));
        }
        Ok(None)
    }

    fn check_order(&self, index: &Index, line: usize) -> Result<()> {
        if let Some(last) = &self.last {
            if index <= last {
                return Err(self.corrupt(line, format!("{} does not follow {}", index, last)));
            }
        }
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Entry>> {
        let (index, header_line) = match self.next_header()? {
            Some(header) => header,
            None => return Ok(None),
        };
        self.check_order(&index, header_line)?;

        let mut entry = Entry::absent(index);
        let mut kind_seen = false;
        while let Some(raw) = self.read_line()? {
            if raw.starts_with(HEADER) {
                self.pending = Some(self.parse_header(&raw)?);
                break;
            }
            if raw.is_empty() {
                continue;
            }
            let body = raw
                .strip_prefix(INDENT)
                .ok_or_else(|| self.corrupt(self.line, "attribute line not indented"))?;
            let split = body.iter().position(|b| *b == b' ').unwrap_or(body.len());
            let key = &body[..split];
            let value = body.get(split + 1..).unwrap_or(&[]);
            self.apply_attr(&mut entry, key, value)?;
            kind_seen |= key == b"Kind";
        }
        if !kind_seen {
            return Err(self.corrupt(header_line, "record without Kind"));
        }
        self.last = Some(entry.index.clone());
        Ok(Some(entry))
    }

    fn apply_attr(&self, entry: &mut Entry, key: &[u8], value: &[u8]) -> Result<()> {
        let text = || {
            std::str::from_utf8(value).map_err(|_| self.corrupt(self.line, "non-UTF-8 attribute value"))
        };
        let number = |s: &str| -> Result<i64> {
            s.parse::<i64>()
                .map_err(|_| self.corrupt(self.line, format!("bad number {:?}", s)))
        };
        let unsigned = |s: &str| -> Result<u64> {
            s.parse::<u64>()
                .map_err(|_| self.corrupt(self.line, format!("bad number {:?}", s)))
        };
        let pair = |s: &str| -> Result<(u64, u64)> {
            let mut parts = s.split(' ');
            match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => Ok((unsigned(a)?, unsigned(b)?)),
                _ => Err(self.corrupt(self.line, format!("expected two numbers, got {:?}", s))),
            }
        };

        match key {
            b"Kind" => {
                entry.kind = EntryKind::parse(text()?)
                    .ok_or_else(|| self.corrupt(self.line, "unknown kind"))?;
            }
            b"Size" => entry.size = unsigned(text()?)?,
            b"Mtime" => entry.mtime = number(text()?)?,
            b"Uid" => entry.uid = number(text()?)? as u32,
            b"Gid" => entry.gid = number(text()?)? as u32,
            b"Mode" => {
                entry.permissions = u32::from_str_radix(text()?, 8)
                    .map_err(|_| self.corrupt(self.line, "bad mode"))?;
            }
            b"Target" => {
                let raw = unescape(value).map_err(|e| self.corrupt(self.line, e))?;
                entry.link_target = Some(OsString::from_vec(raw));
            }
            b"Device" => entry.device = Some(pair(text()?)?),
            b"Sha256" => entry.content_hash = Some(text()?.to_string()),
            b"Inode" => {
                let (dev, ino) = pair(text()?)?;
                entry.hardlink = Some(HardlinkKey { dev, ino });
            }
            b"Links" => entry.nlink = unsigned(text()?)?,
            // Unknown keys from newer writers are ignored
            _ => trace!("Ignoring metadata key {:?}", String::from_utf8_lossy(key)),
        }
        Ok(())
    }
}

impl Iterator for MetadataReader {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, kind: EntryKind) -> Entry {
        let index = if path == "." {
            Index::root()
        } else {
            Index::from_components(path.split('/'))
        };
        Entry {
            kind,
            mtime: 1_700_000_000,
            uid: 1000,
            gid: 100,
            permissions: if kind == EntryKind::Directory { 0o755 } else { 0o644 },
            ..Entry::absent(index)
        }
    }

    fn sample() -> Vec<Entry> {
        let mut file = entry("docs/a\nb\\c", EntryKind::Regular);
        file.size = 12;
        file.content_hash = Some("ab".repeat(32));
        file.hardlink = Some(HardlinkKey { dev: 3, ino: 99 });
        file.nlink = 2;
        let mut link = entry("docs/link", EntryKind::Symlink);
        link.link_target = Some(OsString::from("../elsewhere"));
        let mut dev = entry("zdev", EntryKind::CharDevice);
        dev.device = Some((1, 3));
        vec![entry(".", EntryKind::Directory), entry("docs", EntryKind::Directory), file, link, dev]
    }

    fn write_all(path: &Path, entries: &[Entry]) {
        let mut writer = MetadataWriter::create(path).unwrap();
        for e in entries {
            writer.write(e).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror_metadata.snapshot");
        let entries = sample();
        write_all(&path, &entries);

        let read: Vec<Entry> = MetadataReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_compressed_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.snapshot");
        let mut writer = MetadataWriter::create(&path).unwrap();
        for e in sample() {
            writer.write(&e).unwrap();
        }
        let gz = writer.finish_compressed().unwrap();
        assert!(!path.exists());
        assert!(gz.to_string_lossy().ends_with(".snapshot.gz"));
        let count = MetadataReader::open(&gz).unwrap().count();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_skip_and_find() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.snapshot");
        write_all(&path, &sample());

        let mut reader = MetadataReader::open(&path).unwrap();
        let skipped = reader.skip_through(&Index::from_components(["docs"])).unwrap();
        assert_eq!(skipped, 2);
        let next = reader.next().unwrap().unwrap();
        assert_eq!(next.index, Index::from_components(["docs", "a\nb\\c"]));

        let found = MetadataReader::find(&path, &Index::from_components(["docs", "link"])).unwrap();
        assert!(found.unwrap().is_symlink());
        let missing = MetadataReader::find(&path, &Index::from_components(["nope"])).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_advance_while_stops_before_first_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.snapshot");
        write_all(&path, &sample());

        let mut reader = MetadataReader::open(&path).unwrap();
        let docs = Index::from_components(["docs"]);
        let skipped = reader.advance_while(|i| *i < docs).unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(reader.next().unwrap().unwrap().index, docs);
        assert_eq!(reader.advance_while(|_| true).unwrap(), 3);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_full_range_inode_and_device_numbers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.snapshot");
        let mut file = entry("big", EntryKind::Regular);
        file.hardlink = Some(HardlinkKey { dev: u64::MAX, ino: u64::MAX - 1 });
        file.nlink = 2;
        let mut dev = entry("node", EntryKind::BlockDevice);
        dev.device = Some((u64::MAX, 1 << 63));
        let entries = vec![file, dev];
        write_all(&path, &entries);

        let read: Vec<Entry> = MetadataReader::open(&path).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_writer_rejects_disorder() {
        let dir = TempDir::new().unwrap();
        let mut writer = MetadataWriter::create(&dir.path().join("m")).unwrap();
        writer.write(&entry("b", EntryKind::Regular)).unwrap();
        assert!(writer.write(&entry("a", EntryKind::Regular)).is_err());
    }

    #[test]
    fn test_resume_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.snapshot");
        let entries = sample();
        let mut writer = MetadataWriter::create(&path).unwrap();
        writer.write(&entries[0]).unwrap();
        writer.write(&entries[1]).unwrap();
        let durable = writer.sync().unwrap();
        writer.write(&entries[2]).unwrap();
        writer.finish().unwrap();

        let mut resumed =
            MetadataWriter::resume(&path, durable, 2, Some(entries[1].index.clone())).unwrap();
        for e in &entries[2..] {
            resumed.write(e).unwrap();
        }
        resumed.finish().unwrap();

        let read: Vec<Entry> = MetadataReader::open(&path).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, b"File a\n  Kind reg\n  Size x\n").unwrap();
        let err = MetadataReader::open(&path).unwrap().next().unwrap().unwrap_err();
        assert!(err.is_structural());

        std::fs::write(&path, b"File b\n  Kind reg\nFile a\n  Kind reg\n").unwrap();
        let results: Vec<_> = MetadataReader::open(&path).unwrap().collect();
        assert!(results[1].is_err());

        std::fs::write(&path, b"File a\n  Kind reg\n  Size 1").unwrap();
        let results: Vec<_> = MetadataReader::open(&path).unwrap().collect();
        assert!(results[0].is_err(), "truncated final line must be rejected");
    }
}
