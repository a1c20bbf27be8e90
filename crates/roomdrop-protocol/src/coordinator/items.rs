/// Transfer items and the files fed into the send path.
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::announcement::AnnouncementRecord;
use crate::error::RoomdropError;
use crate::types::{now_ms, size_in_mb, ItemId};

/// Suffix appended to the announced name of an encrypted artifact.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Numbered variants tried before `save_in` gives up on a taken name.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Where an item is in its pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Encrypting,
    Uploading,
    /// Stored and announced (or announced with a warning).
    Sent,
    Failed(String),
    /// Announced by a peer; not downloaded automatically.
    Received,
}

/// Local bookkeeping for one sent or received file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferItem {
    pub id: ItemId,
    /// Announced name; carries [`ENCRYPTED_SUFFIX`] for encrypted artifacts.
    pub file_name: String,
    pub file_type: String,
    /// Megabytes.
    pub file_size: f64,
    /// Bound once upload (send) or announcement (receive) completes.
    pub file_id: Option<String>,
    /// Send side only. Never decreases.
    pub progress: u8,
    pub is_encrypted: bool,
    pub access_condition: String,
    pub status: TransferStatus,
    /// Local creation time for sent items, record timestamp for received ones.
    pub timestamp: u64,
    /// Announcing sender, for received items.
    pub sender: Option<String>,
}

impl TransferItem {
    pub(crate) fn outgoing(file: &RawFile) -> Self {
        Self {
            id: ItemId::new(),
            file_name: file.name.clone(),
            file_type: file.mime_type.clone(),
            file_size: size_in_mb(file.data.len()),
            file_id: None,
            progress: 0,
            is_encrypted: false,
            access_condition: String::new(),
            status: TransferStatus::Pending,
            timestamp: now_ms(),
            sender: None,
        }
    }

    pub(crate) fn incoming(record: &AnnouncementRecord) -> Self {
        Self {
            id: ItemId::new(),
            file_name: record.file_name.clone(),
            file_type: record.file_type.clone(),
            file_size: record.file_size,
            file_id: Some(record.file_id.clone()),
            progress: 0,
            is_encrypted: record.is_encrypted,
            access_condition: record.access_condition.clone(),
            status: TransferStatus::Received,
            timestamp: record.timestamp,
            sender: Some(record.sender.clone()),
        }
    }

    /// Raise progress; lower values are ignored.
    pub(crate) fn advance(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TransferStatus::Failed(_))
    }
}

// ── Raw input files ───────────────────────────────────────────────────

/// A file handed to the send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl RawFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RoomdropError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| RoomdropError::Config(format!("{} has no file name", path.display())))?;
        let data = std::fs::read(path)?;
        Ok(Self {
            mime_type: guess_mime(&name).to_string(),
            name,
            data,
        })
    }
}

/// MIME type for common extensions; `application/octet-stream` otherwise.
pub fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

// ── Downloaded output ─────────────────────────────────────────────────

/// A fetched (and, if needed, decrypted) payload ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub item_id: ItemId,
    /// Name with [`ENCRYPTED_SUFFIX`] removed.
    pub file_name: String,
    pub file_type: String,
    pub data: Vec<u8>,
}

impl DownloadedFile {
    /// Write the payload into `dir` under its base name and return the path.
    ///
    /// Directory components and names that reduce to nothing are replaced
    /// so a peer-chosen name cannot escape `dir`. An existing file is never
    /// overwritten: the name gets a ` (n)` counter instead. The payload is
    /// staged in a uniquely named temp file and moved into place.
    pub fn save_in(&self, dir: impl AsRef<Path>) -> Result<PathBuf, RoomdropError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".roomdrop-")
            .suffix(".part")
            .tempfile_in(dir)?;
        staged.write_all(&self.data)?;
        staged.as_file().sync_all()?;

        let name = sanitize_file_name(&self.file_name);
        let mut attempt = 0;
        loop {
            let path = dir.join(numbered_name(&name, attempt));
            match staged.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e)
                    if e.error.kind() == ErrorKind::AlreadyExists
                        && attempt < MAX_NAME_ATTEMPTS =>
                {
                    staged = e.file;
                    attempt += 1;
                }
                Err(e) => return Err(e.error.into()),
            }
        }
    }
}

/// `report.pdf` → `report (2).pdf`; attempt 0 keeps the name.
fn numbered_name(name: &str, attempt: usize) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

pub(crate) fn strip_encrypted_suffix(name: &str) -> &str {
    name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(name)
}

/// Last path component of a peer-supplied name, with control characters removed.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("Report.PDF"), "application/pdf");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("Makefile"), "application/octet-stream");
    }

    #[test]
    fn raw_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let file = RawFile::from_path(&path).unwrap();
        assert_eq!(file.name, "photo.png");
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.data, vec![1, 2, 3]);
    }

    #[test]
    fn progress_only_advances() {
        let mut item = TransferItem::outgoing(&RawFile::new("a", "text/plain", vec![]));
        assert!(item.advance(50));
        assert!(!item.advance(30));
        assert!(item.advance(200));
        assert_eq!(item.progress, 100);
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_encrypted_suffix("a.pdf.enc"), "a.pdf");
        assert_eq!(strip_encrypted_suffix("a.pdf"), "a.pdf");
    }

    #[test]
    fn sanitized_names_stay_inside_dir() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name("a\u{7}b.txt"), "ab.txt");
    }

    #[test]
    fn save_in_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = DownloadedFile {
            item_id: ItemId::new(),
            file_name: "../report.pdf".into(),
            file_type: "application/pdf".into(),
            data: b"%PDF".to_vec(),
        };

        let path = file.save_in(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("report.pdf"));
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF".to_vec());
        // No staging leftovers.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn downloaded(name: &str, data: &[u8]) -> DownloadedFile {
        DownloadedFile {
            item_id: ItemId::new(),
            file_name: name.into(),
            file_type: guess_mime(name).into(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn same_name_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let first = downloaded("notes.txt", b"first").save_in(dir.path()).unwrap();
        let second = downloaded("notes.txt", b"second").save_in(dir.path()).unwrap();

        assert_eq!(first, dir.path().join("notes.txt"));
        assert_eq!(second, dir.path().join("notes (1).txt"));
        assert_eq!(std::fs::read(first).unwrap(), b"first".to_vec());
        assert_eq!(std::fs::read(second).unwrap(), b"second".to_vec());
    }

    #[test]
    fn concurrent_saves_sharing_a_stem_keep_their_contents() {
        let dir = tempfile::tempdir().unwrap();
        let handles: Vec<_> = [("a.pdf", b"pdf bytes".to_vec()), ("a.txt", b"txt bytes".to_vec())]
            .into_iter()
            .map(|(name, data)| {
                let dir = dir.path().to_path_buf();
                std::thread::spawn(move || downloaded(name, &data).save_in(dir).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(std::fs::read(dir.path().join("a.pdf")).unwrap(), b"pdf bytes".to_vec());
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"txt bytes".to_vec());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn numbered_names() {
        assert_eq!(numbered_name("a.pdf", 0), "a.pdf");
        assert_eq!(numbered_name("a.tar.gz", 2), "a.tar (2).gz");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc (1)");
        assert_eq!(numbered_name("README", 3), "README (3)");
    }
}
