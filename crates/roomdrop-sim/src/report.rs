use std::path::PathBuf;

use roomdrop_protocol::{MetricsSnapshot, RoomdropError};
use serde::Serialize;

/// JSON summary printed at the end of a run.
#[derive(Serialize)]
pub struct Report {
    pub room: String,
    pub encrypted: bool,
    pub files: Vec<FileReport>,
    pub downloads: Vec<DownloadReport>,
    pub sender: MetricsSnapshot,
    pub receivers: Vec<MetricsSnapshot>,
    pub elapsed_ms: u64,
}

#[derive(Serialize)]
pub struct FileReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub announced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReport {
    pub fn sent(name: String, file_id: String, announced: bool) -> Self {
        Self {
            name,
            file_id: Some(file_id),
            announced,
            error: None,
        }
    }

    pub fn failed(name: String, error: String) -> Self {
        Self {
            name,
            file_id: None,
            announced: false,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
pub struct DownloadReport {
    pub peer: usize,
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    /// Same size and SHA-256 as the file that was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
    /// Error category, e.g. `condition_not_satisfied`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadReport {
    pub fn ok(
        peer: usize,
        name: &str,
        bytes: usize,
        verified: bool,
        saved_to: Option<PathBuf>,
    ) -> Self {
        Self {
            peer,
            name: name.to_string(),
            ok: true,
            bytes: Some(bytes),
            verified: Some(verified),
            saved_to,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(peer: usize, name: &str, error: &RoomdropError) -> Self {
        Self {
            peer,
            name: name.to_string(),
            ok: false,
            bytes: None,
            verified: None,
            saved_to: None,
            error_kind: Some(error_kind(error)),
            error: Some(error.user_message()),
        }
    }
}

fn error_kind(error: &RoomdropError) -> &'static str {
    match error {
        RoomdropError::ConditionNotSatisfied { .. } => "condition_not_satisfied",
        RoomdropError::Download { .. } => "download",
        RoomdropError::Encryption(_) => "encryption",
        RoomdropError::NotFound { .. } => "not_found",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_download_serializes_kind() {
        let err = RoomdropError::ConditionNotSatisfied {
            condition: "balance > 0".into(),
        };
        let json = serde_json::to_value(DownloadReport::failed(1, "a.pdf.enc", &err)).unwrap();
        assert_eq!(json["error_kind"], "condition_not_satisfied");
        assert_eq!(json["ok"], false);
        assert!(json.get("bytes").is_none());
        assert!(json.get("verified").is_none());
    }

    #[test]
    fn successful_download_reports_verification() {
        let json = serde_json::to_value(DownloadReport::ok(0, "a.pdf", 4, true, None)).unwrap();
        assert_eq!(json["verified"], true);
        assert_eq!(json["bytes"], 4);
        assert!(json.get("saved_to").is_none());
    }
}
