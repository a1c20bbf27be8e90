/// Announcement record codec.
///
/// Wire format: a MessagePack map with named keys, written as
/// `v`, `timestamp`, `sender`, `fileName`, `fileType`, `fileSize`, `fileId`,
/// `isEncrypted`, `accessCondition`. Each value is tagged by its key, so a
/// decoder skips keys it does not know and fills in defaults for optional
/// keys a producer left out.
use serde::{Deserialize, Serialize};

use crate::error::RoomdropError;
use crate::types::now_ms;

/// Schema version written by this encoder.
pub const WIRE_VERSION: u32 = 1;

/// Broadcast unit describing one shared file.
///
/// Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    /// Producer-assigned Unix milliseconds.
    pub timestamp: u64,
    /// Sender identifier of the producing session.
    pub sender: String,
    pub file_name: String,
    pub file_type: String,
    /// Size in megabytes.
    pub file_size: f64,
    /// Content identifier assigned by the storage backend.
    pub file_id: String,
    pub is_encrypted: bool,
    /// Human-readable decryption condition; empty when not encrypted.
    pub access_condition: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireOut<'a> {
    v: u32,
    timestamp: u64,
    sender: &'a str,
    file_name: &'a str,
    file_type: &'a str,
    file_size: f64,
    file_id: &'a str,
    is_encrypted: bool,
    access_condition: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIn {
    #[serde(default = "first_version")]
    v: u32,
    timestamp: u64,
    sender: String,
    file_name: String,
    file_type: String,
    file_size: f64,
    file_id: String,
    #[serde(default)]
    is_encrypted: bool,
    #[serde(default)]
    access_condition: String,
}

fn first_version() -> u32 {
    1
}

impl AnnouncementRecord {
    /// An unencrypted record stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_size: f64,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_ms(),
            sender: sender.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            file_id: file_id.into(),
            is_encrypted: false,
            access_condition: String::new(),
        }
    }

    /// Mark the record as encrypted under the described condition.
    pub fn encrypted(mut self, access_condition: impl Into<String>) -> Self {
        self.is_encrypted = true;
        self.access_condition = access_condition.into();
        self
    }

    /// Serialize to the tagged MessagePack form.
    pub fn encode(&self) -> Result<Vec<u8>, RoomdropError> {
        let wire = WireOut {
            v: WIRE_VERSION,
            timestamp: self.timestamp,
            sender: &self.sender,
            file_name: &self.file_name,
            file_type: &self.file_type,
            file_size: self.file_size,
            file_id: &self.file_id,
            is_encrypted: self.is_encrypted,
            access_condition: &self.access_condition,
        };
        rmp_serde::to_vec_named(&wire).map_err(Into::into)
    }

    /// Parse a record. Truncated input, a wrong type on a required field or
    /// an empty `fileId` fail with [`RoomdropError::MalformedRecord`].
    pub fn decode(data: &[u8]) -> Result<Self, RoomdropError> {
        let wire: WireIn = rmp_serde::from_slice(data)?;

        if wire.file_id.trim().is_empty() {
            return Err(RoomdropError::MalformedRecord {
                reason: "fileId is empty".into(),
            });
        }
        if wire.v > WIRE_VERSION {
            tracing::debug!(version = wire.v, "decoding record from a newer schema");
        }

        Ok(Self {
            timestamp: wire.timestamp,
            sender: wire.sender,
            file_name: wire.file_name,
            file_type: wire.file_type,
            file_size: wire.file_size,
            file_id: wire.file_id,
            is_encrypted: wire.is_encrypted,
            access_condition: wire.access_condition,
        })
    }

    /// `(timestamp, sender, fileId)`: identifies one publication.
    pub fn dedup_key(&self) -> (u64, &str, &str) {
        (self.timestamp, &self.sender, &self.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AnnouncementRecord {
        AnnouncementRecord {
            timestamp: 1_708_000_000_000,
            sender: "a1b2c3d4e5f60718293a4b5c6d7e8f90deadbeefcafef00d".into(),
            file_name: "report.pdf".into(),
            file_type: "application/pdf".into(),
            file_size: 2.0,
            file_id: "sha256-9f86d081884c7d659a2feaa0c55ad015".into(),
            is_encrypted: false,
            access_condition: String::new(),
        }
    }

    #[test]
    fn roundtrip() {
        let record = sample().encrypted("balance > 0");
        let bytes = record.encode().unwrap();
        assert_eq!(AnnouncementRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn truncated_input_is_malformed() {
        let bytes = sample().encode().unwrap();
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            let err = AnnouncementRecord::decode(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, RoomdropError::MalformedRecord { .. }),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn missing_optional_fields_default() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Legacy<'a> {
            timestamp: u64,
            sender: &'a str,
            file_name: &'a str,
            file_type: &'a str,
            file_size: f64,
            file_id: &'a str,
        }

        let bytes = rmp_serde::to_vec_named(&Legacy {
            timestamp: 1,
            sender: "s",
            file_name: "a.txt",
            file_type: "text/plain",
            file_size: 0.5,
            file_id: "cid-1",
        })
        .unwrap();

        let record = AnnouncementRecord::decode(&bytes).unwrap();
        assert!(!record.is_encrypted);
        assert_eq!(record.access_condition, "");
        assert_eq!(record.file_id, "cid-1");
    }

    #[test]
    fn unknown_trailing_fields_are_ignored() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Newer<'a> {
            v: u32,
            timestamp: u64,
            sender: &'a str,
            file_name: &'a str,
            file_type: &'a str,
            file_size: f64,
            file_id: &'a str,
            is_encrypted: bool,
            access_condition: &'a str,
            thumbnail: Vec<u8>,
            chunk_count: u32,
        }

        let bytes = rmp_serde::to_vec_named(&Newer {
            v: 2,
            timestamp: 7,
            sender: "s",
            file_name: "a.png",
            file_type: "image/png",
            file_size: 1.25,
            file_id: "cid-2",
            is_encrypted: true,
            access_condition: "balance > 0",
            thumbnail: vec![1, 2, 3],
            chunk_count: 4,
        })
        .unwrap();

        let record = AnnouncementRecord::decode(&bytes).unwrap();
        assert_eq!(record.timestamp, 7);
        assert!(record.is_encrypted);
        assert_eq!(record.access_condition, "balance > 0");
    }

    #[test]
    fn type_mismatch_on_required_field_is_malformed() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wrong<'a> {
            timestamp: &'a str,
            sender: &'a str,
            file_name: &'a str,
            file_type: &'a str,
            file_size: f64,
            file_id: &'a str,
        }

        let bytes = rmp_serde::to_vec_named(&Wrong {
            timestamp: "yesterday",
            sender: "s",
            file_name: "a",
            file_type: "b",
            file_size: 1.0,
            file_id: "cid",
        })
        .unwrap();

        let err = AnnouncementRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, RoomdropError::MalformedRecord { .. }));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct NoId<'a> {
            timestamp: u64,
            sender: &'a str,
            file_name: &'a str,
            file_type: &'a str,
            file_size: f64,
        }

        let bytes = rmp_serde::to_vec_named(&NoId {
            timestamp: 1,
            sender: "s",
            file_name: "a",
            file_type: "b",
            file_size: 1.0,
        })
        .unwrap();

        let err = AnnouncementRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, RoomdropError::MalformedRecord { .. }));
    }

    #[test]
    fn empty_file_id_is_malformed() {
        let mut record = sample();
        record.file_id = String::new();
        let bytes = record.encode().unwrap();
        let err = AnnouncementRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, RoomdropError::MalformedRecord { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = AnnouncementRecord::decode(b"\xc1\xc1\xc1 not msgpack").unwrap_err();
        assert!(matches!(err, RoomdropError::MalformedRecord { .. }));
    }

    #[test]
    fn dedup_key_parts() {
        let record = sample();
        let (ts, sender, file_id) = record.dedup_key();
        assert_eq!(ts, record.timestamp);
        assert_eq!(sender, record.sender);
        assert_eq!(file_id, record.file_id);
    }
}
