/// Sender identity and self-filter.
///
/// A sender id is an installation token (survives restarts, stored in a
/// token file) followed by a session token (fresh for every
/// [`SenderIdentity`]). Both come from the thread-local CSPRNG.
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

use rand::RngCore;

use crate::announcement::AnnouncementRecord;
use crate::error::RoomdropError;

/// Random bytes in an installation token (hex-encoded on disk).
const INSTALLATION_TOKEN_BYTES: usize = 16;

/// Random bytes in a session token.
const SESSION_TOKEN_BYTES: usize = 8;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Long-lived per-installation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationToken(String);

impl InstallationToken {
    /// A fresh token that is not persisted anywhere.
    pub fn generate() -> Self {
        Self(random_hex(INSTALLATION_TOKEN_BYTES))
    }

    /// Read the token stored at `path`, or create and store a new one.
    ///
    /// A missing, unreadable or malformed file is replaced.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, RoomdropError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                if let Some(token) = Self::parse(raw.trim()) {
                    return Ok(token);
                }
                tracing::warn!(path = %path.display(), "installation token corrupt, regenerating");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "installation token unreadable ({e}), regenerating");
            }
        }

        let token = Self::generate();
        token.store(path)?;
        tracing::info!(path = %path.display(), "created installation token");
        Ok(token)
    }

    fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == INSTALLATION_TOKEN_BYTES * 2
            && raw.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(raw.to_ascii_lowercase()))
    }

    fn store(&self, path: &Path) -> Result<(), RoomdropError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.0.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Sender identifier for one session: installation token + session token.
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    installation: InstallationToken,
    session: String,
}

impl SenderIdentity {
    /// Pair the installation token with a fresh session token.
    pub fn new(installation: InstallationToken) -> Self {
        Self {
            installation,
            session: random_hex(SESSION_TOKEN_BYTES),
        }
    }

    pub fn installation(&self) -> &InstallationToken {
        &self.installation
    }

    pub fn session_token(&self) -> &str {
        &self.session
    }

    /// The value placed in `sender` of every record this session publishes.
    pub fn sender_id(&self) -> String {
        format!("{}{}", self.installation.0, self.session)
    }
}

/// Drops records this session published itself.
///
/// The coordinator records the sender id right before publishing; any
/// inbound record carrying that sender is discarded.
#[derive(Debug, Default)]
pub struct SelfFilter {
    last_sender: RwLock<Option<String>>,
}

impl SelfFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the sender id about to be used for a publish.
    pub fn record(&self, sender: &str) {
        let mut last = self
            .last_sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.as_deref() != Some(sender) {
            *last = Some(sender.to_string());
        }
    }

    /// Whether `record` came from this session.
    pub fn is_self(&self, record: &AnnouncementRecord) -> bool {
        self.last_sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_deref()
            == Some(record.sender.as_str())
    }
}
