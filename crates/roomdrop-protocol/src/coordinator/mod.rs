/// Transfer coordinator: send and receive pipelines.
///
/// Send: encrypt (optional) → upload → record in the sent list → announce.
/// Receive: self-filter → dedup by `fileId` → insert into the received list.
/// Downloads are explicit: fetch → decrypt (optional) → [`DownloadedFile`].
///
/// Lists live in `watch` channels so observers always see a consistent
/// snapshot; every mutation is a single `send_if_modified` call.
mod items;

pub use items::{
    guess_mime, DownloadedFile, RawFile, TransferItem, TransferStatus, ENCRYPTED_SUFFIX,
};

use std::sync::{Arc, RwLock, Weak};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::announcement::AnnouncementRecord;
use crate::config::{EncryptionSettings, TransferConfig};
use crate::error::RoomdropError;
use crate::gateway::{DecryptContext, EncryptionGateway, GatewayError};
use crate::identity::{SelfFilter, SenderIdentity};
use crate::integrity::matches_content_id;
use crate::metrics::TransferMetrics;
use crate::session::PeerSession;
use crate::storage::{ProgressSink, StorageBackend, StorageError, TimeoutStorage};
use crate::types::{size_in_mb, ItemId};

use items::strip_encrypted_suffix;

// ── Events and outcomes ───────────────────────────────────────────────

/// Events emitted by the coordinator, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { item_id: ItemId, percent: u8 },
    Sent { item_id: ItemId, file_id: String },
    Failed { item_id: ItemId, reason: String },
    /// The file is stored but the announcement was not accepted.
    PublishWarning { item_id: ItemId, reason: String },
    Received { item_id: ItemId, file_id: String },
}

/// Result of sending one file.
#[derive(Debug)]
pub enum SendOutcome {
    Sent {
        item_id: ItemId,
        file_id: String,
        /// Whether the local node accepted the announcement.
        published: bool,
    },
    Failed {
        item_id: ItemId,
        error: RoomdropError,
    },
}

impl SendOutcome {
    pub fn item_id(&self) -> &ItemId {
        match self {
            SendOutcome::Sent { item_id, .. } | SendOutcome::Failed { item_id, .. } => item_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// A running `send_files` batch.
pub struct BatchHandle {
    task: JoinHandle<Vec<SendOutcome>>,
}

impl BatchHandle {
    /// Wait for the batch; one outcome per submitted file, in order.
    pub async fn outcomes(self) -> Result<Vec<SendOutcome>, RoomdropError> {
        self.task
            .await
            .map_err(|e| RoomdropError::Task(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ── Coordinator ───────────────────────────────────────────────────────

struct Inner {
    session: PeerSession,
    storage: TimeoutStorage,
    gateway: Arc<dyn EncryptionGateway>,
    identity: SenderIdentity,
    self_filter: SelfFilter,
    encryption: RwLock<EncryptionSettings>,
    sent: watch::Sender<Vec<TransferItem>>,
    received: watch::Sender<Vec<TransferItem>>,
    uploading: watch::Sender<Vec<TransferItem>>,
    events: broadcast::Sender<TransferEvent>,
    metrics: TransferMetrics,
    /// Batches run one after another.
    batch_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the transfer coordinator. Cheap to clone.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    /// Build the coordinator and spawn the task consuming `records`.
    ///
    /// Must be called inside a tokio runtime. The consuming task ends when
    /// the last handle is dropped or `records` closes.
    pub fn spawn(
        config: TransferConfig,
        session: PeerSession,
        storage: Arc<dyn StorageBackend>,
        gateway: Arc<dyn EncryptionGateway>,
        identity: SenderIdentity,
        records: mpsc::Receiver<AnnouncementRecord>,
    ) -> Self {
        let (sent, _) = watch::channel(Vec::new());
        let (received, _) = watch::channel(Vec::new());
        let (uploading, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            session,
            storage: TimeoutStorage::new(storage, config.storage_timeout),
            gateway,
            identity,
            self_filter: SelfFilter::new(),
            encryption: RwLock::new(EncryptionSettings::disabled()),
            sent,
            received,
            uploading,
            events,
            metrics: TransferMetrics::default(),
            batch_lock: tokio::sync::Mutex::new(()),
            cancel: cancel.clone(),
        });

        tokio::spawn(receive_loop(Arc::downgrade(&inner), records, cancel));
        Self { inner }
    }

    // ── Settings ────────────────────────────────────────────────────

    /// Encryption applied to batches submitted from now on.
    pub fn set_encryption(&self, settings: EncryptionSettings) {
        *self
            .inner
            .encryption
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    pub fn encryption(&self) -> EncryptionSettings {
        self.inner
            .encryption
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sender_id(&self) -> String {
        self.inner.identity.sender_id()
    }

    // ── Send path ───────────────────────────────────────────────────

    /// Run a batch in the background. The caller is not blocked.
    pub fn send_files(&self, files: Vec<RawFile>) -> BatchHandle {
        let this = self.clone();
        BatchHandle {
            task: tokio::spawn(async move { this.send_batch(files).await }),
        }
    }

    /// Send files one after another. A failing file does not stop the batch.
    pub async fn send_batch(&self, files: Vec<RawFile>) -> Vec<SendOutcome> {
        let _batch = self.inner.batch_lock.lock().await;
        let encryption = self.encryption();

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            outcomes.push(self.send_one(file, &encryption).await);
        }
        outcomes
    }

    async fn send_one(&self, file: RawFile, encryption: &EncryptionSettings) -> SendOutcome {
        let item = TransferItem::outgoing(&file);
        let item_id = item.id.clone();
        self.inner.uploading.send_modify(|list| list.insert(0, item));

        let RawFile {
            name,
            mime_type,
            data,
        } = file;

        // 1. Encrypt
        let (payload, announced_name) = if encryption.enabled {
            self.update_uploading(&item_id, |item| {
                item.status = TransferStatus::Encrypting;
            });
            match self.inner.gateway.encrypt(&data, &encryption.condition).await {
                Ok(sealed) => (sealed, format!("{name}{ENCRYPTED_SUFFIX}")),
                Err(e) => return self.fail(&item_id, gateway_error(e, "")),
            }
        } else {
            (data, name)
        };

        let access_condition = if encryption.enabled {
            encryption.condition.description()
        } else {
            String::new()
        };
        let file_size = size_in_mb(payload.len());
        self.update_uploading(&item_id, |item| {
            item.status = TransferStatus::Uploading;
            item.file_name = announced_name.clone();
            item.file_size = file_size;
            item.is_encrypted = encryption.enabled;
            item.access_condition = access_condition.clone();
        });

        // 2. Upload
        let file_id = match self.upload(&item_id, payload).await {
            Ok(id) if !id.trim().is_empty() => id,
            Ok(_) => {
                return self.fail(
                    &item_id,
                    RoomdropError::Upload {
                        file_name: announced_name,
                        reason: "storage returned no content identifier".into(),
                    },
                )
            }
            Err(e) => {
                return self.fail(
                    &item_id,
                    RoomdropError::Upload {
                        file_name: announced_name,
                        reason: e.to_string(),
                    },
                )
            }
        };

        // 3. Record as sent
        let mut sent_item = None;
        self.inner.uploading.send_if_modified(|list| {
            let Some(pos) = list.iter().position(|i| i.id == item_id) else {
                return false;
            };
            let mut item = list.remove(pos);
            item.advance(100);
            item.file_id = Some(file_id.clone());
            item.status = TransferStatus::Sent;
            sent_item = Some(item);
            true
        });
        if let Some(item) = sent_item {
            self.inner.sent.send_modify(|list| list.insert(0, item));
        }
        self.inner.metrics.uploads_ok.inc();
        self.emit(TransferEvent::Sent {
            item_id: item_id.clone(),
            file_id: file_id.clone(),
        });

        // 4. Announce
        let sender = self.inner.identity.sender_id();
        let mut record =
            AnnouncementRecord::new(&sender, &announced_name, mime_type, file_size, &file_id);
        if encryption.enabled {
            record = record.encrypted(access_condition);
        }
        self.inner.self_filter.record(&sender);

        let published = match self.inner.session.publish_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(item = %item_id, file_id = %file_id, "stored but not announced: {e}");
                self.emit(TransferEvent::PublishWarning {
                    item_id: item_id.clone(),
                    reason: e.to_string(),
                });
                false
            }
        };

        tracing::info!(item = %item_id, file_id = %file_id, published, "file sent");
        SendOutcome::Sent {
            item_id,
            file_id,
            published,
        }
    }

    /// Upload while forwarding progress to the item and the event stream.
    async fn upload(&self, item_id: &ItemId, payload: Vec<u8>) -> Result<String, StorageError> {
        let (sink, mut progress) = ProgressSink::channel();
        let storage = &self.inner.storage;

        let upload = async move {
            let result = storage.upload(payload, &sink).await;
            drop(sink);
            result
        };
        let forward = async {
            while progress.changed().await.is_ok() {
                let percent = *progress.borrow_and_update();
                self.advance(item_id, percent);
            }
        };

        let (result, ()) = tokio::join!(upload, forward);
        result
    }

    fn advance(&self, item_id: &ItemId, percent: u8) {
        let mut advanced = false;
        self.inner.uploading.send_if_modified(|list| {
            if let Some(item) = list.iter_mut().find(|i| &i.id == item_id) {
                advanced = item.advance(percent);
            }
            advanced
        });
        if advanced {
            self.emit(TransferEvent::Progress {
                item_id: item_id.clone(),
                percent,
            });
        }
    }

    fn update_uploading(&self, item_id: &ItemId, update: impl FnOnce(&mut TransferItem)) {
        self.inner.uploading.send_if_modified(|list| {
            match list.iter_mut().find(|i| &i.id == item_id) {
                Some(item) => {
                    update(item);
                    true
                }
                None => false,
            }
        });
    }

    fn fail(&self, item_id: &ItemId, error: RoomdropError) -> SendOutcome {
        let reason = error.to_string();
        tracing::warn!(item = %item_id, "send failed: {reason}");
        self.update_uploading(item_id, |item| {
            item.status = TransferStatus::Failed(reason.clone());
        });
        self.inner.metrics.uploads_failed.inc();
        self.emit(TransferEvent::Failed {
            item_id: item_id.clone(),
            reason,
        });
        SendOutcome::Failed {
            item_id: item_id.clone(),
            error,
        }
    }

    // ── Receive path ────────────────────────────────────────────────

    /// Handle one decoded announcement.
    ///
    /// Returns the new item's id, or `None` when the record has no `fileId`,
    /// was self-echoed, or its `fileId` is already listed.
    pub fn on_announcement(&self, record: AnnouncementRecord) -> Option<ItemId> {
        if record.file_id.trim().is_empty() {
            tracing::debug!(sender = %record.sender, "ignoring announcement without file id");
            return None;
        }
        if self.inner.self_filter.is_self(&record) {
            self.inner.metrics.self_filtered.inc();
            tracing::debug!(file_id = %record.file_id, "ignoring own announcement");
            return None;
        }

        let mut inserted = None;
        self.inner.received.send_if_modified(|list| {
            if list
                .iter()
                .any(|i| i.file_id.as_deref() == Some(record.file_id.as_str()))
            {
                return false;
            }
            let item = TransferItem::incoming(&record);
            inserted = Some(item.id.clone());
            list.insert(0, item);
            true
        });

        match &inserted {
            Some(item_id) => {
                tracing::info!(item = %item_id, file_id = %record.file_id, name = %record.file_name, "file announced");
                self.emit(TransferEvent::Received {
                    item_id: item_id.clone(),
                    file_id: record.file_id,
                });
            }
            None => {
                self.inner.metrics.duplicates_dropped.inc();
                tracing::debug!(file_id = %record.file_id, "duplicate announcement");
            }
        }
        inserted
    }

    // ── Download ────────────────────────────────────────────────────

    /// Fetch (and decrypt) a listed file. Repeatable.
    pub async fn download_file(&self, item_id: &ItemId) -> Result<DownloadedFile, RoomdropError> {
        let item = self.find(item_id).ok_or_else(|| not_found(item_id))?;
        let file_id = item.file_id.clone().ok_or_else(|| not_found(item_id))?;

        let result = self.fetch(&item, &file_id).await;
        match &result {
            Ok(_) => {
                self.inner.metrics.downloads_ok.inc();
                tracing::info!(item = %item_id, file_id = %file_id, "download complete");
            }
            Err(e) => {
                self.inner.metrics.downloads_failed.inc();
                tracing::warn!(item = %item_id, file_id = %file_id, "download failed: {e}");
            }
        }
        result
    }

    async fn fetch(
        &self,
        item: &TransferItem,
        file_id: &str,
    ) -> Result<DownloadedFile, RoomdropError> {
        let bytes = self
            .inner
            .storage
            .download(file_id)
            .await
            .map_err(|e| RoomdropError::Download {
                file_id: file_id.to_string(),
                reason: e.to_string(),
            })?;
        if matches_content_id(file_id, &bytes) == Some(false) {
            return Err(RoomdropError::Download {
                file_id: file_id.to_string(),
                reason: "content does not match its identifier".into(),
            });
        }

        let data = if item.is_encrypted {
            let context = DecryptContext {
                file_id: file_id.to_string(),
                access_condition: item.access_condition.clone(),
            };
            self.inner
                .gateway
                .decrypt(&bytes, &context)
                .await
                .map_err(|e| gateway_error(e, &item.access_condition))?
        } else {
            bytes
        };

        Ok(DownloadedFile {
            item_id: item.id.clone(),
            file_name: strip_encrypted_suffix(&item.file_name).to_string(),
            file_type: item.file_type.clone(),
            data,
        })
    }

    /// Content identifier of an item, for sharing out of band.
    pub fn copy_identifier(&self, item_id: &ItemId) -> Result<String, RoomdropError> {
        self.find(item_id)
            .and_then(|item| item.file_id)
            .ok_or_else(|| not_found(item_id))
    }

    fn find(&self, item_id: &ItemId) -> Option<TransferItem> {
        [&self.inner.received, &self.inner.sent, &self.inner.uploading]
            .into_iter()
            .find_map(|list| list.borrow().iter().find(|i| &i.id == item_id).cloned())
    }

    // ── Observers ───────────────────────────────────────────────────

    /// Sent items, most recent first.
    pub fn sent_items(&self) -> Vec<TransferItem> {
        self.inner.sent.borrow().clone()
    }

    /// Received items, most recent first.
    pub fn received_items(&self) -> Vec<TransferItem> {
        self.inner.received.borrow().clone()
    }

    /// Items in flight and items that failed, most recent first.
    pub fn uploading_items(&self) -> Vec<TransferItem> {
        self.inner.uploading.borrow().clone()
    }

    pub fn watch_sent(&self) -> watch::Receiver<Vec<TransferItem>> {
        self.inner.sent.subscribe()
    }

    pub fn watch_received(&self) -> watch::Receiver<Vec<TransferItem>> {
        self.inner.received.subscribe()
    }

    pub fn watch_uploading(&self) -> watch::Receiver<Vec<TransferItem>> {
        self.inner.uploading.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> &PeerSession {
        &self.inner.session
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.inner.metrics
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn not_found(item_id: &ItemId) -> RoomdropError {
    RoomdropError::NotFound {
        id: item_id.to_string(),
    }
}

/// Keep "condition not satisfied" distinct; prefer the announced condition text.
fn gateway_error(error: GatewayError, announced: &str) -> RoomdropError {
    match error {
        GatewayError::ConditionNotSatisfied(sealed) => RoomdropError::ConditionNotSatisfied {
            condition: if announced.is_empty() {
                sealed
            } else {
                announced.to_string()
            },
        },
        GatewayError::Failed(reason) => RoomdropError::Encryption(reason),
    }
}

async fn receive_loop(
    inner: Weak<Inner>,
    mut records: mpsc::Receiver<AnnouncementRecord>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        TransferCoordinator { inner }.on_announcement(record);
    }
    tracing::debug!("receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::gateway::{LocalConditionGateway, StaticOracle};
    use crate::identity::InstallationToken;
    use crate::storage::MemoryStorage;
    use crate::session::SessionChannels;
    use roomdrop_transport::MemoryNetwork;

    fn coordinator() -> TransferCoordinator {
        coordinator_with(Arc::new(MemoryStorage::new()))
    }

    fn coordinator_with(storage: Arc<MemoryStorage>) -> TransferCoordinator {
        let network = MemoryNetwork::new();
        let SessionChannels { session, records } =
            PeerSession::new(SessionConfig::new(), Arc::new(network.factory()));
        TransferCoordinator::spawn(
            TransferConfig::default(),
            session,
            storage,
            Arc::new(LocalConditionGateway::new([0; 32], StaticOracle(true))),
            SenderIdentity::new(InstallationToken::generate()),
            records,
        )
    }

    fn record(sender: &str, file_id: &str) -> AnnouncementRecord {
        AnnouncementRecord::new(sender, "a.txt", "text/plain", 0.5, file_id)
    }

    #[tokio::test]
    async fn duplicate_file_id_is_listed_once() {
        let coordinator = coordinator();
        assert!(coordinator.on_announcement(record("peer-a", "cid-1")).is_some());
        assert!(coordinator.on_announcement(record("peer-b", "cid-1")).is_none());
        assert_eq!(coordinator.received_items().len(), 1);
        assert_eq!(coordinator.metrics().duplicates_dropped.get(), 1);
    }

    #[tokio::test]
    async fn received_list_is_most_recent_first() {
        let coordinator = coordinator();
        coordinator.on_announcement(record("peer", "cid-1"));
        coordinator.on_announcement(record("peer", "cid-2"));

        let ids: Vec<_> = coordinator
            .received_items()
            .into_iter()
            .filter_map(|i| i.file_id)
            .collect();
        assert_eq!(ids, vec!["cid-2".to_string(), "cid-1".to_string()]);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let coordinator = coordinator();
        let missing = ItemId::from("nope");
        assert!(matches!(
            coordinator.download_file(&missing).await,
            Err(RoomdropError::NotFound { .. })
        ));
        assert!(matches!(
            coordinator.copy_identifier(&missing),
            Err(RoomdropError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn copy_identifier_returns_file_id() {
        let coordinator = coordinator();
        let id = coordinator.on_announcement(record("peer", "cid-9")).unwrap();
        assert_eq!(coordinator.copy_identifier(&id).unwrap(), "cid-9");
    }

    #[tokio::test]
    async fn blank_file_id_is_not_listed() {
        let coordinator = coordinator();
        assert!(coordinator.on_announcement(record("peer", "")).is_none());
        assert!(coordinator.on_announcement(record("peer", "  ")).is_none());
        assert!(coordinator.received_items().is_empty());
    }

    #[tokio::test]
    async fn corrupted_content_fails_download() {
        let storage = Arc::new(MemoryStorage::new());
        let coordinator = coordinator_with(storage.clone());
        let (sink, _rx) = ProgressSink::channel();
        let file_id = storage.upload(b"original".to_vec(), &sink).await.unwrap();
        let id = coordinator.on_announcement(record("peer", &file_id)).unwrap();

        assert_eq!(coordinator.download_file(&id).await.unwrap().data, b"original".to_vec());

        storage.overwrite(&file_id, b"tampered".to_vec());
        let err = coordinator.download_file(&id).await.unwrap_err();
        assert!(
            matches!(err, RoomdropError::Download { ref reason, .. } if reason.contains("does not match")),
            "{err}"
        );
        assert_eq!(coordinator.metrics().downloads_failed.get(), 1);
    }

    #[test]
    fn gateway_errors_keep_condition_distinct() {
        let err = gateway_error(GatewayError::ConditionNotSatisfied("x > 1".into()), "balance > 0");
        assert!(matches!(
            err,
            RoomdropError::ConditionNotSatisfied { ref condition } if condition == "balance > 0"
        ));
        let err = gateway_error(GatewayError::Failed("bad tag".into()), "balance > 0");
        assert!(matches!(err, RoomdropError::Encryption(_)));
    }
}
