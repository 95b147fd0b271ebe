use crate::error::TransferError;
use crate::events::{CallbackContext, TransferEvent};
use crate::listener::{ListenerId, ListenerRegistry, TransferListener};
use crate::manager::TransferManager;
use crate::persistence::TransferRecordStore;
use crate::record::{RecordPatch, TransferRecord, UNKNOWN_SIZE_SENTINEL};
use crate::scheduler::{PriorityScheduler, UnitId};
use crate::stats::SpeedMeter;
use crate::status::TransferStatus;
use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Response, StatusCode};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use url::Url;

/// How a body run ended when it did not fail.
enum Outcome {
    Finished(PathBuf),
    Paused,
    /// A newer start, a restart or a remove took over the task.
    Superseded,
}

/// One logical transfer and its lifecycle.
///
/// Caller-facing operations (`save`, `start`, `pause`, `restart`, `remove`)
/// are serialized with each other. The body runs on a scheduler worker and
/// observes pause requests between chunks.
pub struct TransferTask {
    tag: String,
    record: Mutex<TransferRecord>,
    listeners: Arc<Mutex<ListenerRegistry>>,

    store: TransferRecordStore,
    scheduler: Arc<PriorityScheduler>,
    callbacks: CallbackContext,
    client: Client,
    chunk_size: usize,
    manager: Weak<TransferManager>,

    pending_unit: Mutex<Option<UnitId>>,
    /// Bumped on every enqueue; a body only acts while it holds the latest value.
    generation: AtomicU64,
    /// Held by a running body so two bodies of this task never overlap.
    run_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    removed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransferTask {
    pub(crate) fn new(record: TransferRecord, manager: &Arc<TransferManager>) -> Arc<Self> {
        debug!(
            "[Task {}] Created for {} (status {})",
            record.tag, record.url, record.status
        );
        Arc::new(Self {
            tag: record.tag.clone(),
            record: Mutex::new(record),
            listeners: Arc::new(Mutex::new(ListenerRegistry::new())),
            store: manager.store().clone(),
            scheduler: Arc::clone(manager.scheduler()),
            callbacks: manager.callbacks().clone(),
            client: manager.client().clone(),
            chunk_size: manager.config().chunk_size.max(1),
            manager: Arc::downgrade(manager),
            pending_unit: Mutex::new(None),
            generation: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> TransferRecord {
        lock(&self.record).clone()
    }

    pub fn status(&self) -> TransferStatus {
        lock(&self.record).status
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    fn set_text(
        self: &Arc<Self>,
        field: &str,
        value: String,
        apply: impl FnOnce(&mut TransferRecord, String),
    ) -> &Arc<Self> {
        if value.trim().is_empty() {
            warn!("[Task {}] Ignoring blank {}", self.tag, field);
        } else {
            apply(&mut lock(&self.record), value);
        }
        self
    }

    pub fn folder(self: &Arc<Self>, folder: impl Into<String>) -> &Arc<Self> {
        self.set_text("folder", folder.into(), |r, v| r.folder = Some(v))
    }

    pub fn file_name(self: &Arc<Self>, name: impl Into<String>) -> &Arc<Self> {
        self.set_text("file name", name.into(), |r, v| r.file_name = Some(v))
    }

    /// Bytes are written to `folder/name` and renamed to the final path once complete.
    pub fn temp_file_name(self: &Arc<Self>, name: impl Into<String>) -> &Arc<Self> {
        self.set_text("temp file name", name.into(), |r, v| {
            r.temp_file_name = Some(v)
        })
    }

    pub fn file_suffix(self: &Arc<Self>, suffix: impl Into<String>) -> &Arc<Self> {
        self.set_text("file suffix", suffix.into(), |r, v| r.file_suffix = Some(v))
    }

    pub fn extra1(self: &Arc<Self>, value: impl Into<String>) -> &Arc<Self> {
        self.set_text("extra1", value.into(), |r, v| r.extra1 = Some(v))
    }

    pub fn priority(self: &Arc<Self>, priority: i32) -> &Arc<Self> {
        lock(&self.record).priority = priority;
        self
    }

    pub fn extra2(self: &Arc<Self>, payload: Vec<u8>) -> &Arc<Self> {
        lock(&self.record).extra2 = Some(payload);
        self
    }

    pub fn extra3(self: &Arc<Self>, payload: Vec<u8>) -> &Arc<Self> {
        lock(&self.record).extra3 = Some(payload);
        self
    }

    pub fn register(
        self: &Arc<Self>,
        id: impl Into<ListenerId>,
        listener: Arc<dyn TransferListener>,
    ) -> &Arc<Self> {
        let id = id.into();
        if lock(&self.listeners).add(id.clone(), listener).is_some() {
            debug!("[Task {}] Replaced listener {}", self.tag, id);
        }
        self
    }

    pub fn unregister(&self, id: &str) -> bool {
        lock(&self.listeners).remove(id).is_some()
    }

    /// Ids of the registered listeners, in registration order.
    pub fn listener_ids(&self) -> Vec<ListenerId> {
        lock(&self.listeners).ids().map(str::to_string).collect()
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Persists the record, deriving `file_path` from `folder/file_name` when both are set.
    pub async fn save(&self) -> Result<(), TransferError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_removed() {
            return Err(TransferError::TaskNotFound(self.tag.clone()));
        }
        let snapshot = {
            let mut record = lock(&self.record);
            if let Some(path) = record.derived_file_path() {
                record.file_path = Some(path.to_string_lossy().into_owned());
            }
            record.clone()
        };
        self.store.replace(&snapshot).await?;
        debug!("[Task {}] Saved", self.tag);
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TransferError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(self: &Arc<Self>) -> Result<(), TransferError> {
        self.ensure_saved().await?;

        let status = self.status();
        match status {
            TransferStatus::None | TransferStatus::Pause | TransferStatus::Error => {
                self.post_start(None).await?;
                self.post_waiting(None).await?;
                self.enqueue();
                Ok(())
            }
            TransferStatus::Finish => self.verify_finished().await,
            TransferStatus::Waiting | TransferStatus::Loading => {
                warn!(
                    "[Task {}] Already queued or running (status {}), start ignored",
                    self.tag, status
                );
                Ok(())
            }
        }
    }

    pub async fn pause(&self) -> Result<(), TransferError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.status() {
            TransferStatus::Waiting | TransferStatus::Loading => self.halt().await,
            other => {
                self.withdraw();
                warn!(
                    "[Task {}] Only waiting or loading tasks can pause, status is {}",
                    self.tag, other
                );
                Ok(())
            }
        }
    }

    /// Drops all downloaded bytes and runs the transfer again from zero.
    ///
    /// Waits for a running body to exit, which happens at its next chunk
    /// boundary.
    pub async fn restart(self: &Arc<Self>) -> Result<(), TransferError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_removed() {
            return Err(TransferError::TaskNotFound(self.tag.clone()));
        }
        self.halt().await?;
        self.supersede();
        let run_guard = self.run_lock.lock().await;

        let snapshot = self.record();
        self.delete_files(&snapshot).await;

        let snapshot = {
            let mut record = lock(&self.record);
            record.status = TransferStatus::None;
            record.current_size = 0;
            record.fraction = 0.0;
            record.speed = 0;
            record.error = None;
            record.clone()
        };
        self.store.replace(&snapshot).await?;
        info!("[Task {}] Restarting from scratch", self.tag);

        drop(run_guard);
        self.start_locked().await
    }

    /// Stops the task, forgets its record and detaches it. Calling it again is a no-op.
    ///
    /// Like `restart`, it waits for a running body to exit before touching files.
    pub async fn remove(&self, delete_file: bool) -> Result<(), TransferError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_removed() {
            debug!("[Task {}] Already removed", self.tag);
            return Ok(());
        }

        if self.status().is_active() {
            self.halt().await?;
        } else {
            self.withdraw();
        }
        self.supersede();
        let _run = self.run_lock.lock().await;
        self.removed.store(true, Ordering::Release);

        let snapshot = self.record();
        if delete_file {
            self.delete_files(&snapshot).await;
        }
        self.store.delete(&self.tag).await?;
        if let Some(manager) = self.manager.upgrade() {
            manager.detach(&self.tag, self);
        }

        let listeners = Arc::clone(&self.listeners);
        self.callbacks
            .post(move || {
                let registry = std::mem::take(&mut *lock(&listeners));
                registry.dispatch(&TransferEvent::Remove(snapshot));
            })
            .await;
        info!("[Task {}] Removed", self.tag);
        Ok(())
    }

    async fn ensure_saved(self: &Arc<Self>) -> Result<(), TransferError> {
        let in_table = self
            .manager
            .upgrade()
            .and_then(|manager| manager.get_task(&self.tag))
            .is_some_and(|task| Arc::ptr_eq(&task, self));
        if !in_table || self.is_removed() || self.store.get(&self.tag).await?.is_none() {
            return Err(TransferError::NotSaved(self.tag.clone()));
        }
        Ok(())
    }

    fn enqueue(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let priority = lock(&self.record).priority;
        let task = Arc::clone(self);
        let unit = self
            .scheduler
            .submit(priority, async move { task.run(generation).await });
        *lock(&self.pending_unit) = Some(unit);
        debug!(
            "[Task {}] Enqueued as unit {} (priority {}, generation {})",
            self.tag, unit, priority, generation
        );
    }

    fn withdraw(&self) {
        if let Some(unit) = lock(&self.pending_unit).take() {
            if self.scheduler.remove(unit) {
                debug!("[Task {}] Withdrew pending unit {}", self.tag, unit);
            }
        }
    }

    /// Invalidates whatever body is queued or running.
    fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Pause without the lifecycle lock. A loading body notices the flip and reports the pause itself.
    async fn halt(&self) -> Result<(), TransferError> {
        self.withdraw();
        let status = self.status();
        match status {
            TransferStatus::Waiting => self.post_pause(None).await,
            TransferStatus::Loading => {
                let mut record = lock(&self.record);
                record.speed = 0;
                record.status = TransferStatus::Pause;
                debug!("[Task {}] Pause requested while loading", self.tag);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn verify_finished(&self) -> Result<(), TransferError> {
        let snapshot = self.record();
        let Some(file_path) = snapshot.file_path.as_deref().map(PathBuf::from) else {
            return self
                .post_error(
                    None,
                    TransferError::Storage(format!(
                        "the file of task {} may be invalid or damaged, call restart() to download again",
                        self.tag
                    )),
                )
                .await;
        };

        let mut candidate = file_path.clone();
        if fs::metadata(&candidate).await.is_err() {
            if let Some(alternate) = snapshot.suffixed_file_path() {
                candidate = alternate;
            }
        }

        match fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() && meta.len() as i64 == snapshot.total_size => {
                debug!("[Task {}] Already finished at {}", self.tag, candidate.display());
                self.post_finish(None, candidate).await
            }
            _ => {
                self.post_error(
                    None,
                    TransferError::Storage(format!(
                        "the file {} may be invalid or damaged, call restart() to download again",
                        file_path.display()
                    )),
                )
                .await
            }
        }
    }

    async fn delete_files(&self, record: &TransferRecord) {
        if let Some(path) = record.file_path.as_deref() {
            remove_path(Path::new(path)).await;
        }
        if let Some(path) = record.temp_file_path() {
            remove_path(&path).await;
        }
    }

    // ------------------------------------------------------------------
    // body
    // ------------------------------------------------------------------

    fn is_current(&self, generation: u64) -> bool {
        !self.is_removed() && self.generation.load(Ordering::Acquire) == generation
    }

    fn is_loading(&self, generation: u64) -> bool {
        self.is_current(generation) && self.status() == TransferStatus::Loading
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let _run = self.run_lock.lock().await;
        if !self.is_current(generation) {
            debug!("[Task {}] Stale unit (generation {}) skipped", self.tag, generation);
            return;
        }
        {
            let mut record = lock(&self.record);
            if record.status != TransferStatus::Waiting {
                debug!(
                    "[Task {}] Left the queue as {}, nothing to run",
                    self.tag, record.status
                );
                return;
            }
            record.status = TransferStatus::Loading;
        }
        info!("[Task {}] Transfer started", self.tag);

        let result = match self.execute(generation).await {
            Ok(Outcome::Finished(path)) => {
                info!("[Task {}] Finished: {}", self.tag, path.display());
                self.post_finish(Some(generation), path).await
            }
            Ok(Outcome::Paused) => {
                info!("[Task {}] Paused", self.tag);
                self.post_pause(Some(generation)).await
            }
            Ok(Outcome::Superseded) => {
                debug!("[Task {}] Superseded, exiting quietly", self.tag);
                Ok(())
            }
            Err(e) => {
                error!("[Task {}] Transfer failed: {}", self.tag, e);
                self.post_error(Some(generation), e).await
            }
        };
        if let Err(e) = result {
            error!("[Task {}] Could not record the outcome: {}", self.tag, e);
        }
    }

    async fn execute(&self, generation: u64) -> Result<Outcome, TransferError> {
        // breakpoint check
        let mut start_position = {
            let mut record = lock(&self.record);
            if record.current_size < 0 {
                record.current_size = 0;
                record.speed = 0;
            }
            record.current_size
        };
        if start_position > 0 {
            let partial = {
                let record = lock(&self.record);
                record
                    .file_path
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .and(record.download_file_path())
            };
            if let Some(partial) = partial {
                if !path_exists(&partial).await {
                    debug!(
                        "[Task {}] Partial file {} is gone, starting over",
                        self.tag,
                        partial.display()
                    );
                    self.reset_position();
                    start_position = 0;
                }
            }
        }
        self.persist_progress(generation).await?;

        // request
        let (request, token) = {
            let record = lock(&self.record);
            (record.request.clone(), record.extra1.clone())
        };
        let mut extra: Vec<(&str, String)> = Vec::new();
        if start_position > 0 {
            if let Some(token) = token {
                extra.push(("If-Range", token));
                extra.push(("Range", format!("bytes={}-", start_position)));
            }
        }
        let response = request.to_reqwest(&self.client, &extra)?.send().await?;

        // response checks
        let code = response.status();
        debug!("[Task {}] Response {}", self.tag, code);
        if code == StatusCode::RANGE_NOT_SATISFIABLE {
            let mut record = lock(&self.record);
            record.extra1 = None;
            record.fraction = 0.0;
            record.current_size = 0;
            return Err(TransferError::ProtocolExpiry(
                "requested range not satisfiable, the file must be downloaded again".into(),
            ));
        }
        // 404, 5xx and any other refusal
        if !code.is_success() {
            return Err(TransferError::Network(format!(
                "server answered {} for {}",
                code, request.url
            )));
        }

        let token = change_token(response.headers());
        {
            let mut record = lock(&self.record);
            record.extra1 = token;
            if code == StatusCode::OK {
                // full body: whatever was on disk belongs to an older version
                record.current_size = 0;
                record.fraction = 0.0;
                record.total_size = -1;
                start_position = 0;
            }
        }
        self.persist_progress(generation).await?;

        // total size
        {
            let mut record = lock(&self.record);
            if !record.has_known_total() {
                record.total_size = match response.content_length() {
                    Some(length) if code == StatusCode::PARTIAL_CONTENT => {
                        length as i64 + start_position
                    }
                    Some(length) => length as i64,
                    None => UNKNOWN_SIZE_SENTINEL,
                };
            }
        }

        // file name and folder
        let url = lock(&self.record).url.clone();
        let (folder, download_path, total_size) = {
            let mut record = lock(&self.record);
            if record.file_name.as_deref().is_none_or(|n| n.trim().is_empty()) {
                let name = file_name_from_response(response.headers(), &url);
                debug!("[Task {}] Derived file name {}", self.tag, name);
                record.file_name = Some(name);
            }
            let folder = record
                .folder
                .clone()
                .filter(|f| !f.trim().is_empty())
                .ok_or_else(|| {
                    TransferError::Storage(format!("task {} has no folder", self.tag))
                })?;
            if record.file_path.as_deref().is_none_or(str::is_empty) {
                record.file_path = record
                    .derived_file_path()
                    .map(|p| p.to_string_lossy().into_owned());
            }
            let download_path = record.download_file_path().ok_or_else(|| {
                TransferError::Storage(format!("task {} has no file path", self.tag))
            })?;
            (PathBuf::from(folder), download_path, record.total_size)
        };
        fs::create_dir_all(&folder).await.map_err(|e| {
            TransferError::Storage(format!(
                "cannot create folder {}: {}",
                folder.display(),
                e
            ))
        })?;

        // pre-download checks
        let existing = fs::metadata(&download_path).await.ok().map(|m| m.len() as i64);
        if start_position > 0 && existing.is_none() {
            return Err(TransferError::ProtocolExpiry(format!(
                "partial file {} is missing",
                download_path.display()
            )));
        }
        if start_position > total_size {
            return Err(TransferError::ProtocolExpiry(format!(
                "resume position {} is past the total size {}",
                start_position, total_size
            )));
        }
        if start_position == 0 && existing.is_some() {
            debug!(
                "[Task {}] Removing stale file {}",
                self.tag,
                download_path.display()
            );
            remove_path(&download_path).await;
        }
        if start_position > 0 && start_position == total_size {
            return if existing == Some(start_position) {
                debug!("[Task {}] Nothing left to read", self.tag);
                Ok(Outcome::Finished(self.finalize(&download_path).await?))
            } else {
                Err(TransferError::ProtocolExpiry(format!(
                    "partial file {} does not match the recorded size",
                    download_path.display()
                )))
            };
        }

        // stream
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&download_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(start_position as u64)).await?;
        let snapshot = {
            let mut record = lock(&self.record);
            record.current_size = start_position;
            record.refresh_fraction();
            record.clone()
        };
        self.store.replace(&snapshot).await?;

        let streamed = self.stream_body(generation, response, &mut file).await;
        let flushed = file.flush().await;
        drop(file);
        streamed?;
        flushed?;

        // reconcile
        if !self.is_current(generation) {
            return Ok(Outcome::Superseded);
        }
        let (status, total_size) = {
            let record = lock(&self.record);
            (record.status, record.total_size)
        };
        match status {
            TransferStatus::Pause => Ok(Outcome::Paused),
            TransferStatus::Loading => {
                let length = fs::metadata(&download_path).await?.len() as i64;
                if length == total_size {
                    Ok(Outcome::Finished(self.finalize(&download_path).await?))
                } else {
                    Err(TransferError::ProtocolExpiry(format!(
                        "transfer ended at {} of {} bytes",
                        length, total_size
                    )))
                }
            }
            other => Err(TransferError::UnknownState(other.to_string())),
        }
    }

    async fn stream_body(
        &self,
        generation: u64,
        response: Response,
        file: &mut fs::File,
    ) -> Result<(), TransferError> {
        let mut stream = response.bytes_stream();
        let mut meter = SpeedMeter::new();

        'body: while let Some(item) = stream.next().await {
            let bytes = item?;
            for piece in bytes.chunks(self.chunk_size) {
                if !self.is_loading(generation) {
                    break 'body;
                }
                let len = piece.len() as i64;
                {
                    let record = lock(&self.record);
                    if record.has_known_total() && record.current_size + len > record.total_size {
                        return Err(TransferError::ProtocolExpiry(format!(
                            "server sent more than the declared {} bytes",
                            record.total_size
                        )));
                    }
                }
                file.write_all(piece).await?;

                let speed = meter.record(piece.len() as u64) as i64;
                let snapshot = {
                    let mut record = lock(&self.record);
                    record.current_size += len;
                    record.speed = speed;
                    record.refresh_fraction();
                    record.clone()
                };
                self.store
                    .update(&RecordPatch::progress(&snapshot), &self.tag)
                    .await?;
                self.notify(TransferEvent::Progress(snapshot)).await;
            }
        }

        debug!(
            "[Task {}] Read {} this run, {}/s on average",
            self.tag,
            bytesize::to_string(meter.total_bytes(), true),
            bytesize::to_string(meter.average(), true)
        );
        if self.is_loading(generation) {
            let mut record = lock(&self.record);
            if record.total_size == UNKNOWN_SIZE_SENTINEL {
                record.total_size = record.current_size;
                record.refresh_fraction();
            }
        }
        Ok(())
    }

    /// Moves a temp file to its final path and returns the path listeners see.
    async fn finalize(&self, download_path: &Path) -> Result<PathBuf, TransferError> {
        let final_path = {
            let record = lock(&self.record);
            match (record.temp_file_path(), record.file_path.as_deref()) {
                (Some(_), Some(file_path)) => PathBuf::from(file_path),
                _ => return Ok(download_path.to_path_buf()),
            }
        };
        fs::rename(download_path, &final_path).await.map_err(|e| {
            TransferError::Storage(format!(
                "cannot move {} to {}: {}",
                download_path.display(),
                final_path.display(),
                e
            ))
        })?;
        Ok(final_path)
    }

    fn reset_position(&self) {
        let mut record = lock(&self.record);
        record.speed = 0;
        record.current_size = 0;
        record.fraction = 0.0;
    }

    async fn persist_progress(&self, generation: u64) -> Result<(), TransferError> {
        let snapshot = self.record();
        if self.is_current(generation) {
            self.store
                .update(&RecordPatch::progress(&snapshot), &self.tag)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // notification: persist first, then deliver
    // ------------------------------------------------------------------

    /// Applies `change` unless the caller is a stale body or the task is gone.
    fn transition(
        &self,
        generation: Option<u64>,
        change: impl FnOnce(&mut TransferRecord),
    ) -> Option<TransferRecord> {
        let mut record = lock(&self.record);
        let current = match generation {
            Some(generation) => self.is_current(generation),
            None => !self.is_removed(),
        };
        if !current {
            return None;
        }
        change(&mut record);
        Some(record.clone())
    }

    async fn post(
        &self,
        generation: Option<u64>,
        change: impl FnOnce(&mut TransferRecord),
        event: impl FnOnce(TransferRecord) -> TransferEvent,
    ) -> Result<(), TransferError> {
        let Some(snapshot) = self.transition(generation, change) else {
            return Ok(());
        };
        self.store
            .update(&RecordPatch::progress(&snapshot), &self.tag)
            .await?;
        self.notify(event(snapshot)).await;
        Ok(())
    }

    async fn post_start(&self, generation: Option<u64>) -> Result<(), TransferError> {
        self.post(
            generation,
            |r| {
                r.speed = 0;
                r.status = TransferStatus::None;
                r.error = None;
            },
            TransferEvent::Start,
        )
        .await
    }

    async fn post_waiting(&self, generation: Option<u64>) -> Result<(), TransferError> {
        self.post(
            generation,
            |r| {
                r.speed = 0;
                r.status = TransferStatus::Waiting;
            },
            TransferEvent::Progress,
        )
        .await
    }

    async fn post_pause(&self, generation: Option<u64>) -> Result<(), TransferError> {
        self.post(
            generation,
            |r| {
                r.speed = 0;
                r.status = TransferStatus::Pause;
            },
            TransferEvent::Progress,
        )
        .await
    }

    async fn post_error(
        &self,
        generation: Option<u64>,
        cause: TransferError,
    ) -> Result<(), TransferError> {
        self.post(
            generation,
            |r| {
                r.speed = 0;
                r.status = TransferStatus::Error;
                r.error = Some(cause);
            },
            TransferEvent::Error,
        )
        .await
    }

    async fn post_finish(
        &self,
        generation: Option<u64>,
        file: PathBuf,
    ) -> Result<(), TransferError> {
        self.post(
            generation,
            |r| {
                r.speed = 0;
                r.fraction = 1.0;
                r.status = TransferStatus::Finish;
            },
            |snapshot| TransferEvent::Finish(file, snapshot),
        )
        .await
    }

    async fn notify(&self, event: TransferEvent) {
        let listeners = Arc::clone(&self.listeners);
        self.callbacks
            .post(move || {
                // listeners may (un)register from inside a callback
                let registry = lock(&listeners).clone();
                registry.dispatch(&event);
            })
            .await;
    }
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = lock(&self.record);
        f.debug_struct("TransferTask")
            .field("tag", &self.tag)
            .field("url", &record.url)
            .field("status", &record.status)
            .field("current_size", &record.current_size)
            .field("total_size", &record.total_size)
            .field("priority", &record.priority)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("removed", &self.is_removed())
            .finish()
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Deletes a file or folder; absence is not an error.
async fn remove_path(path: &Path) {
    let result = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not delete {}: {}", path.display(), e),
    }
}

/// ETag, else Last-Modified.
fn change_token(headers: &HeaderMap) -> Option<String> {
    [header::ETAG, header::LAST_MODIFIED]
        .iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Content-Disposition filename, else the last URL path segment, else a generated name.
pub(crate) fn file_name_from_response(headers: &HeaderMap, url: &str) -> String {
    content_disposition_name(headers)
        .or_else(|| url_file_name(url))
        .unwrap_or_else(|| format!("unknownfile_{}", Utc::now().timestamp_millis()))
}

fn content_disposition_name(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    value.split(';').find_map(|part| {
        let (key, raw) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        sanitize(raw.trim().trim_matches('"'))
    })
}

fn url_file_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    sanitize(segment)
}

fn sanitize(raw: &str) -> Option<String> {
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let name = decoded.replace(['/', '\\'], "_");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}
