use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::events::CallbackContext;
use crate::persistence::TransferRecordStore;
use crate::record::{RecordPatch, TransferRecord};
use crate::request::TransferRequest;
use crate::scheduler::PriorityScheduler;
use crate::status::TransferStatus;
use crate::task::TransferTask;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Owns the table of live transfer tasks and the collaborators they share.
pub struct TransferManager {
    config: Arc<TransferConfig>,
    store: TransferRecordStore,
    scheduler: Arc<PriorityScheduler>,
    callbacks: CallbackContext,
    client: Client,
    tasks: DashMap<String, Arc<TransferTask>>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        store: TransferRecordStore,
        scheduler: Arc<PriorityScheduler>,
        callbacks: CallbackContext,
    ) -> Result<Arc<Self>, TransferError> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.worker_threads)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| TransferError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            config: Arc::new(config),
            store,
            scheduler,
            callbacks,
            client,
            tasks: DashMap::new(),
        }))
    }

    /// Opens the configured store and starts a scheduler and callback context for it.
    pub async fn from_config(config: TransferConfig) -> Result<Arc<Self>, TransferError> {
        config.validate()?;
        let store = TransferRecordStore::open(&config.persistence_type, config.table).await?;
        let scheduler = Arc::new(PriorityScheduler::new(config.worker_threads));
        let callbacks = CallbackContext::new(config.callback_queue);
        info!(
            "[Manager] {:?} store on table {}, {} workers, folder {}",
            config.persistence_type,
            config.table.name(),
            config.worker_threads,
            config.folder.display()
        );
        Self::new(config, store, scheduler, callbacks)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn store(&self) -> &TransferRecordStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub fn callbacks(&self) -> &CallbackContext {
        &self.callbacks
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the task registered under `tag`, creating it when the tag is new.
    ///
    /// A new task starts in the configured folder and must be saved before it
    /// can start.
    pub fn request(
        self: &Arc<Self>,
        tag: impl Into<String>,
        request: TransferRequest,
    ) -> Result<Arc<TransferTask>, TransferError> {
        let tag = tag.into();
        if tag.trim().is_empty() {
            return Err(TransferError::Argument("tag must not be blank".into()));
        }

        let task = self
            .tasks
            .entry(tag.clone())
            .or_insert_with(|| {
                let mut record = TransferRecord::new(tag.clone(), request);
                record.folder = Some(self.config.folder.to_string_lossy().into_owned());
                TransferTask::new(record, self)
            })
            .clone();
        debug!("[Manager] Task {} requested", tag);
        Ok(task)
    }

    pub fn get_task(&self, tag: &str) -> Option<Arc<TransferTask>> {
        self.tasks.get(tag).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_task(&self, tag: &str) -> bool {
        self.tasks.contains_key(tag)
    }

    /// Every live task, oldest first.
    pub fn all_tasks(&self) -> Vec<Arc<TransferTask>> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tasks.sort_by_key(|task| (task.record().date, task.tag().to_string()));
        tasks
    }

    /// Detaches `tag` from the table without touching its record or files.
    pub fn remove_task(&self, tag: &str) -> Option<Arc<TransferTask>> {
        self.tasks.remove(tag).map(|(_, task)| task)
    }

    /// Detaches `task` only if it is still the one registered under `tag`.
    pub(crate) fn detach(&self, tag: &str, task: &TransferTask) {
        self.tasks
            .remove_if(tag, |_, current| std::ptr::eq(Arc::as_ptr(current), task));
    }

    /// Rebuilds tasks from the store. Transfers interrupted mid-flight come back paused.
    pub async fn restore(self: &Arc<Self>) -> Result<Vec<Arc<TransferTask>>, TransferError> {
        let records = self.store.load_all().await?;
        let mut restored = Vec::with_capacity(records.len());

        for mut record in records {
            if self.has_task(&record.tag) {
                debug!("[Manager] Task {} already live, not restored", record.tag);
                continue;
            }
            if record.status.is_active() {
                record.status = TransferStatus::Pause;
                record.speed = 0;
                let patch = RecordPatch {
                    status: Some(TransferStatus::Pause),
                    ..Default::default()
                };
                self.store.update(&patch, &record.tag).await?;
            }

            let tag = record.tag.clone();
            let task = TransferTask::new(record, self);
            self.tasks.insert(tag, Arc::clone(&task));
            restored.push(task);
        }

        info!("[Manager] Restored {} tasks", restored.len());
        Ok(restored)
    }

    /// Starts every task; failures are logged and do not stop the others.
    pub async fn start_all(&self) {
        for task in self.all_tasks() {
            if let Err(e) = task.start().await {
                error!("[Manager] Failed to start task {}: {}", task.tag(), e);
            }
        }
    }

    /// Pauses waiting tasks before loading ones, so no freed worker picks up a queued transfer.
    pub async fn pause_all(&self) {
        let tasks = self.all_tasks();
        let (waiting, others): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| task.status() == TransferStatus::Waiting);

        for task in waiting.iter().chain(others.iter()) {
            if !task.status().is_active() {
                continue;
            }
            if let Err(e) = task.pause().await {
                error!("[Manager] Failed to pause task {}: {}", task.tag(), e);
            }
        }
    }

    pub async fn remove_all(&self, delete_files: bool) -> Result<(), TransferError> {
        let tasks = self.all_tasks();
        let (waiting, others): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| task.status() == TransferStatus::Waiting);

        let mut first_error = None;
        for task in waiting.iter().chain(others.iter()) {
            if let Err(e) = task.remove(delete_files).await {
                warn!("[Manager] Failed to remove task {}: {}", task.tag(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits until every listener callback queued so far has run.
    pub async fn flush_callbacks(&self) {
        self.callbacks.flush().await;
    }

    pub async fn shutdown(&self) {
        self.pause_all().await;
        self.scheduler.shutdown().await;
        self.callbacks.flush().await;
        info!("[Manager] Shut down");
    }
}
