use crate::events::TransferEvent;
use crate::record::TransferRecord;
use log::debug;
use std::path::Path;
use std::sync::Arc;

pub type ListenerId = String;

/// Observer of one transfer. Every callback receives a snapshot of the record
/// taken when the event was raised.
///
/// All methods run on the callback context, one at a time, never on a
/// scheduler worker.
pub trait TransferListener: Send + Sync {
    fn on_start(&self, _record: &TransferRecord) {}

    fn on_progress(&self, _record: &TransferRecord) {}

    /// Follows an `on_progress` carrying the `Error` status.
    fn on_error(&self, _record: &TransferRecord) {}

    /// Follows an `on_progress` carrying the `Finish` status.
    fn on_finish(&self, _file: &Path, _record: &TransferRecord) {}

    fn on_remove(&self, _record: &TransferRecord) {}
}

/// Listeners of one task, kept in registration order.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    entries: Vec<(ListenerId, Arc<dyn TransferListener>)>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `id`, replacing a previous one in place.
    pub fn add(
        &mut self,
        id: impl Into<ListenerId>,
        listener: Arc<dyn TransferListener>,
    ) -> Option<Arc<dyn TransferListener>> {
        let id = id.into();
        match self.entries.iter_mut().find(|(key, _)| *key == id) {
            Some((_, slot)) => Some(std::mem::replace(slot, listener)),
            None => {
                self.entries.push((id, listener));
                None
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn TransferListener>> {
        let index = self.entries.iter().position(|(key, _)| key == id)?;
        Some(self.entries.remove(index).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn dispatch(&self, event: &TransferEvent) {
        debug!(
            "[Task {}] Dispatching {} to {} listeners",
            event.record().tag,
            event.kind(),
            self.entries.len()
        );
        for (_, listener) in &self.entries {
            match event {
                TransferEvent::Start(record) => listener.on_start(record),
                TransferEvent::Progress(record) => listener.on_progress(record),
                TransferEvent::Error(record) => {
                    listener.on_progress(record);
                    listener.on_error(record);
                }
                TransferEvent::Finish(file, record) => {
                    listener.on_progress(record);
                    listener.on_finish(file, record);
                }
                TransferEvent::Remove(record) => listener.on_remove(record),
            }
        }
    }
}
