pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod manager;
pub mod persistence;
pub mod progress;
pub mod record;
pub mod repository;
pub mod request;
pub mod scheduler;
pub mod schema;
pub mod stats;
pub mod status;
pub mod task;

pub use config::{TransferConfig, TransferConfigBuilder};
pub use error::TransferError;
pub use events::{CallbackContext, TransferEvent};
pub use listener::{ListenerId, ListenerRegistry, TransferListener};
pub use manager::TransferManager;
pub use persistence::{PersistenceType, TransferRecordStore, TransferTable};
pub use record::{RecordPatch, TransferRecord};
pub use request::TransferRequest;
pub use scheduler::{PriorityScheduler, UnitId};
pub use schema::{SCHEMA_VERSION, SchemaStore};
pub use status::TransferStatus;
pub use task::TransferTask;
