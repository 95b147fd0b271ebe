use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferStatus {
    #[default]
    None,
    Waiting,
    Loading,
    Pause,
    Error,
    Finish,
}

impl TransferStatus {
    /// Integer code stored in the `status` column.
    pub fn code(self) -> i64 {
        match self {
            TransferStatus::None => 0,
            TransferStatus::Waiting => 1,
            TransferStatus::Loading => 2,
            TransferStatus::Pause => 3,
            TransferStatus::Error => 4,
            TransferStatus::Finish => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TransferStatus::None),
            1 => Some(TransferStatus::Waiting),
            2 => Some(TransferStatus::Loading),
            3 => Some(TransferStatus::Pause),
            4 => Some(TransferStatus::Error),
            5 => Some(TransferStatus::Finish),
            _ => None,
        }
    }

    /// States from which `start()` enqueues a new execution.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            TransferStatus::None | TransferStatus::Pause | TransferStatus::Error
        )
    }

    /// Queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Waiting | TransferStatus::Loading)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::None => "None",
            TransferStatus::Waiting => "Waiting",
            TransferStatus::Loading => "Loading",
            TransferStatus::Pause => "Pause",
            TransferStatus::Error => "Error",
            TransferStatus::Finish => "Finish",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransferStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(TransferStatus::None),
            "Waiting" => Ok(TransferStatus::Waiting),
            "Loading" => Ok(TransferStatus::Loading),
            "Pause" => Ok(TransferStatus::Pause),
            "Error" => Ok(TransferStatus::Error),
            "Finish" => Ok(TransferStatus::Finish),
            _ => Err(()),
        }
    }
}
