use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
pub type RecordId = u64;

/// A named persisted collection. Each dataset maps to exactly one file in the
/// data directory plus its lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    /// The response ledger itself.
    Ledger,
    /// Messages still awaiting a reply.
    PendingCache,
    TrackedUsers,
    Admins,
    /// Buffer contents saved by a shutdown whose final flush failed.
    Recovery,
    /// High-water mark of issued record ids.
    Sequence,
}

impl Dataset {
    pub const ALL: [Dataset; 6] = [
        Dataset::Ledger,
        Dataset::PendingCache,
        Dataset::TrackedUsers,
        Dataset::Admins,
        Dataset::Recovery,
        Dataset::Sequence,
    ];

    /// Datasets copied into every backup. The recovery file is transient and
    /// the id sequence must never move backwards, so neither is backed up.
    pub const BACKED_UP: [Dataset; 4] = [
        Dataset::Ledger,
        Dataset::PendingCache,
        Dataset::TrackedUsers,
        Dataset::Admins,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Ledger => "response_data",
            Dataset::PendingCache => "message_cache",
            Dataset::TrackedUsers => "target_users",
            Dataset::Admins => "admin_users",
            Dataset::Recovery => "response_data.recovery",
            Dataset::Sequence => "record_sequence",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name())
    }

    pub fn from_name(name: &str) -> Option<Dataset> {
        Self::ALL
            .into_iter()
        .find(|dataset| dataset.name() == name)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_names_round_trip() {
        for dataset in Dataset::BACKED_UP {
            assert_eq!(Dataset::from_name(dataset.name()), Some(dataset));
        }
        assert_eq!(Dataset::from_name("response_data.recovery"), Some(Dataset::Recovery));
        assert_eq!(Dataset::from_name("record_sequence"), Some(Dataset::Sequence));
        assert!(!Dataset::BACKED_UP.contains(&Dataset::Sequence));
        assert_eq!(Dataset::from_name("nope"), None);
        assert_eq!(Dataset::Ledger.file_name(), "response_data.json");
    }
}
