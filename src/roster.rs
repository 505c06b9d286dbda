//! Tracked users and administrators.
//!
//! Both sets are small, read on every reply event and changed rarely, so they
//! live behind an `RwLock` and every change is written straight through to
//! its dataset.

use crate::core::{Dataset, Result, UserId};
use crate::storage::{decode_json, write_json, DatasetStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// On-disk shape of a user list. Older files hold a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UserListFile {
    Keyed(BTreeMap<String, Vec<UserId>>),
    Bare(Vec<UserId>),
}

impl UserListFile {
    fn into_ids(self, key: &str) -> BTreeSet<UserId> {
        match self {
            UserListFile::Keyed(mut lists) => {
                lists.remove(key).unwrap_or_default().into_iter().collect()
            }
            UserListFile::Bare(ids) => ids.into_iter().collect(),
        }
    }
}

#[derive(Serialize)]
struct TrackedUsersOut<'a> {
    target_users: &'a BTreeSet<UserId>,
}

#[derive(Serialize)]
struct AdminsOut<'a> {
    admin_users: &'a BTreeSet<UserId>,
}

fn list_key(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Admins => "admin_users",
        _ => "target_users",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Added,
    Removed,
    Unchanged,
    /// Administrators cannot be tracked.
    RejectedAdmin,
}

#[derive(Debug, Default, Clone)]
struct RosterState {
    tracked: BTreeSet<UserId>,
    admins: BTreeSet<UserId>,
}

pub struct Roster {
    store: Arc<dyn DatasetStore>,
    state: RwLock<RosterState>,
}

impl Roster {
    /// Build from already-loaded lists.
    pub fn from_files(
        store: Arc<dyn DatasetStore>,
        tracked: Option<UserListFile>,
        admins: Option<UserListFile>,
    ) -> Self {
        let state = RosterState {
            tracked: tracked
                .map(|file| file.into_ids(list_key(Dataset::TrackedUsers)))
                .unwrap_or_default(),
            admins: admins
                .map(|file| file.into_ids(list_key(Dataset::Admins)))
                .unwrap_or_default(),
        };
        Self {
            store,
            state: RwLock::new(state),
        }
    }

    pub fn load(store: Arc<dyn DatasetStore>) -> Result<Self> {
        let tracked = read_list(store.as_ref(), Dataset::TrackedUsers)?;
        let admins = read_list(store.as_ref(), Dataset::Admins)?;
        Ok(Self::from_files(store, tracked, admins))
    }

    /// Re-read both lists, picking up edits made by another process.
    pub fn reload(&self) -> Result<()> {
        let tracked = read_list(self.store.as_ref(), Dataset::TrackedUsers)?;
        let admins = read_list(self.store.as_ref(), Dataset::Admins)?;
        let mut state = self.state.write()?;
        state.tracked = tracked
            .map(|file| file.into_ids(list_key(Dataset::TrackedUsers)))
            .unwrap_or_default();
        state.admins = admins
            .map(|file| file.into_ids(list_key(Dataset::Admins)))
            .unwrap_or_default();
        Ok(())
    }

    pub fn is_tracked(&self, user_id: UserId) -> Result<bool> {
        Ok(self.state.read()?.tracked.contains(&user_id))
    }

    pub fn is_admin(&self, user_id: UserId) -> Result<bool> {
        Ok(self.state.read()?.admins.contains(&user_id))
    }

    pub fn tracked(&self) -> Result<BTreeSet<UserId>> {
        Ok(self.state.read()?.tracked.clone())
    }

    pub fn admins(&self) -> Result<BTreeSet<UserId>> {
        Ok(self.state.read()?.admins.clone())
    }

    pub fn add_tracked(&self, user_id: UserId) -> Result<RosterChange> {
        let mut state = self.state.write()?;
        if state.admins.contains(&user_id) {
            return Ok(RosterChange::RejectedAdmin);
        }
        let mut next = state.tracked.clone();
        if !next.insert(user_id) {
            return Ok(RosterChange::Unchanged);
        }
        self.write_tracked(&next)?;
        state.tracked = next;
        info!(user_id, "tracking user");
        Ok(RosterChange::Added)
    }

    pub fn remove_tracked(&self, user_id: UserId) -> Result<RosterChange> {
        let mut state = self.state.write()?;
        let mut next = state.tracked.clone();
        if !next.remove(&user_id) {
            return Ok(RosterChange::Unchanged);
        }
        self.write_tracked(&next)?;
        state.tracked = next;
        info!(user_id, "stopped tracking user");
        Ok(RosterChange::Removed)
    }

    /// Promote a user. A tracked user stops being tracked.
    ///
    /// The admin list is written first. If untracking then fails, the
    /// previous admin list is put back so neither file changes.
    pub fn add_admin(&self, user_id: UserId) -> Result<RosterChange> {
        let mut state = self.state.write()?;
        let mut admins = state.admins.clone();
        if !admins.insert(user_id) {
            return Ok(RosterChange::Unchanged);
        }
        self.write_admins(&admins)?;

        if state.tracked.contains(&user_id) {
            let mut tracked = state.tracked.clone();
            tracked.remove(&user_id);
            if let Err(err) = self.write_tracked(&tracked) {
                if let Err(rollback) = self.write_admins(&state.admins) {
                    warn!(user_id, error = %rollback, "failed to roll back admin list");
                }
                return Err(err);
            }
            state.tracked = tracked;
        }
        state.admins = admins;
        info!(user_id, "added administrator");
        Ok(RosterChange::Added)
    }

    fn write_tracked(&self, tracked: &BTreeSet<UserId>) -> Result<()> {
        write_json(
            self.store.as_ref(),
            Dataset::TrackedUsers,
            &TrackedUsersOut {
                target_users: tracked,
            },
        )
    }

    fn write_admins(&self, admins: &BTreeSet<UserId>) -> Result<()> {
        write_json(
            self.store.as_ref(),
            Dataset::Admins,
            &AdminsOut {
                admin_users: admins,
            },
        )
    }

    pub fn remove_admin(&self, user_id: UserId) -> Result<RosterChange> {
        let mut state = self.state.write()?;
        let mut admins = state.admins.clone();
        if !admins.remove(&user_id) {
            return Ok(RosterChange::Unchanged);
        }
        self.write_admins(&admins)?;
        state.admins = admins;
        info!(user_id, "removed administrator");
        Ok(RosterChange::Removed)
    }
}

/// Read one user list dataset, accepting either on-disk shape.
pub fn read_list(store: &dyn DatasetStore, dataset: Dataset) -> Result<Option<UserListFile>> {
    let Some(bytes) = store.read(dataset)? else {
        return Ok(None);
    };
    decode_json(store, dataset, &bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn store_with(dataset: Dataset, json: &str) -> Arc<dyn DatasetStore> {
        let store = InMemoryStore::new();
        store.write(dataset, json.as_bytes()).unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_load_accepts_keyed_and_bare_lists() {
        let store = store_with(Dataset::TrackedUsers, r#"{"target_users": [3, 1]}"#);
        store.write(Dataset::Admins, b"[9]").unwrap();

        let roster = Roster::load(store).unwrap();
        assert_eq!(roster.tracked().unwrap(), BTreeSet::from([1, 3]));
        assert!(roster.is_admin(9).unwrap());
        assert!(!roster.is_tracked(9).unwrap());
    }

    #[test]
    fn test_missing_lists_are_empty() {
        let roster = Roster::load(Arc::new(InMemoryStore::new())).unwrap();
        assert!(roster.tracked().unwrap().is_empty());
        assert!(roster.admins().unwrap().is_empty());
    }

    #[test]
    fn test_add_tracked_writes_keyed_file() {
        let store: Arc<dyn DatasetStore> = Arc::new(InMemoryStore::new());
        let roster = Roster::load(store.clone()).unwrap();

        assert_eq!(roster.add_tracked(5).unwrap(), RosterChange::Added);
        assert_eq!(roster.add_tracked(5).unwrap(), RosterChange::Unchanged);

        let bytes = store.read(Dataset::TrackedUsers).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, serde_json::json!({ "target_users": [5] }));
    }

    #[test]
    fn test_admin_cannot_be_tracked() {
        let store = store_with(Dataset::Admins, r#"{"admin_users": [1]}"#);
        let roster = Roster::load(store).unwrap();
        assert_eq!(roster.add_tracked(1).unwrap(), RosterChange::RejectedAdmin);
        assert!(!roster.is_tracked(1).unwrap());
    }

    #[test]
    fn test_promoting_tracked_user_untracks_them() {
        let store = store_with(Dataset::TrackedUsers, r#"{"target_users": [4]}"#);
        let roster = Roster::load(store.clone()).unwrap();
        roster.add_admin(1).unwrap();

        assert_eq!(roster.add_admin(4).unwrap(), RosterChange::Added);
        assert!(!roster.is_tracked(4).unwrap());

        let reloaded = Roster::load(store).unwrap();
        assert!(reloaded.is_admin(4).unwrap());
        assert!(reloaded.tracked().unwrap().is_empty());
    }

    #[test]
    fn test_remove_admin() {
        let store = store_with(Dataset::Admins, r#"{"admin_users": [1, 2]}"#);
        let roster = Roster::load(store).unwrap();
        assert_eq!(roster.remove_admin(2).unwrap(), RosterChange::Removed);
        assert_eq!(roster.remove_admin(2).unwrap(), RosterChange::Unchanged);
        assert_eq!(roster.admins().unwrap(), BTreeSet::from([1]));
    }

    /// Store that refuses writes to one dataset.
    struct RefusingStore {
        inner: InMemoryStore,
        refused: Dataset,
    }

    impl DatasetStore for RefusingStore {
        fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>> {
            self.inner.read(dataset)
        }

        fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
            if dataset == self.refused {
                return Err(crate::core::LedgerError::Io("disk full".to_string()));
            }
            self.inner.write(dataset, bytes)
        }

        fn remove(&self, dataset: Dataset) -> Result<bool> {
            self.inner.remove(dataset)
        }

        fn copy_to(&self, dataset: Dataset, dest: &std::path::Path) -> Result<bool> {
            self.inner.copy_to(dataset, dest)
        }

        fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<std::path::PathBuf>> {
            self.inner.quarantine(dataset, stamp)
        }

        fn location(&self, dataset: Dataset) -> String {
            self.inner.location(dataset)
        }
    }

    fn refusing(refused: Dataset) -> Arc<RefusingStore> {
        let inner = InMemoryStore::new();
        inner
            .write(Dataset::TrackedUsers, br#"{"target_users": [4]}"#)
            .unwrap();
        inner.write(Dataset::Admins, br#"{"admin_users": [1]}"#).unwrap();
        Arc::new(RefusingStore { inner, refused })
    }

    #[test]
    fn test_failed_admin_write_leaves_user_tracked() {
        let store = refusing(Dataset::Admins);
        let roster = Roster::load(store.clone()).unwrap();

        assert!(roster.add_admin(4).is_err());
        assert!(roster.is_tracked(4).unwrap());
        assert!(!roster.is_admin(4).unwrap());

        let reloaded = Roster::load(store).unwrap();
        assert!(reloaded.is_tracked(4).unwrap());
        assert_eq!(reloaded.admins().unwrap(), BTreeSet::from([1]));
    }

    #[test]
    fn test_failed_untrack_rolls_back_admin_list() {
        let store = refusing(Dataset::TrackedUsers);
        let roster = Roster::load(store.clone()).unwrap();

        assert!(roster.add_admin(4).is_err());
        assert!(roster.is_tracked(4).unwrap());
        assert!(!roster.is_admin(4).unwrap());

        let reloaded = Roster::load(store).unwrap();
        assert!(reloaded.is_tracked(4).unwrap());
        assert_eq!(reloaded.admins().unwrap(), BTreeSet::from([1]));
    }
}
