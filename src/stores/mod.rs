//! Reactive caches fed by service streams.
//!
//! Every store keeps its maps for its whole life and only inserts or updates
//! entries in place, so a value held by a reader keeps its `Arc` identity
//! until that very entry changes. Readers watch [`Store::subscribe`] for a
//! new revision and re-read what they need.

pub mod friends;
pub mod me;
pub mod messages;
pub mod threads;
pub mod users;

pub use friends::{FriendWithDigest, FriendsState, FriendsStore};
pub use me::{MeState, MeStore};
pub use messages::{MessagesState, MessagesStore};
pub use threads::{ThreadsState, ThreadsStore};
pub use users::{UsersState, UsersStore};

use parking_lot::RwLock;
use tokio::sync::watch;

/// View state of one cached entity.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderData<T> {
    Loading,
    Empty,
    Ready(T),
}

impl<T> Default for RenderData<T> {
    fn default() -> Self {
        Self::Loading
    }
}

impl<T> RenderData<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Ready(value),
            None => Self::Empty,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn ready_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }
}

pub struct Store<S> {
    state: RwLock<S>,
    revision: watch::Sender<u64>,
}

impl<S: Default> Default for Store<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> Store<S> {
    pub fn new(state: S) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(state),
            revision,
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutates the state in place and publishes a new revision.
    pub fn commit<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = f(&mut self.state.write());
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    /// Like [`Store::commit`], but `f` decides under the same write lock
    /// whether anything changed. Only a `true` publishes a revision.
    pub fn commit_if(&self, f: impl FnOnce(&mut S) -> bool) -> bool {
        let changed = f(&mut self.state.write());
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_render_data_states() {
        let loading: RenderData<u8> = RenderData::default();
        assert!(loading.is_loading());
        assert!(RenderData::<u8>::from_option(None).is_empty());
        assert_eq!(RenderData::from_option(Some(3)).ready(), Some(&3));
    }

    #[tokio::test]
    async fn test_commit_bumps_revision() {
        let store: Store<HashMap<String, u32>> = Store::default();
        let mut rx = store.subscribe();

        store.commit(|state| state.insert("a".into(), 1));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(store.revision(), 1);
        assert_eq!(store.read(|state| state.get("a").copied()), Some(1));
    }

    #[test]
    fn test_commit_if_publishes_only_changes() {
        let store: Store<HashMap<String, u32>> = Store::default();
        let insert_once = |state: &mut HashMap<String, u32>| {
            if state.contains_key("a") {
                return false;
            }
            state.insert("a".into(), 1);
            true
        };

        assert!(store.commit_if(insert_once));
        assert!(!store.commit_if(insert_once));
        assert_eq!(store.revision(), 1);
        assert_eq!(store.read(|state| state.len()), 1);
    }
}
