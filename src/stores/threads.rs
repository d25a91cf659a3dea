use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::stream::{OnceRegistry, StreamResult, Subscriptions};
use crate::error::Result;
use crate::services::threads::{Thread, ThreadsService};
use crate::stores::{RenderData, Store};

#[derive(Debug, Default)]
pub struct ThreadsState {
    pub list: RenderData<HashMap<String, Arc<Thread>>>,
}

#[derive(Clone, Default)]
pub struct ThreadsStore {
    store: Arc<Store<ThreadsState>>,
    once: Arc<OnceRegistry>,
    subscriptions: Arc<Subscriptions>,
}

impl ThreadsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Store<ThreadsState> {
        &self.store
    }

    /// Threads with the most recent activity first.
    pub fn list(&self) -> RenderData<Vec<Arc<Thread>>> {
        self.store.read(|state| match &state.list {
            RenderData::Loading => RenderData::Loading,
            RenderData::Empty => RenderData::Empty,
            RenderData::Ready(items) => {
                let mut threads: Vec<Arc<Thread>> = items.values().cloned().collect();
                threads.sort_by(|a, b| b.latest_at.cmp(&a.latest_at));
                RenderData::Ready(threads)
            }
        })
    }

    pub fn stream_thread_list(&self, threads: &ThreadsService) -> Result<()> {
        if !self.once.first("threadsStore/streamThreadList") {
            return Ok(());
        }
        let store = self.store.clone();
        let context = threads.stream_list(Arc::new(move |result: StreamResult<Thread>| {
            let Some(thread) = result.data else {
                store.commit_if(|state| {
                    if !state.list.is_loading() {
                        return false;
                    }
                    state.list = RenderData::Empty;
                    true
                });
                return;
            };
            store.commit(|state| {
                if state.list.ready().is_none() {
                    state.list = RenderData::Ready(HashMap::new());
                }
                if let Some(list) = state.list.ready_mut() {
                    list.insert(thread.id.clone(), Arc::new(thread));
                }
            });
        }))?;
        self.subscriptions.track(context);
        Ok(())
    }

    pub fn unstream(&self) {
        self.subscriptions.unstream_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::services::testing::{settle, signed_up};

    #[tokio::test]
    async fn test_thread_list_streams_existing_threads() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let bob_id = bob.auth.user_id().unwrap();
        alice.friends.add_friend(&bob_id).unwrap();

        alice.threads.create_thread(&bob_id, Some("hi bob")).unwrap();

        let store = ThreadsStore::new();
        assert!(store.list().is_loading());
        store.stream_thread_list(&alice.threads).unwrap();
        store.stream_thread_list(&alice.threads).unwrap();
        settle().await;

        let list = store.list();
        let threads = list.ready().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].friend.profile.username, "bob");
        assert_eq!(threads[0].latest_content, "hi bob");
    }

    #[tokio::test]
    async fn test_no_threads_becomes_empty() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let store = ThreadsStore::new();
        store.stream_thread_list(&alice.threads).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(store.list().is_empty());
    }
}
