use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::stream::{DigestRegistry, OnceRegistry, StreamResult, Subscriptions};
use crate::error::Result;
use crate::services::friends::{Friend, FriendsService};
use crate::stores::{RenderData, Store};

#[derive(Debug, Clone)]
pub struct FriendWithDigest {
    pub digest: Option<String>,
    pub data: Arc<Friend>,
}

impl FriendWithDigest {
    fn new(friend: Friend) -> Self {
        Self {
            digest: DigestRegistry::digest(&friend),
            data: Arc::new(friend),
        }
    }
}

#[derive(Debug, Default)]
pub struct FriendsState {
    pub list: RenderData<HashMap<String, FriendWithDigest>>,
    pub cached_by_friend_ids: HashMap<String, RenderData<Arc<Friend>>>,
    pub cached_by_user_ids: HashMap<String, RenderData<Arc<Friend>>>,
}

#[derive(Clone, Default)]
pub struct FriendsStore {
    store: Arc<Store<FriendsState>>,
    once: Arc<OnceRegistry>,
    subscriptions: Arc<Subscriptions>,
}

impl FriendsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Store<FriendsState> {
        &self.store
    }

    /// Friends sorted by username.
    pub fn list(&self) -> RenderData<Vec<Arc<Friend>>> {
        self.store.read(|state| match &state.list {
            RenderData::Loading => RenderData::Loading,
            RenderData::Empty => RenderData::Empty,
            RenderData::Ready(items) => {
                let mut friends: Vec<Arc<Friend>> = items.values().map(|i| i.data.clone()).collect();
                friends.sort_by(|a, b| a.profile.username.cmp(&b.profile.username));
                RenderData::Ready(friends)
            }
        })
    }

    pub fn by_friend_id(&self, friend_id: &str) -> RenderData<Arc<Friend>> {
        self.store.read(|state| {
            state
                .cached_by_friend_ids
                .get(friend_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn by_user_id(&self, user_id: &str) -> RenderData<Arc<Friend>> {
        self.store.read(|state| {
            state
                .cached_by_user_ids
                .get(user_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Seeds the list from a snapshot, then keeps it current. Runs once per
    /// store.
    pub fn stream_friend_list(&self, friends: &FriendsService) -> Result<()> {
        if !self.once.first("friendsStore/streamFriendList") {
            return Ok(());
        }

        // 1. Seed
        let current = friends.get_list()?;
        if !current.is_empty() {
            self.store.commit(|state| {
                if let Some(list) = ready_list(&mut state.list) {
                    for (id, friend) in current {
                        list.insert(id, FriendWithDigest::new(friend));
                    }
                }
            });
        }

        // 2. Stream
        let store = self.store.clone();
        let context = friends.stream_list(Arc::new(move |result: StreamResult<Friend>| {
            let Some(friend) = result.data else {
                store.commit_if(|state| {
                    if !state.list.is_loading() {
                        return false;
                    }
                    state.list = RenderData::Empty;
                    true
                });
                return;
            };
            let item = FriendWithDigest::new(friend);
            store.commit_if(|state| merge_friend(&mut state.list, item));
        }))?;
        self.subscriptions.track(context);
        Ok(())
    }

    pub fn stream_user_by_friend_id(&self, friend_id: &str, friends: &FriendsService) -> Result<()> {
        if !self
            .once
            .first(&format!("friendsStore/streamUserByFriendId/{}", friend_id))
        {
            return Ok(());
        }
        let store = self.store.clone();
        let key = friend_id.to_string();
        let context = friends.stream_by_friend_id(
            friend_id,
            Arc::new(move |result: StreamResult<Friend>| {
                let entry = RenderData::from_option(result.data.map(Arc::new));
                store.commit(|state| state.cached_by_friend_ids.insert(key.clone(), entry));
            }),
        )?;
        self.subscriptions.track(context);
        Ok(())
    }

    pub fn stream_user_by_user_id(&self, user_id: &str, friends: &FriendsService) -> Result<()> {
        if !self
            .once
            .first(&format!("friendsStore/streamUserByUserId/{}", user_id))
        {
            return Ok(());
        }
        let store = self.store.clone();
        let key = user_id.to_string();
        let context = friends.stream_by_user_id(
            user_id,
            Arc::new(move |result: StreamResult<Friend>| {
                let entry = RenderData::from_option(result.data.map(Arc::new));
                store.commit(|state| state.cached_by_user_ids.insert(key.clone(), entry));
            }),
        )?;
        self.subscriptions.track(context);
        Ok(())
    }

    pub fn unstream(&self) {
        self.subscriptions.unstream_all();
    }
}

/// Inserts `item` unless the list already holds the same digest for it.
fn merge_friend(list: &mut RenderData<HashMap<String, FriendWithDigest>>, item: FriendWithDigest) -> bool {
    let unchanged = list
        .ready()
        .and_then(|items| items.get(&item.data.id))
        .is_some_and(|current| current.digest.is_some() && current.digest == item.digest);
    if unchanged {
        return false;
    }
    match ready_list(list) {
        Some(items) => {
            items.insert(item.data.id.clone(), item);
            true
        }
        None => false,
    }
}

fn ready_list(
    list: &mut RenderData<HashMap<String, FriendWithDigest>>,
) -> Option<&mut HashMap<String, FriendWithDigest>> {
    if list.ready().is_none() {
        *list = RenderData::Ready(HashMap::new());
    }
    list.ready_mut()
}
