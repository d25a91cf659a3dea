use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::stream::{OnceRegistry, StreamResult, Subscriptions};
use crate::services::users::{User, UsersService};
use crate::stores::{RenderData, Store};

#[derive(Debug, Default)]
pub struct UsersState {
    pub cached_by_ids: HashMap<String, RenderData<Arc<User>>>,
    pub cached_by_usernames: HashMap<String, RenderData<Arc<User>>>,
}

#[derive(Clone, Default)]
pub struct UsersStore {
    store: Arc<Store<UsersState>>,
    once: Arc<OnceRegistry>,
    subscriptions: Arc<Subscriptions>,
}

impl UsersStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Store<UsersState> {
        &self.store
    }

    pub fn by_id(&self, id: &str) -> RenderData<Arc<User>> {
        self.store
            .read(|state| state.cached_by_ids.get(id).cloned().unwrap_or_default())
    }

    pub fn by_username(&self, username: &str) -> RenderData<Arc<User>> {
        self.store.read(|state| {
            state
                .cached_by_usernames
                .get(username)
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn stream_user_by_id(&self, id: &str, users: &UsersService) {
        if !self.once.first(&format!("usersStore/streamUserById/{}", id)) {
            return;
        }
        let store = self.store.clone();
        let key = id.to_string();
        let context = users.stream_by_id(
            id,
            Arc::new(move |result: StreamResult<User>| {
                let entry = RenderData::from_option(result.data.map(Arc::new));
                store.commit(|state| state.cached_by_ids.insert(key.clone(), entry));
            }),
        );
        self.subscriptions.track(context);
    }

    pub fn stream_user_by_username(&self, username: &str, users: &UsersService) {
        if !self
            .once
            .first(&format!("usersStore/streamUserByUsername/{}", username))
        {
            return;
        }
        let store = self.store.clone();
        let key = username.to_string();
        let context = users.stream_by_username(
            username,
            Arc::new(move |result: StreamResult<User>| {
                let entry = RenderData::from_option(result.data.map(Arc::new));
                store.commit(|state| state.cached_by_usernames.insert(key.clone(), entry));
            }),
        );
        self.subscriptions.track(context);
    }

    pub fn unstream(&self) {
        self.subscriptions.unstream_all();
    }
}
