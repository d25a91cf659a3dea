use std::sync::Arc;

use crate::backend::stream::{OnceRegistry, StreamResult, Subscriptions};
use crate::services::auth::AuthService;
use crate::services::users::User;
use crate::stores::{RenderData, Store};

#[derive(Debug, Default)]
pub struct MeState {
    pub user: RenderData<Arc<User>>,
}

#[derive(Clone, Default)]
pub struct MeStore {
    store: Arc<Store<MeState>>,
    once: Arc<OnceRegistry>,
    subscriptions: Arc<Subscriptions>,
}

impl MeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Store<MeState> {
        &self.store
    }

    pub fn user(&self) -> RenderData<Arc<User>> {
        self.store.read(|state| state.user.clone())
    }

    pub fn stream_current_user(&self, auth: &AuthService) {
        if !self.once.first("meStore/streamCurrentUser") {
            return;
        }
        let store = self.store.clone();
        let context = auth.stream_profile(Arc::new(move |result: StreamResult<User>| {
            let user = RenderData::from_option(result.data.map(Arc::new));
            store.commit(|state| state.user = user);
        }));
        self.subscriptions.track(context);
    }

    pub fn unstream(&self) {
        self.subscriptions.unstream_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::services::testing::{fast_settings, settle, signed_up};
    use crate::services::{EditableProfile, Services};

    #[tokio::test]
    async fn test_current_user_follows_profile() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let store = MeStore::new();
        store.stream_current_user(&alice.auth);
        settle().await;
        assert_eq!(store.user().ready().map(|u| u.username.clone()), Some("alice".into()));

        alice
            .auth
            .update_profile(EditableProfile {
                avatar: Some("a.png".into()),
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(store.user().ready().and_then(|u| u.avatar.clone()), Some("a.png".into()));

        store.unstream();
        assert_eq!(db.listener_count(), 0);
        alice
            .auth
            .update_profile(EditableProfile {
                avatar: Some("b.png".into()),
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(store.user().ready().and_then(|u| u.avatar.clone()), Some("a.png".into()));
    }

    #[tokio::test]
    async fn test_signed_out_is_empty() {
        let services = Services::new(GraphDb::in_memory(), fast_settings());
        let store = MeStore::new();
        store.stream_current_user(&services.auth);
        assert!(store.user().is_empty());
    }
}
