use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::crypto::{self, HashEncoding};
use crate::backend::graph::{self, Chain, Subscription};
use crate::backend::stream::{
    create_streamer, pump, DigestRegistry, StreamCallback, StreamContext, StreamResult, Streamer,
};
use crate::error::{ChatError, Result};
use crate::services::auth::AuthService;
use crate::services::users::{normalize_user_id, User, UsersService};
use crate::services::ServiceSettings;

const TOP_NODE_NAME: &str = "friends";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendNode {
    pub user_id: String,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub id: String,
    pub profile: User,
    pub active: bool,
    pub created_at: String,
}

#[derive(Clone)]
pub struct FriendsService {
    auth: AuthService,
    users: UsersService,
    settings: ServiceSettings,
}

impl FriendsService {
    pub fn new(auth: AuthService, users: UsersService, settings: ServiceSettings) -> Self {
        Self {
            auth,
            users,
            settings,
        }
    }

    /// `~me/friends`
    pub fn user_friends_chain(&self) -> Result<Chain> {
        Ok(self.auth.user_chain()?.get(TOP_NODE_NAME))
    }

    pub fn calculate_friend_id(user_id: &str) -> String {
        crypto::hash(&format!("{}{}", TOP_NODE_NAME, user_id), HashEncoding::Hex)
    }

    /// `None` when the node is malformed or the friend's profile is missing.
    pub fn extract_node_data(&self, node: &Value, key: &str) -> Option<Friend> {
        let node: FriendNode = serde_json::from_value(node.clone()).ok()?;
        let profile = self.users.get_by_id(&node.user_id)?;
        Some(Friend {
            id: key.to_string(),
            profile,
            active: node.active,
            created_at: node.created_at,
        })
    }

    pub fn add_friend(&self, user_id: &str) -> Result<Friend> {
        if self.get_by_user_id(user_id)?.is_some() {
            return Err(ChatError::FriendExists);
        }
        let user = self.users.get_by_id(user_id).ok_or(ChatError::UserNotFound)?;

        let friend_id = Self::calculate_friend_id(&user.id);
        let node = FriendNode {
            user_id: user.id.clone(),
            active: true,
            created_at: Utc::now().to_rfc3339(),
        };
        graph::put_value(&self.user_friends_chain()?.get(&friend_id), &node)?;
        tracing::info!(friend = %user.id, %friend_id, "friend added");

        Ok(Friend {
            id: friend_id,
            profile: user,
            active: node.active,
            created_at: node.created_at,
        })
    }

    pub fn get_by_friend_id(&self, friend_id: &str) -> Result<Option<Friend>> {
        let chain = self.user_friends_chain()?.get(friend_id);
        Ok(chain
            .read()
            .and_then(|node| self.extract_node_data(&node, friend_id)))
    }

    pub fn stream_by_friend_id(&self, friend_id: &str, callback: StreamCallback<Friend>) -> Result<StreamContext> {
        let chain = self.user_friends_chain()?.get(friend_id);
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        self.follow(chain.on(), streamer, self.settings.debounce);
        Ok(context)
    }

    pub fn get_by_user_id(&self, user_id: &str) -> Result<Option<Friend>> {
        self.get_by_friend_id(&Self::calculate_friend_id(&normalize_user_id(user_id)))
    }

    /// Resolves the user first, then follows the matching friend node.
    pub fn stream_by_user_id(&self, user_id: &str, callback: StreamCallback<Friend>) -> Result<StreamContext> {
        let friends = self.user_friends_chain()?;
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        let resolved = AtomicBool::new(false);
        let service = self.clone();
        let lookup = self.users.stream_by_id(
            user_id,
            Arc::new(move |result: StreamResult<User>| {
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                result.unstream();
                match result.data {
                    None => streamer.emit_value(None, true),
                    Some(user) => {
                        let chain = friends.get(&Self::calculate_friend_id(&user.id));
                        service.follow(chain.on(), streamer.clone(), service.settings.debounce);
                    }
                }
            }),
        );
        context.attach(lookup);
        Ok(context)
    }

    pub fn get_list(&self) -> Result<BTreeMap<String, Friend>> {
        let chain = self.user_friends_chain()?;
        let mut friends = BTreeMap::new();
        for id in chain.keys() {
            if let Some(friend) = self.get_by_friend_id(&id)? {
                friends.insert(id, friend);
            }
        }
        Ok(friends)
    }

    /// Every friend, then every change to any of them. Not debounced.
    pub fn stream_list(&self, callback: StreamCallback<Friend>) -> Result<StreamContext> {
        let chain = self.user_friends_chain()?;
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        self.follow(chain.map_on(), streamer, None);
        Ok(context)
    }

    fn follow(&self, subscription: Subscription, streamer: Arc<Streamer<Friend>>, debounce: Option<Duration>) {
        let registry = Arc::new(DigestRegistry::new());
        let service = self.clone();
        let context = streamer.context().clone();
        pump(subscription, context, debounce, move |delivery| {
            let registry = registry.clone();
            let streamer = streamer.clone();
            let service = service.clone();
            async move {
                if !registry.is_changed(&delivery.key, &delivery.data) {
                    return;
                }
                let friend = delivery
                    .data
                    .as_ref()
                    .and_then(|node| service.extract_node_data(node, &delivery.key));
                streamer.emit_value(friend, true);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::backend::stream::{callback, first_value};
    use crate::services::testing::{settle, signed_up};
    use parking_lot::Mutex;

    #[test]
    fn test_friend_id_is_stable_hex() {
        let id = FriendsService::calculate_friend_id("~abc");
        assert_eq!(id, crypto::hash("friends~abc", HashEncoding::Hex));
        assert_eq!(id.len(), 64);
    }

    #[tokio::test]
    async fn test_add_friend() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let bob_id = bob.auth.user_id().unwrap();

        let friend = alice.friends.add_friend(&bob_id).unwrap();
        assert_eq!(friend.id, FriendsService::calculate_friend_id(&bob_id));
        assert_eq!(friend.profile.username, "bob");
        assert!(friend.active);

        assert_eq!(alice.friends.get_by_user_id(&bob_id).unwrap(), Some(friend.clone()));
        assert_eq!(alice.friends.get_by_friend_id(&friend.id).unwrap(), Some(friend));

        let err = alice.friends.add_friend(&bob_id).unwrap_err();
        assert_eq!(err.to_string(), "Friend already exists");
        let err = alice.friends.add_friend("~nobody").unwrap_err();
        assert_eq!(err.to_string(), "User not found");
    }

    #[tokio::test]
    async fn test_stream_by_user_id() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let bob_id = bob.auth.user_id().unwrap();

        let missing = first_value(|cb| alice.friends.stream_by_user_id(&bob_id, cb))
            .await
            .unwrap();
        assert_eq!(missing, None);

        alice.friends.add_friend(&bob_id).unwrap();
        let found = first_value(|cb| alice.friends.stream_by_user_id(&bob_id, cb))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.profile.id, bob_id);
        settle().await;
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_list_and_stream_list() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let carol = signed_up(&db, "carol").await;
        alice.friends.add_friend(&bob.auth.user_id().unwrap()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        alice
            .friends
            .stream_list(callback(move |result: StreamResult<Friend>| {
                if let Some(friend) = result.data {
                    sink.lock().push(friend.profile.username);
                }
            }))
            .unwrap();
        settle().await;
        alice.friends.add_friend(&carol.auth.user_id().unwrap()).unwrap();
        settle().await;

        assert_eq!(*seen.lock(), vec!["bob".to_string(), "carol".to_string()]);
        let list = alice.friends.get_list().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_requires_session() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        alice.auth.sign_out().unwrap();
        assert!(matches!(alice.friends.get_list(), Err(ChatError::NoUser)));
        assert!(matches!(
            alice.friends.stream_list(callback(|_: StreamResult<Friend>| {})),
            Err(ChatError::NoUser)
        ));
    }
}
