use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::backend::graph::{self, Chain, GraphDb};
use crate::backend::stream::{create_streamer, pump, DigestRegistry, StreamCallback, StreamContext, Streamer};
use crate::services::ServiceSettings;

/// Raw fields of a `~<pub>` node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserNode {
    pub alias: String,
    #[serde(rename = "pub")]
    pub pub_key: Option<String>,
    pub epub: Option<String>,
    pub avatar: Option<String>,
    pub created_at: Option<String>,
    pub box_pub: Option<String>,
    pub box_priv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(rename = "pub")]
    pub pub_key: String,
    pub epub: String,
    pub box_pub: String,
    pub username: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: Option<String>,
}

/// User ids are the `~<pub>` soul; a bare `<pub>` is accepted too.
pub fn normalize_user_id(id: &str) -> String {
    format!("~{}", id.trim_start_matches('~'))
}

#[derive(Clone)]
pub struct UsersService {
    db: GraphDb,
    settings: ServiceSettings,
}

impl UsersService {
    pub fn new(db: GraphDb, settings: ServiceSettings) -> Self {
        Self { db, settings }
    }

    pub fn chain_by_id(&self, id: &str) -> Chain {
        self.db.user(id)
    }

    pub fn chain_by_username(&self, username: &str) -> Chain {
        self.db.alias(username)
    }

    /// A user is only complete once both key pairs are published.
    pub fn extract_node_data(node: &Value, key: &str) -> Option<User> {
        let node: UserNode = serde_json::from_value(node.clone()).ok()?;
        let pub_key = node.pub_key.filter(|k| !k.is_empty())?;
        let epub = node.epub.filter(|k| !k.is_empty())?;
        let box_pub = node.box_pub.filter(|k| !k.is_empty())?;
        Some(User {
            id: key.to_string(),
            pub_key,
            epub,
            box_pub,
            username: node.alias.clone(),
            name: node.alias,
            avatar: node.avatar,
            created_at: node.created_at,
        })
    }

    pub fn get_by_id(&self, id: &str) -> Option<User> {
        let chain = self.chain_by_id(id);
        chain
            .read()
            .and_then(|node| Self::extract_node_data(&node, chain.key()))
    }

    pub fn stream_by_id(&self, id: &str, callback: StreamCallback<User>) -> StreamContext {
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        follow_user(self.chain_by_id(id), streamer);
        context
    }

    pub fn get_by_username(&self, username: &str) -> Option<User> {
        let record = self.chain_by_username(username).read()?;
        let user_id = graph::extract_first_key(&record)?;
        self.get_by_id(&user_id)
    }

    pub fn stream_by_username(&self, username: &str, callback: StreamCallback<User>) -> StreamContext {
        let streamer = create_streamer(callback, self.settings.stream);
        let chain = self.chain_by_username(username);
        let registry = Arc::new(DigestRegistry::new());
        let context = streamer.context().clone();
        tracing::trace!(%username, "streaming user by alias");
        let service = self.clone();
        pump(chain.on(), context.clone(), None, move |delivery| {
            let registry = registry.clone();
            let streamer = streamer.clone();
            let service = service.clone();
            async move {
                if !registry.is_changed(&delivery.key, &delivery.data) {
                    return;
                }
                // follow the user soul itself, writes never land on the alias path
                match delivery.data.as_ref().and_then(graph::extract_first_key) {
                    Some(user_id) => follow_user(service.chain_by_id(&user_id), streamer),
                    None => streamer.emit_value(None, false),
                }
            }
        });
        context
    }
}

fn follow_user(chain: Chain, streamer: Arc<Streamer<User>>) {
    let registry = Arc::new(DigestRegistry::new());
    let context = streamer.context().clone();
    pump(chain.on(), context, None, move |delivery| {
        let registry = registry.clone();
        let streamer = streamer.clone();
        async move {
            if !registry.is_changed(&delivery.key, &delivery.data) {
                return;
            }
            let user = delivery
                .data
                .as_ref()
                .and_then(|node| UsersService::extract_node_data(node, &delivery.key));
            streamer.emit_value(user, true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stream::{callback, first_value, StreamResult};
    use crate::services::testing::{settle, signed_up};
    use crate::services::EditableProfile;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_extract_requires_published_keys() {
        let node = json!({"alias": "alice", "pub": "p", "epub": "e", "auth": "{}"});
        assert_eq!(UsersService::extract_node_data(&node, "~p"), None);

        let node = json!({"alias": "alice", "pub": "p", "epub": "e", "boxPub": "b", "avatar": "a.png"});
        let user = UsersService::extract_node_data(&node, "~p").unwrap();
        assert_eq!(user.id, "~p");
        assert_eq!(user.username, "alice");
        assert_eq!(user.name, "alice");
        assert_eq!(user.avatar.as_deref(), Some("a.png"));
    }

    #[test]
    fn test_normalize_user_id() {
        assert_eq!(normalize_user_id("abc"), "~abc");
        assert_eq!(normalize_user_id("~abc"), "~abc");
    }

    #[tokio::test]
    async fn test_get_by_id_and_username() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let id = alice.auth.user_id().unwrap();

        let by_id = alice.users.get_by_id(&id).unwrap();
        assert_eq!(by_id.id, id);
        assert_eq!(by_id.username, "alice");
        assert!(by_id.created_at.is_some());
        assert_eq!(alice.users.get_by_username("alice"), Some(by_id));
        assert_eq!(alice.users.get_by_username("nobody"), None);
    }

    #[tokio::test]
    async fn test_stream_by_username_follows_user() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;

        let user = first_value(|cb| {
            alice.users.stream_by_username("alice", cb);
            Ok(())
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(user.id, alice.auth.user_id().unwrap());
        settle().await;
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_by_id_reports_profile_updates_once() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let id = alice.auth.user_id().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        alice.users.stream_by_id(
            &id,
            callback(move |result: StreamResult<User>| {
                sink.lock().push(result.data.and_then(|u| u.avatar));
            }),
        );
        settle().await;
        alice
            .auth
            .update_profile(EditableProfile {
                avatar: Some("new.png".into()),
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(*seen.lock(), vec![None, Some("new.png".to_string())]);
    }

    #[tokio::test]
    async fn test_stream_by_username_reports_profile_updates() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        alice.users.stream_by_username(
            "alice",
            callback(move |result: StreamResult<User>| {
                sink.lock().push(result.data.map(|u| u.avatar));
            }),
        );
        settle().await;
        alice
            .auth
            .update_profile(EditableProfile {
                avatar: Some("new.png".into()),
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![Some(None), Some(Some("new.png".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_stream_by_unknown_username_times_out_empty() {
        let db = GraphDb::in_memory();
        let users = UsersService::new(db, crate::services::testing::fast_settings());
        let user = first_value(|cb| {
            users.stream_by_username("ghost", cb);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(user, None);
    }
}
