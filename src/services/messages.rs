use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::graph::{self, Chain};
use crate::backend::stream::{create_streamer, pump, StreamCallback, StreamContext};
use crate::error::{ChatError, Result};
use crate::services::auth::AuthService;
use crate::services::friends::{Friend, FriendsService};
use crate::services::threads::{MessageNode, ThreadsService};
use crate::services::ServiceSettings;

const TOP_NODE_NAME: &str = "messages";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub created_at: String,
}

/// A message plus its author when it came from the friend's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithContext {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Friend>,
}

impl MessageWithContext {
    pub fn is_mine(&self) -> bool {
        self.sender.is_none()
    }
}

pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct MessagesService {
    auth: AuthService,
    friends: FriendsService,
    threads: ThreadsService,
    settings: ServiceSettings,
}

impl MessagesService {
    pub fn new(
        auth: AuthService,
        friends: FriendsService,
        threads: ThreadsService,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            auth,
            friends,
            threads,
            settings,
        }
    }

    pub fn user_messages_chain(&self) -> Result<Chain> {
        Ok(self.auth.user_chain()?.get(TOP_NODE_NAME))
    }

    pub fn get_friend_by_user_id_or_throw(&self, user_id: &str) -> Result<Friend> {
        self.friends
            .get_by_user_id(user_id)?
            .ok_or(ChatError::FriendNotFound)
    }

    /// `None` when the node is malformed or its content cannot be decrypted.
    pub fn extract_node_data(&self, friend: &Friend, node: &Value, key: &str) -> Option<Message> {
        let node: MessageNode = serde_json::from_value(node.clone()).ok()?;
        let content = match self.auth.decrypt_data(&node.content, Some(&friend.profile.epub)) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(message = %key, error = %e, "dropping unreadable message");
                return None;
            }
        };
        Some(Message {
            id: key.to_string(),
            content,
            created_at: node.created_at,
        })
    }

    pub async fn send_message(&self, user_id: &str, message_id: &str, raw_message: &str) -> Result<Message> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let thread_id = ThreadsService::calculate_thread_id(&friend.profile.id);
        let message = self.threads.build_message(&friend.profile.epub, raw_message)?;

        // 1. Message
        graph::put_value(
            &self.user_messages_chain()?.get(&thread_id).get(message_id),
            &message,
        )?;

        // 2. Thread preview
        let mut latest = Map::new();
        latest.insert("latestAt".into(), json!(message.created_at));
        latest.insert("latestContent$$".into(), json!(message.content));
        graph::set_values(
            &self.threads.user_threads_chain()?.get(&thread_id),
            latest,
            self.settings.retry_attempts,
            self.settings.retry_delay,
        )
        .await?;

        tracing::debug!(%thread_id, %message_id, "message sent");
        Ok(Message {
            id: message_id.to_string(),
            content: raw_message.to_string(),
            created_at: message.created_at,
        })
    }

    /// `~me/messages/<thread_id(friend)>`
    fn user_side(&self, friend: &Friend) -> Result<Chain> {
        let thread_id = ThreadsService::calculate_thread_id(&friend.profile.id);
        Ok(self.user_messages_chain()?.get(&thread_id))
    }

    /// `~friend/messages/<thread_id(me)>`
    fn friend_side(&self, friend: &Friend) -> Result<Chain> {
        let thread_id = ThreadsService::calculate_thread_id(&self.auth.user_id()?);
        Ok(self
            .auth
            .graph()
            .user(&friend.profile.pub_key)
            .get(TOP_NODE_NAME)
            .get(&thread_id))
    }

    /// Current messages we sent to `user_id`, then each new one as it lands.
    /// Unstream the returned context to stop.
    pub fn get_and_stream_user_messages(
        &self,
        user_id: &str,
        on_message: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(Vec<Message>, StreamContext)> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let chain = self.user_side(&friend)?;
        Ok(self.get_and_stream_messages(friend, chain, on_message))
    }

    pub fn get_and_stream_friend_messages(
        &self,
        user_id: &str,
        on_message: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(Vec<Message>, StreamContext)> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let chain = self.friend_side(&friend)?;
        Ok(self.get_and_stream_messages(friend, chain, on_message))
    }

    /// Both sides of the conversation with `user_id`, oldest first.
    pub fn get_conversation(&self, user_id: &str) -> Result<Vec<MessageWithContext>> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let mut conversation: Vec<MessageWithContext> = self
            .load_messages(&friend, &self.user_side(&friend)?)
            .into_iter()
            .map(|message| MessageWithContext {
                message,
                sender: None,
            })
            .collect();
        if friend.profile.id != self.auth.user_id()? {
            conversation.extend(
                self.load_messages(&friend, &self.friend_side(&friend)?)
                    .into_iter()
                    .map(|message| MessageWithContext {
                        message,
                        sender: Some(friend.clone()),
                    }),
            );
        }
        conversation.sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
        Ok(conversation)
    }

    fn load_messages(&self, friend: &Friend, chain: &Chain) -> Vec<Message> {
        chain
            .keys()
            .into_iter()
            .filter_map(|key| {
                let node = chain.get(&key).read()?;
                self.extract_node_data(friend, &node, &key)
            })
            .collect()
    }

    fn get_and_stream_messages(
        &self,
        friend: Friend,
        chain: Chain,
        on_message: impl Fn(Message) + Send + Sync + 'static,
    ) -> (Vec<Message>, StreamContext) {
        // 1. Load current messages
        let current = self.load_messages(&friend, &chain);

        // 2. Stream only new ones
        let loaded: HashSet<String> = current.iter().map(|m| m.id.clone()).collect();
        let loaded = Arc::new(Mutex::new(loaded));
        let on_message = Arc::new(on_message);
        let service = self.clone();
        let friend = Arc::new(friend);
        let context = StreamContext::new();
        pump(chain.map_on(), context.clone(), None, move |delivery| {
            let loaded = loaded.clone();
            let on_message = on_message.clone();
            let service = service.clone();
            let friend = friend.clone();
            async move {
                if !loaded.lock().insert(delivery.key.clone()) {
                    return;
                }
                if let Some(message) = delivery
                    .data
                    .as_ref()
                    .and_then(|node| service.extract_node_data(&friend, node, &delivery.key))
                {
                    on_message(message);
                }
            }
        });

        (current, context)
    }

    pub fn stream_user_messages(&self, user_id: &str, callback: StreamCallback<Message>) -> Result<StreamContext> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let chain = self.user_side(&friend)?;
        Ok(self.stream_messages(friend, chain, callback))
    }

    pub fn stream_friend_messages(&self, user_id: &str, callback: StreamCallback<Message>) -> Result<StreamContext> {
        let friend = self.get_friend_by_user_id_or_throw(user_id)?;
        let chain = self.friend_side(&friend)?;
        Ok(self.stream_messages(friend, chain, callback))
    }

    fn stream_messages(&self, friend: Friend, chain: Chain, callback: StreamCallback<Message>) -> StreamContext {
        let streamer = create_streamer(callback, self.settings.stream);
        let service = self.clone();
        let friend = Arc::new(friend);
        let context = streamer.context().clone();
        pump(chain.map_on(), context.clone(), None, move |delivery| {
            let streamer = streamer.clone();
            let service = service.clone();
            let friend = friend.clone();
            async move {
                let Some(node) = delivery.data.as_ref() else {
                    return;
                };
                let message = service.extract_node_data(&friend, node, &delivery.key);
                streamer.emit_value(message, true);
            }
        });
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::backend::stream::{callback, StreamResult};
    use crate::services::testing::{settle, signed_up};
    use crate::services::Services;

    async fn befriended(db: &GraphDb) -> (Services, Services, String, String) {
        let alice = signed_up(db, "alice").await;
        let bob = signed_up(db, "bob").await;
        let alice_id = alice.auth.user_id().unwrap();
        let bob_id = bob.auth.user_id().unwrap();
        alice.threads.create_thread(&bob_id, None).unwrap();
        bob.threads.create_thread(&alice_id, None).unwrap();
        (alice, bob, alice_id, bob_id)
    }

    #[tokio::test]
    async fn test_send_message_updates_thread() {
        let db = GraphDb::in_memory();
        let (alice, _bob, _, bob_id) = befriended(&db).await;

        let sent = alice.messages.send_message(&bob_id, "m1", "hello bob").await.unwrap();
        assert_eq!(sent.id, "m1");
        assert_eq!(sent.content, "hello bob");

        let threads = alice.threads.get_list().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].latest_content, "hello bob");
        assert_eq!(threads[0].latest_at, sent.created_at);
    }

    #[tokio::test]
    async fn test_send_to_stranger_fails() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let err = alice
            .messages
            .send_message(&bob.auth.user_id().unwrap(), "m1", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Friend not found!");
    }

    #[tokio::test]
    async fn test_conversation_merges_both_sides() {
        let db = GraphDb::in_memory();
        let (alice, bob, alice_id, bob_id) = befriended(&db).await;

        alice.messages.send_message(&bob_id, "a1", "hi bob").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        bob.messages.send_message(&alice_id, "b1", "hi alice").await.unwrap();

        let conversation = alice.messages.get_conversation(&bob_id).unwrap();
        let lines: Vec<(&str, bool)> = conversation
            .iter()
            .map(|m| (m.message.content.as_str(), m.is_mine()))
            .collect();
        assert_eq!(lines, vec![("hi bob", true), ("hi alice", false)]);
    }

    #[tokio::test]
    async fn test_get_and_stream_friend_messages_only_streams_new() {
        let db = GraphDb::in_memory();
        let (alice, bob, alice_id, bob_id) = befriended(&db).await;
        bob.messages.send_message(&alice_id, "b1", "first").await.unwrap();

        let streamed = Arc::new(Mutex::new(Vec::new()));
        let sink = streamed.clone();
        let (current, context) = alice
            .messages
            .get_and_stream_friend_messages(&bob_id, move |message| sink.lock().push(message.content))
            .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].content, "first");

        bob.messages.send_message(&alice_id, "b2", "second").await.unwrap();
        settle().await;
        assert_eq!(*streamed.lock(), vec!["second".to_string()]);

        context.unstream();
        bob.messages.send_message(&alice_id, "b3", "third").await.unwrap();
        settle().await;
        assert_eq!(streamed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_user_messages_drops_unreadable() {
        let db = GraphDb::in_memory();
        let (alice, _bob, _, bob_id) = befriended(&db).await;
        alice.messages.send_message(&bob_id, "m1", "readable").await.unwrap();
        let thread_id = ThreadsService::calculate_thread_id(&bob_id);
        alice
            .messages
            .user_messages_chain()
            .unwrap()
            .get(&thread_id)
            .get("m2")
            .put(json!({"content$$": "garbage", "createdAt": "2024-01-01T00:00:00Z"}))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        alice
            .messages
            .stream_user_messages(
                &bob_id,
                callback(move |result: StreamResult<Message>| {
                    sink.lock().push(result.data.map(|m| m.content));
                }),
            )
            .unwrap();
        settle().await;

        assert_eq!(*seen.lock(), vec![Some("readable".to_string()), None]);
    }
}
