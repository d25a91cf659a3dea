use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::stream::{OnceRegistry, StreamResult, Subscriptions};
use crate::error::Result;
use crate::services::friends::Friend;
use crate::services::messages::{Message, MessageWithContext, MessagesService};
use crate::services::users::User;
use crate::stores::{RenderData, Store};

type Conversation = HashMap<String, Arc<MessageWithContext>>;

#[derive(Debug, Default)]
pub struct MessagesState {
    pub cached_by_user_ids: HashMap<String, RenderData<Conversation>>,
}

#[derive(Clone, Default)]
pub struct MessagesStore {
    store: Arc<Store<MessagesState>>,
    once: Arc<OnceRegistry>,
    subscriptions: Arc<Subscriptions>,
}

impl MessagesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Store<MessagesState> {
        &self.store
    }

    /// Conversation with `user_id`, oldest first.
    pub fn by_user_id(&self, user_id: &str) -> RenderData<Vec<Arc<MessageWithContext>>> {
        self.store.read(|state| match state.cached_by_user_ids.get(user_id) {
            None | Some(RenderData::Loading) => RenderData::Loading,
            Some(RenderData::Empty) => RenderData::Empty,
            Some(RenderData::Ready(items)) => {
                let mut messages: Vec<_> = items.values().cloned().collect();
                messages.sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
                RenderData::Ready(messages)
            }
        })
    }

    /// Follows both sides of the conversation between `me` and `friend`.
    /// `on_message` sees every message the first time it lands in the store.
    pub fn stream_messages(
        &self,
        friend: &Friend,
        me: &User,
        messages: &MessagesService,
        on_message: impl Fn(Arc<MessageWithContext>) + Send + Sync + 'static,
    ) -> Result<()> {
        let key = format!("messagesStore/streamUserByUserId/{}-{}", friend.profile.id, me.id);
        if !self.once.first(&key) {
            return Ok(());
        }
        let on_message: Arc<dyn Fn(Arc<MessageWithContext>) + Send + Sync> = Arc::new(on_message);
        let user_id = friend.profile.id.clone();

        let mine = messages.stream_user_messages(
            &user_id,
            self.handler(user_id.clone(), None, on_message.clone()),
        )?;
        self.subscriptions.track(mine);
        if friend.profile.id != me.id {
            let theirs = messages.stream_friend_messages(
                &user_id,
                self.handler(user_id.clone(), Some(friend.clone()), on_message),
            )?;
            self.subscriptions.track(theirs);
        }
        Ok(())
    }

    pub fn unstream(&self) {
        self.subscriptions.unstream_all();
    }

    fn handler(
        &self,
        user_id: String,
        sender: Option<Friend>,
        on_message: Arc<dyn Fn(Arc<MessageWithContext>) + Send + Sync>,
    ) -> Arc<dyn Fn(StreamResult<Message>) + Send + Sync> {
        let store = self.store.clone();
        Arc::new(move |result: StreamResult<Message>| {
            let Some(message) = result.data else {
                store.commit_if(|state| {
                    let conversation = state
                        .cached_by_user_ids
                        .entry(user_id.clone())
                        .or_default();
                    if !conversation.is_loading() {
                        return false;
                    }
                    *conversation = RenderData::Empty;
                    true
                });
                return;
            };

            let entry = Arc::new(MessageWithContext {
                message,
                sender: sender.clone(),
            });
            let inserted = store.commit_if(|state| {
                let conversation = state
                    .cached_by_user_ids
                    .entry(user_id.clone())
                    .or_default();
                if conversation.ready().is_none() {
                    *conversation = RenderData::Ready(HashMap::new());
                }
                match conversation.ready_mut() {
                    Some(items) if !items.contains_key(&entry.message.id) => {
                        items.insert(entry.message.id.clone(), entry.clone());
                        true
                    }
                    _ => false,
                }
            });
            if inserted {
                on_message(entry);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::services::messages::new_message_id;
    use crate::services::testing::{settle, signed_up};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_conversation_merges_both_sides() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let alice_id = alice.auth.user_id().unwrap();
        let bob_id = bob.auth.user_id().unwrap();
        alice.threads.create_thread(&bob_id, None).unwrap();
        bob.threads.create_thread(&alice_id, None).unwrap();

        alice.messages.send_message(&bob_id, &new_message_id(), "hi bob").await.unwrap();
        bob.messages.send_message(&alice_id, &new_message_id(), "hi alice").await.unwrap();

        let friend = alice.friends.get_by_user_id(&bob_id).unwrap().unwrap();
        let me = alice.auth.get_profile().unwrap().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let store = MessagesStore::new();
        store
            .stream_messages(&friend, &me, &alice.messages, move |m| {
                sink.lock().push(m.message.content.clone())
            })
            .unwrap();
        store
            .stream_messages(&friend, &me, &alice.messages, |_| {})
            .unwrap();
        settle().await;

        let list = store.by_user_id(&bob_id);
        let conversation = list.ready().unwrap();
        assert_eq!(conversation.len(), 2);
        assert_eq!(seen.lock().len(), 2);
        let theirs = conversation.iter().find(|m| !m.is_mine()).unwrap();
        assert_eq!(theirs.message.content, "hi alice");
        assert_eq!(theirs.sender.as_ref().map(|f| f.id.clone()), Some(friend.id.clone()));

        let revision = store.store().revision();
        bob.messages.send_message(&alice_id, &new_message_id(), "again").await.unwrap();
        settle().await;
        assert_eq!(store.by_user_id(&bob_id).ready().map(Vec::len), Some(3));
        assert_eq!(store.store().revision(), revision + 1);
    }

    #[tokio::test]
    async fn test_late_empty_side_keeps_messages() {
        let store = MessagesStore::new();
        let mine = store.handler("~bob".into(), None, Arc::new(|_: Arc<MessageWithContext>| {}));
        let theirs = store.handler("~bob".into(), None, Arc::new(|_: Arc<MessageWithContext>| {}));
        let message = Message {
            id: "m1".into(),
            content: "hi".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
        };

        crate::backend::stream::emit_static_value(&mine, Some(message.clone()));
        crate::backend::stream::emit_static_value(&theirs, None);
        crate::backend::stream::emit_static_value(&mine, Some(message));

        assert_eq!(store.by_user_id("~bob").ready().map(Vec::len), Some(1));
        assert_eq!(store.store().revision(), 1);
    }

    #[tokio::test]
    async fn test_unstream_detaches_both_sides() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let bob_id = bob.auth.user_id().unwrap();
        let friend = alice.friends.add_friend(&bob_id).unwrap();
        let me = alice.auth.get_profile().unwrap().unwrap();

        let store = MessagesStore::new();
        store
            .stream_messages(&friend, &me, &alice.messages, |_| {})
            .unwrap();
        assert_eq!(db.listener_count(), 2);

        store.unstream();
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_conversation_becomes_empty() {
        let db = GraphDb::in_memory();
        let alice = signed_up(&db, "alice").await;
        let bob = signed_up(&db, "bob").await;
        let bob_id = bob.auth.user_id().unwrap();
        let friend = alice.friends.add_friend(&bob_id).unwrap();
        let me = alice.auth.get_profile().unwrap().unwrap();

        let store = MessagesStore::new();
        store
            .stream_messages(&friend, &me, &alice.messages, |_| {})
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(store.by_user_id(&bob_id).is_empty());
    }
}
