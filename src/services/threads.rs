//! One thread per friend, stored at `~me/threads/<thread_id>`.
//!
//! Both participants are listed in each other's `#threads-<hash(user_id)>`
//! index, keyed by `hash(other_id)`. Streaming the index opens threads that
//! someone else started with us.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::crypto::{self, HashEncoding};
use crate::backend::graph::{self, Chain, Subscription};
use crate::backend::stream::{
    create_streamer, pump, DigestRegistry, OnceRegistry, StreamCallback, StreamContext, Streamer,
};
use crate::error::Result;
use crate::services::auth::AuthService;
use crate::services::friends::{Friend, FriendsService};
use crate::services::users::normalize_user_id;
use crate::services::ServiceSettings;

const TOP_NODE_NAME: &str = "threads";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThreadNode {
    pub friend_id: String,
    pub created_at: String,
    #[serde(rename = "latestContent$$")]
    pub latest_content: String,
    pub latest_at: String,
    pub latest_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    #[serde(rename = "content$$")]
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub friend: Friend,
    pub created_at: String,
    pub latest_content: String,
    pub latest_at: String,
    pub latest_mine: bool,
}

#[derive(Clone)]
pub struct ThreadsService {
    auth: AuthService,
    friends: FriendsService,
    settings: ServiceSettings,
}

impl ThreadsService {
    pub fn new(auth: AuthService, friends: FriendsService, settings: ServiceSettings) -> Self {
        Self {
            auth,
            friends,
            settings,
        }
    }

    pub fn user_threads_chain(&self) -> Result<Chain> {
        Ok(self.auth.user_chain()?.get(TOP_NODE_NAME))
    }

    pub fn index_chain(&self, user_id_hash: &str) -> Chain {
        self.auth
            .graph()
            .get(&format!("#{}-{}", TOP_NODE_NAME, user_id_hash))
    }

    pub fn calculate_thread_id(user_id: &str) -> String {
        crypto::hash(&format!("{}{}", TOP_NODE_NAME, user_id), HashEncoding::Hex)
    }

    /// Encrypts `raw_content` for the friend behind `friend_epub`.
    pub fn build_message(&self, friend_epub: &str, raw_content: &str) -> Result<MessageNode> {
        Ok(MessageNode {
            content: self.auth.encrypt_data(raw_content, Some(friend_epub))?,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    fn create_index(&self, source_user_id: &str, dest_user_id: &str) {
        let chain = self.index_chain(&crypto::hash(source_user_id, HashEncoding::Base64));
        let key = crypto::hash(dest_user_id, HashEncoding::Base64);
        if let Err(e) = graph::set_value(&chain, &key, dest_user_id) {
            tracing::debug!(soul = %chain.soul(), error = %e, "thread index entry kept");
        }
    }

    pub fn extract_node_data(&self, node: &Value, key: &str) -> Option<Thread> {
        let node: ThreadNode = serde_json::from_value(node.clone()).ok()?;
        if node.friend_id.is_empty() {
            return None;
        }
        let friend = self.friends.get_by_friend_id(&node.friend_id).ok().flatten()?;

        let mut latest_content = String::new();
        if !node.latest_content.is_empty() {
            match self
                .auth
                .decrypt_data(&node.latest_content, Some(&friend.profile.epub))
            {
                Ok(raw) => latest_content = raw,
                Err(e) => tracing::debug!(thread = %key, error = %e, "latest content unreadable"),
            }
        }
        let latest_at = if node.latest_at.is_empty() {
            Utc::now().to_rfc3339()
        } else {
            node.latest_at
        };

        Some(Thread {
            id: key.to_string(),
            friend,
            created_at: node.created_at,
            latest_content,
            latest_at,
            latest_mine: node.latest_mine,
        })
    }

    /// Opens a thread with `user_id`, befriending them first if needed.
    /// Returns the thread id.
    pub fn create_thread(&self, user_id: &str, first_message: Option<&str>) -> Result<String> {
        let friend = match self.friends.get_by_user_id(user_id)? {
            Some(friend) => friend,
            None => self.friends.add_friend(user_id)?,
        };

        // 1. Thread
        let thread_id = Self::calculate_thread_id(&friend.profile.id);
        let message = first_message
            .filter(|raw| !raw.is_empty())
            .map(|raw| self.build_message(&friend.profile.epub, raw))
            .transpose()?;
        let node = ThreadNode {
            friend_id: friend.id.clone(),
            created_at: Utc::now().to_rfc3339(),
            latest_content: message.as_ref().map(|m| m.content.clone()).unwrap_or_default(),
            latest_at: message.map(|m| m.created_at).unwrap_or_default(),
            latest_mine: true,
        };
        graph::put_value(&self.user_threads_chain()?.get(&thread_id), &node)?;

        // 2. Indexes in both directions
        let me = self.auth.user_id()?;
        self.create_index(&me, &friend.profile.id);
        self.create_index(&friend.profile.id, &me);

        tracing::info!(%thread_id, friend = %friend.profile.id, "thread created");
        Ok(thread_id)
    }

    pub fn stream_by_thread_id(&self, thread_id: &str, callback: StreamCallback<Thread>) -> Result<StreamContext> {
        let chain = self.user_threads_chain()?.get(thread_id);
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        self.follow_thread(chain, streamer);
        Ok(context)
    }

    pub fn stream_by_user_id(&self, user_id: &str, callback: StreamCallback<Thread>) -> Result<StreamContext> {
        let me = self.auth.user_id()?;
        let chain = self
            .index_chain(&crypto::hash(&me, HashEncoding::Base64))
            .get(&crypto::hash(&normalize_user_id(user_id), HashEncoding::Base64));
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        self.follow_index(chain.on(), streamer, self.settings.debounce);
        Ok(context)
    }

    pub fn stream_list(&self, callback: StreamCallback<Thread>) -> Result<StreamContext> {
        let me = self.auth.user_id()?;
        let chain = self.index_chain(&crypto::hash(&me, HashEncoding::Base64));
        let streamer = create_streamer(callback, self.settings.stream);
        let context = streamer.context().clone();
        self.follow_index(chain.map_on(), streamer, None);
        Ok(context)
    }

    /// Snapshot of every indexed thread, newest first. Threads other users
    /// started with us are opened on the way.
    pub fn get_list(&self) -> Result<Vec<Thread>> {
        let me = self.auth.user_id()?;
        let index = self.index_chain(&crypto::hash(&me, HashEncoding::Base64));
        let mut threads = Vec::new();
        for key in index.keys() {
            let Some(target) = index.get(&key).read().and_then(|v| v.as_str().map(String::from)) else {
                continue;
            };
            if let Some(thread) = self.open_thread(&target)? {
                threads.push(thread);
            }
        }
        threads.sort_by(|a, b| b.latest_at.cmp(&a.latest_at));
        Ok(threads)
    }

    fn open_thread(&self, user_id: &str) -> Result<Option<Thread>> {
        let thread_id = Self::calculate_thread_id(user_id);
        let chain = self.user_threads_chain()?.get(&thread_id);
        let existing = chain
            .read()
            .and_then(|node| self.extract_node_data(&node, &thread_id));
        if existing.is_some() {
            return Ok(existing);
        }
        if let Err(e) = self.create_thread(user_id, None) {
            tracing::debug!(user = %user_id, error = %e, "could not open thread");
            return Ok(None);
        }
        Ok(chain
            .read()
            .and_then(|node| self.extract_node_data(&node, &thread_id)))
    }

    fn follow_index(&self, subscription: Subscription, streamer: Arc<Streamer<Thread>>, debounce: Option<Duration>) {
        let once = Arc::new(OnceRegistry::new());
        let service = self.clone();
        let context = streamer.context().clone();
        pump(subscription, context, debounce, move |delivery| {
            let once = once.clone();
            let streamer = streamer.clone();
            let service = service.clone();
            async move {
                if !once.first(&delivery.key) {
                    return;
                }
                match delivery.data.as_ref().and_then(Value::as_str) {
                    None => streamer.emit_value(None, true),
                    Some(target) => service.follow_thread_or_create(target, streamer),
                }
            }
        });
    }

    fn follow_thread_or_create(&self, user_id: &str, streamer: Arc<Streamer<Thread>>) {
        let thread_id = Self::calculate_thread_id(user_id);
        match self.open_thread(user_id) {
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(user = %user_id, error = %e, "thread stream skipped");
                return;
            }
        }
        match self.user_threads_chain() {
            Ok(threads) => self.follow_thread(threads.get(&thread_id), streamer),
            Err(e) => tracing::debug!(error = %e, "thread stream skipped"),
        }
    }

    fn follow_thread(&self, chain: Chain, streamer: Arc<Streamer<Thread>>) {
        let registry = Arc::new(DigestRegistry::new());
        let service = self.clone();
        let context = streamer.context().clone();
        pump(chain.on(), context, self.settings.debounce, move |delivery| {
            let registry = registry.clone();
            let streamer = streamer.clone();
            let service = service.clone();
            async move {
                if !registry.is_changed(&delivery.key, &delivery.data) {
                    return;
                }
                let thread = delivery
                    .data
                    .as_ref()
                    .and_then(|node| service.extract_node_data(node, &delivery.key));
                streamer.emit_value(thread, true);
            }
        });
    }
}
