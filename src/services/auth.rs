use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

use crate::backend::account::{Accounts, Session};
use crate::backend::crypto::{self, BoxKeyPair, HashEncoding};
use crate::backend::graph::{self, Chain, GraphDb};
use crate::backend::identity;
use crate::backend::stream::{emit_static_value, retry, StreamCallback, StreamContext};
use crate::error::{ChatError, Result};
use crate::services::users::{User, UserNode, UsersService};
use crate::services::ServiceSettings;

/// Profile fields a user may change after registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditableProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Clone)]
pub struct AuthService {
    accounts: Accounts,
    users: UsersService,
    settings: ServiceSettings,
}

impl AuthService {
    pub fn new(accounts: Accounts, users: UsersService, settings: ServiceSettings) -> Self {
        Self {
            accounts,
            users,
            settings,
        }
    }

    pub fn graph(&self) -> &GraphDb {
        self.accounts.db()
    }

    pub fn current_user(&self) -> Result<Session> {
        self.accounts.current()
    }

    pub fn user_chain(&self) -> Result<Chain> {
        self.accounts.user_chain()
    }

    pub fn user_id(&self) -> Result<String> {
        Ok(self.current_user()?.user_id())
    }

    pub fn user_pub(&self) -> Result<String> {
        Ok(self.current_user()?.pair.pub_key())
    }

    pub fn user_epub(&self) -> Result<String> {
        Ok(self.current_user()?.pair.epub())
    }

    pub fn user_box_pair(&self) -> Result<BoxKeyPair> {
        self.current_user()?.box_pair.ok_or(ChatError::NoBoxPair)
    }

    pub fn user_box_pub(&self) -> Result<String> {
        Ok(self.user_box_pair()?.public_key())
    }

    /// HMAC of `data` keyed by the secret shared with `participant_epub`.
    pub fn hash_secret_data(&self, participant_epub: &str, data: &str) -> Result<String> {
        let session = self.current_user()?;
        let secret =
            crypto::secret(participant_epub, &session.pair).map_err(|_| ChatError::NoSecret)?;
        Ok(crypto::hash_secret(
            data,
            &URL_SAFE_NO_PAD.encode(secret),
            HashEncoding::Base64,
        ))
    }

    /// Encrypts for `receiver_epub`, or for the current user alone.
    pub fn encrypt_data(&self, raw: &str, receiver_epub: Option<&str>) -> Result<String> {
        if raw.is_empty() {
            return Err(ChatError::NoEncryptionData);
        }
        let key = self.symmetric_key(receiver_epub)?;
        crypto::encrypt(raw, &key).map_err(|_| ChatError::EncryptFailed)
    }

    pub fn decrypt_data(&self, cipher: &str, sender_epub: Option<&str>) -> Result<String> {
        if cipher.is_empty() {
            return Err(ChatError::NoEncryptionData);
        }
        let key = self.symmetric_key(sender_epub)?;
        match crypto::decrypt(cipher, &key) {
            Ok(raw) if !raw.is_empty() => Ok(raw),
            _ => Err(ChatError::DecryptFailed),
        }
    }

    fn symmetric_key(&self, peer_epub: Option<&str>) -> Result<[u8; 32]> {
        let session = self.current_user()?;
        match peer_epub {
            None => crypto::self_key(&session.pair),
            Some(epub) => crypto::secret(epub, &session.pair).map_err(|_| ChatError::NoSecret),
        }
    }

    /// Seals `raw` for the owner of `receiver_box_pub`. No shared secret is
    /// needed.
    pub fn seal_for(&self, receiver_box_pub: &str, raw: &str) -> Result<String> {
        crypto::seal(receiver_box_pub, raw)
    }

    pub fn open_sealed(&self, cipher: &str) -> Result<String> {
        crypto::open(&self.user_box_pair()?, cipher)
    }

    pub fn get_profile(&self) -> Result<Option<User>> {
        Ok(self.users.get_by_id(&self.user_id()?))
    }

    pub fn stream_profile(&self, callback: StreamCallback<User>) -> StreamContext {
        match self.user_id() {
            Ok(id) => self.users.stream_by_id(&id, callback),
            Err(e) => {
                tracing::debug!(error = %e, "no profile to stream");
                emit_static_value(&callback, None);
                StreamContext::new()
            }
        }
    }

    pub async fn update_profile(&self, profile: EditableProfile) -> Result<()> {
        let chain = self.user_chain()?;
        graph::set_values(
            &chain,
            to_map(&profile)?,
            self.settings.retry_attempts,
            self.settings.retry_delay,
        )
        .await
    }

    /// Registers and signs in, then publishes the box pair, the profile and
    /// the `#users` index entry.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        profile: EditableProfile,
    ) -> Result<()> {
        self.accounts.create(username, password)?;
        self.accounts.auth(username, password)?;

        // 1. Box pair, private half readable only by us
        let box_pair = BoxKeyPair::generate();
        let (box_pub, box_priv) = box_pair.export();
        let box_priv = self.encrypt_data(&box_priv, None)?;

        // 2. Profile
        let mut data = to_map(&profile)?;
        data.insert("createdAt".into(), json!(Utc::now().to_rfc3339()));
        data.insert("boxPub".into(), json!(box_pub));
        data.insert("boxPriv".into(), json!(box_priv));
        graph::set_values(
            &self.user_chain()?,
            data,
            self.settings.retry_attempts,
            self.settings.retry_delay,
        )
        .await?;
        self.accounts.set_box_pair(box_pair)?;

        // 3. Users index
        let user_id = self.user_id()?;
        let users_index = self.graph().get("#users");
        graph::set_value(
            &users_index,
            &crypto::hash(&user_id, HashEncoding::Base64),
            &user_id,
        )?;

        tracing::info!(%username, %user_id, "user created");
        Ok(())
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<Session> {
        self.accounts.auth(username, password)?;
        self.load_box_pair_with_retry().await;
        self.current_user()
    }

    pub fn sign_out(&self) -> Result<()> {
        self.accounts.leave();
        if self.accounts.is_signed_in() {
            return Err(ChatError::SignOutFailed);
        }
        Ok(())
    }

    /// Decrypts the published box pair into the session.
    pub fn load_box_pair(&self) -> Result<BoxKeyPair> {
        let node = self
            .user_chain()?
            .read()
            .ok_or(ChatError::NoBoxPair)?;
        let node: UserNode = serde_json::from_value(node)?;
        let (Some(box_pub), Some(box_priv)) = (node.box_pub, node.box_priv) else {
            return Err(ChatError::NoBoxPair);
        };
        let box_pair = BoxKeyPair::import(&self.decrypt_data(&box_priv, None)?)?;
        if box_pair.public_key() != box_pub {
            return Err(ChatError::InvalidKey("box pair does not match boxPub".into()));
        }
        self.accounts.set_box_pair(box_pair.clone())?;
        Ok(box_pair)
    }

    async fn load_box_pair_with_retry(&self) {
        let loaded = retry(self.settings.retry_attempts, self.settings.retry_delay, || async {
            self.load_box_pair()
        })
        .await;
        if let Err(e) = loaded {
            tracing::warn!(error = %e, "box key pair unavailable");
        }
    }

    /// Writes the current session to `path`.
    pub fn remember(&self, path: &Path) -> Result<()> {
        let session = self.current_user()?;
        identity::save_session(path, &session.alias, &session.pair)
    }

    /// Restores the session saved at `path`, if any.
    pub async fn recall(&self, path: &Path) -> Result<Option<Session>> {
        let Some((alias, pair)) = identity::load_session(path)? else {
            return Ok(None);
        };
        self.accounts.recall(&alias, pair);
        self.load_box_pair_with_retry().await;
        Ok(Some(self.current_user()?))
    }

    pub fn forget(&self, path: &Path) -> Result<()> {
        identity::clear_session(path)
    }
}

fn to_map(value: &impl Serialize) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
