//! Password-protected accounts stored in the graph.
//!
//! `~<pub>` holds the public profile plus `auth`, the user's [`PairRecord`]
//! encrypted with a key derived from the password. `~@<alias>` links to every
//! account that claimed the alias.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::backend::crypto::{self, BoxKeyPair, KeyPair, PairRecord};
use crate::backend::graph::{self, Chain, GraphDb};
use crate::error::{ChatError, Result};

#[derive(Debug, Clone)]
pub struct Session {
    pub alias: String,
    pub pair: Arc<KeyPair>,
    pub box_pair: Option<BoxKeyPair>,
}

impl Session {
    pub fn user_id(&self) -> String {
        format!("~{}", self.pair.pub_key())
    }
}

#[derive(Serialize, Deserialize)]
struct AuthRecord {
    ek: String,
    s: String,
    /// PBKDF2 rounds the key was derived with.
    c: u32,
}

#[derive(Clone)]
pub struct Accounts {
    db: GraphDb,
    work_rounds: u32,
    session: Arc<RwLock<Option<Session>>>,
}

impl Accounts {
    /// `work_rounds` applies to accounts created from here on. Existing
    /// accounts keep the rounds stored with them.
    pub fn new(db: GraphDb, work_rounds: u32) -> Self {
        Self {
            db,
            work_rounds: work_rounds.max(1),
            session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn db(&self) -> &GraphDb {
        &self.db
    }

    /// Registers `alias`. Does not sign in.
    pub fn create(&self, alias: &str, password: &str) -> Result<KeyPair> {
        if !self.db.alias(alias).keys().is_empty() {
            return Err(ChatError::UserExists);
        }

        // 1. Lock the pair with the password
        let pair = KeyPair::generate();
        let salt = crypto::random_salt();
        let record = serde_json::to_string(&pair.to_record())?;
        let key = crypto::work(password, &salt, self.work_rounds);
        let auth = AuthRecord {
            ek: crypto::encrypt(&record, &key)?,
            s: salt,
            c: self.work_rounds,
        };

        // 2. Write the user space
        let signer = Arc::new(pair.clone());
        self.db.user(&pair.pub_key()).signed(signer).put(json!({
            "alias": alias,
            "pub": pair.pub_key(),
            "epub": pair.epub(),
            "auth": serde_json::to_string(&auth)?,
        }))?;

        // 3. Claim the alias
        let user_soul = format!("~{}", pair.pub_key());
        self.db
            .alias(alias)
            .get(&user_soul)
            .put(graph::link_to(&user_soul))?;

        tracing::info!(%alias, user = %user_soul, "account created");
        Ok(pair)
    }

    pub fn auth(&self, alias: &str, password: &str) -> Result<Session> {
        for user_soul in self.db.alias(alias).keys() {
            if let Some(pair) = self.unlock(&user_soul, password) {
                let session = Session {
                    alias: alias.to_string(),
                    pair: Arc::new(pair),
                    box_pair: None,
                };
                *self.session.write() = Some(session.clone());
                tracing::info!(%alias, user = %user_soul, "signed in");
                return Ok(session);
            }
        }
        tracing::debug!(%alias, "sign in rejected");
        Err(ChatError::WrongCredentials)
    }

    fn unlock(&self, user_soul: &str, password: &str) -> Option<KeyPair> {
        let raw = self.db.get(user_soul).get("auth").read()?;
        let auth: AuthRecord = serde_json::from_str(raw.as_str()?).ok()?;
        let key = crypto::work(password, &auth.s, auth.c);
        let decrypted = crypto::decrypt(&auth.ek, &key).ok()?;
        let record: PairRecord = serde_json::from_str(&decrypted).ok()?;
        let pair = KeyPair::from_record(&record).ok()?;
        (format!("~{}", pair.pub_key()) == user_soul).then_some(pair)
    }

    pub fn leave(&self) {
        if let Some(session) = self.session.write().take() {
            tracing::info!(alias = %session.alias, "signed out");
        }
    }

    /// Restores a session without a password, e.g. from a session file.
    pub fn recall(&self, alias: &str, pair: KeyPair) -> Session {
        let session = Session {
            alias: alias.to_string(),
            pair: Arc::new(pair),
            box_pair: None,
        };
        *self.session.write() = Some(session.clone());
        tracing::debug!(%alias, "session recalled");
        session
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn current(&self) -> Result<Session> {
        self.session.read().clone().ok_or(ChatError::NoUser)
    }

    pub fn set_box_pair(&self, box_pair: BoxKeyPair) -> Result<()> {
        let mut session = self.session.write();
        let session = session.as_mut().ok_or(ChatError::NoUser)?;
        session.box_pair = Some(box_pair);
        Ok(())
    }

    /// The signed-in user's space, ready for signed writes.
    pub fn user_chain(&self) -> Result<Chain> {
        let session = self.current()?;
        Ok(self
            .db
            .user(&session.pair.pub_key())
            .signed(session.pair.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_auth() {
        let accounts = Accounts::new(GraphDb::in_memory(), 1_000);
        let pair = accounts.create("alice", "secret").unwrap();
        assert!(!accounts.is_signed_in());

        let session = accounts.auth("alice", "secret").unwrap();
        assert_eq!(session.pair.pub_key(), pair.pub_key());
        assert_eq!(session.user_id(), format!("~{}", pair.pub_key()));

        let chain = accounts.user_chain().unwrap();
        assert_eq!(chain.get("alias").read(), Some(json!("alice")));
        chain.get("avatar").put(json!("a.png")).unwrap();
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let accounts = Accounts::new(GraphDb::in_memory(), 1_000);
        accounts.create("alice", "secret").unwrap();
        let err = accounts.create("alice", "other").unwrap_err();
        assert_eq!(err.to_string(), "User already created!");
    }

    #[test]
    fn test_wrong_password_and_unknown_alias() {
        let accounts = Accounts::new(GraphDb::in_memory(), 1_000);
        accounts.create("alice", "secret").unwrap();

        assert!(matches!(
            accounts.auth("alice", "nope"),
            Err(ChatError::WrongCredentials)
        ));
        assert!(matches!(
            accounts.auth("bob", "secret"),
            Err(ChatError::WrongCredentials)
        ));
        assert!(!accounts.is_signed_in());
    }

    #[test]
    fn test_auth_uses_stored_rounds() {
        let db = GraphDb::in_memory();
        let pair = Accounts::new(db.clone(), 1_000).create("alice", "secret").unwrap();

        let raw = db.get(&format!("~{}", pair.pub_key())).get("auth").read().unwrap();
        let auth: AuthRecord = serde_json::from_str(raw.as_str().unwrap()).unwrap();
        assert_eq!(auth.c, 1_000);
        assert_ne!(crypto::work("secret", &auth.s, 1_000), crypto::work("secret", &auth.s, 1));

        // a later setting does not lock out older accounts
        let accounts = Accounts::new(db, 2_000);
        let session = accounts.auth("alice", "secret").unwrap();
        assert_eq!(session.pair.pub_key(), pair.pub_key());
    }

    #[test]
    fn test_leave_and_recall() {
        let accounts = Accounts::new(GraphDb::in_memory(), 1_000);
        let pair = accounts.create("alice", "secret").unwrap();
        accounts.auth("alice", "secret").unwrap();

        accounts.leave();
        assert!(matches!(accounts.user_chain(), Err(ChatError::NoUser)));
        assert!(matches!(accounts.set_box_pair(BoxKeyPair::generate()), Err(ChatError::NoUser)));

        let session = accounts.recall("alice", pair);
        assert_eq!(accounts.current().unwrap().user_id(), session.user_id());
        accounts.set_box_pair(BoxKeyPair::generate()).unwrap();
        assert!(accounts.current().unwrap().box_pair.is_some());
    }
}
