//! Chat data layer over the graph: users, accounts, friends, threads and
//! messages. Each service is cheap to clone and shares the signed-in session
//! through [`AuthService`].

pub mod auth;
pub mod friends;
pub mod messages;
pub mod threads;
pub mod users;

pub use auth::{AuthService, EditableProfile};
pub use friends::{Friend, FriendNode, FriendsService};
pub use messages::{Message, MessageWithContext, MessagesService};
pub use threads::{MessageNode, Thread, ThreadNode, ThreadsService};
pub use users::{User, UserNode, UsersService};

use std::time::Duration;

use crate::backend::account::Accounts;
use crate::backend::graph::GraphDb;
use crate::backend::stream::StreamOptions;
use crate::config::ChatConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub stream: StreamOptions,
    /// Quiet period for single-node streams. `None` delivers every update.
    pub debounce: Option<Duration>,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// PBKDF2 rounds for new account passwords.
    pub work_rounds: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&ChatConfig::default())
    }
}

impl ServiceSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        let debounce = config.debounce();
        Self {
            stream: StreamOptions::from_config(config),
            debounce: (!debounce.is_zero()).then_some(debounce),
            retry_attempts: config.retry.attempts,
            retry_delay: config.retry_delay(),
            work_rounds: config.work_rounds,
        }
    }
}

/// The full service graph for one session.
#[derive(Clone)]
pub struct Services {
    pub users: UsersService,
    pub auth: AuthService,
    pub friends: FriendsService,
    pub threads: ThreadsService,
    pub messages: MessagesService,
}

impl Services {
    pub fn new(db: GraphDb, settings: ServiceSettings) -> Self {
        let users = UsersService::new(db.clone(), settings);
        let auth = AuthService::new(Accounts::new(db.clone(), settings.work_rounds), users.clone(), settings);
        let friends = FriendsService::new(auth.clone(), users.clone(), settings);
        let threads = ThreadsService::new(auth.clone(), friends.clone(), settings);
        let messages = MessagesService::new(auth.clone(), friends.clone(), threads.clone(), settings);
        Self {
            users,
            auth,
            friends,
            threads,
            messages,
        }
    }
}
