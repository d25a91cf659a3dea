pub mod account;
pub mod crypto;
pub mod graph;
pub mod identity;
pub mod store;
pub mod stream;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::services::messages::new_message_id;
use crate::services::users::normalize_user_id;
use crate::services::{
    EditableProfile, Friend, Message, MessageWithContext, ServiceSettings, Services, Thread,
    ThreadsService, User,
};
use crate::stores::{FriendsStore, MeStore, MessagesStore, RenderData, ThreadsStore, UsersStore};
use graph::GraphDb;
use store::NodeStore;

/// Commands a frontend sends to the backend. Users are addressed as
/// `@username`, `~<pub>` or a bare username.
#[derive(Debug)]
pub enum AppCmd {
    SignUp { username: String, password: String, avatar: Option<String> },
    SignIn { username: String, password: String },
    SignOut,
    UpdateProfile { avatar: Option<String> },
    AddFriend { user: String },
    CreateThread { user: String, first_message: Option<String> },
    SendMessage { user: String, content: String },
    FetchFriends,
    FetchThreads,
    FetchMessages { user: String },
    FetchProfile,
    FetchUser { user: String },
    FetchStorageStats,
    WatchProfile,
    WatchUser { user: String },
    WatchFriends,
    WatchThreads,
    WatchMessages { user: String },
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    SignedIn { user_id: String, username: String },
    SignedOut,
    FriendAdded(Friend),
    ThreadCreated { thread_id: String, user_id: String },
    MessageSent { user_id: String, message: Message },
    FriendsFetched(Vec<Friend>),
    ThreadsFetched(Vec<Thread>),
    MessagesFetched { user_id: String, messages: Vec<MessageWithContext> },
    ProfileFetched(Option<User>),
    UserFetched(Option<User>),
    StorageStatsFetched { node_count: usize, total_bytes: usize },
    MessageReceived { user_id: String, message: MessageWithContext },
    Watching(String),
    Error(String),
}

/// Store changes routed back into the command loop.
#[derive(Debug, Clone)]
enum Watched {
    Profile,
    User(String),
    Friends,
    Threads,
    Message { user_id: String, message: Arc<MessageWithContext> },
}

#[derive(Clone, Default)]
pub struct Stores {
    pub me: MeStore,
    pub users: UsersStore,
    pub friends: FriendsStore,
    pub threads: ThreadsStore,
    pub messages: MessagesStore,
}

impl Stores {
    /// Detaches every stream the stores opened.
    pub fn unstream(&self) {
        self.me.unstream();
        self.users.unstream();
        self.friends.unstream();
        self.threads.unstream();
        self.messages.unstream();
    }
}

pub struct Backend {
    config: ChatConfig,
    services: Services,
    stores: Stores,
    cmd_rx: mpsc::UnboundedReceiver<AppCmd>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    watch_tx: mpsc::UnboundedSender<Watched>,
    watch_rx: mpsc::UnboundedReceiver<Watched>,
    forwards: Vec<JoinHandle<()>>,
}

impl Backend {
    pub fn new(
        db: GraphDb,
        config: ChatConfig,
        cmd_rx: mpsc::UnboundedReceiver<AppCmd>,
        event_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let services = Services::new(db, ServiceSettings::from_config(&config));
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        Self {
            config,
            services,
            stores: Stores::default(),
            cmd_rx,
            event_tx,
            watch_tx,
            watch_rx,
            forwards: Vec::new(),
        }
    }

    /// Opens the configured graph and restores a remembered session.
    pub async fn open(
        config: ChatConfig,
        cmd_rx: mpsc::UnboundedReceiver<AppCmd>,
        event_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self> {
        let store = match &config.data_path {
            Some(path) => NodeStore::new(path)?,
            None => NodeStore::new_in_memory()?,
        };
        let db = GraphDb::open(store)?;
        let backend = Self::new(db, config, cmd_rx, event_tx);

        if let Some(path) = &backend.config.session_path {
            if let Some(session) = backend.services.auth.recall(path).await? {
                tracing::info!(alias = %session.alias, "session restored");
            }
        }
        Ok(backend)
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(watched) = self.watch_rx.recv() => {
                    self.handle_watched(watched);
                }
            }
        }
        tracing::debug!("command channel closed, backend stopped");
    }

    fn emit(&self, event: AppEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    async fn handle_command(&mut self, cmd: AppCmd) {
        match self.execute(cmd).await {
            Ok(event) => self.emit(event),
            Err(e) => {
                tracing::warn!(error = %e, "command failed");
                self.emit(AppEvent::Error(e.to_string()));
            }
        }
    }

    async fn execute(&mut self, cmd: AppCmd) -> Result<AppEvent> {
        let event = match cmd {
            AppCmd::SignUp { username, password, avatar } => {
                self.services
                    .auth
                    .create_user(&username, &password, EditableProfile { avatar })
                    .await?;
                self.signed_in(username)?
            }
            AppCmd::SignIn { username, password } => {
                self.services.auth.sign_in(&username, &password).await?;
                self.signed_in(username)?
            }
            AppCmd::SignOut => {
                self.services.auth.sign_out()?;
                if let Some(path) = &self.config.session_path {
                    self.services.auth.forget(path)?;
                }
                self.reset_stores();
                AppEvent::SignedOut
            }
            AppCmd::UpdateProfile { avatar } => {
                self.services
                    .auth
                    .update_profile(EditableProfile { avatar })
                    .await?;
                AppEvent::ProfileFetched(self.services.auth.get_profile()?)
            }
            AppCmd::AddFriend { user } => {
                let user_id = self.resolve_user(&user)?;
                AppEvent::FriendAdded(self.services.friends.add_friend(&user_id)?)
            }
            AppCmd::CreateThread { user, first_message } => {
                let user_id = self.resolve_user(&user)?;
                let thread_id = self
                    .services
                    .threads
                    .create_thread(&user_id, first_message.as_deref())?;
                AppEvent::ThreadCreated { thread_id, user_id }
            }
            AppCmd::SendMessage { user, content } => {
                let user_id = self.resolve_user(&user)?;
                let thread = self
                    .services
                    .threads
                    .user_threads_chain()?
                    .get(&ThreadsService::calculate_thread_id(&user_id));
                if thread.read().is_none() {
                    self.services.threads.create_thread(&user_id, None)?;
                }
                let message = self
                    .services
                    .messages
                    .send_message(&user_id, &new_message_id(), &content)
                    .await?;
                AppEvent::MessageSent { user_id, message }
            }
            AppCmd::FetchFriends => {
                let mut friends: Vec<Friend> =
                    self.services.friends.get_list()?.into_values().collect();
                friends.sort_by(|a, b| a.profile.username.cmp(&b.profile.username));
                AppEvent::FriendsFetched(friends)
            }
            AppCmd::FetchThreads => AppEvent::ThreadsFetched(self.services.threads.get_list()?),
            AppCmd::FetchMessages { user } => {
                let user_id = self.resolve_user(&user)?;
                let messages = self.services.messages.get_conversation(&user_id)?;
                AppEvent::MessagesFetched { user_id, messages }
            }
            AppCmd::FetchProfile => AppEvent::ProfileFetched(self.services.auth.get_profile()?),
            AppCmd::FetchUser { user } => {
                let user_id = self.resolve_user(&user)?;
                AppEvent::UserFetched(self.services.users.get_by_id(&user_id))
            }
            AppCmd::FetchStorageStats => {
                let db = self.services.auth.graph();
                let (node_count, total_bytes) = db
                    .storage_stats()?
                    .unwrap_or((db.node_count(), 0));
                AppEvent::StorageStatsFetched { node_count, total_bytes }
            }
            AppCmd::WatchProfile => {
                self.services.auth.user_id()?;
                self.stores.me.stream_current_user(&self.services.auth);
                self.forward(self.stores.me.store().subscribe(), Watched::Profile);
                AppEvent::Watching("profile".into())
            }
            AppCmd::WatchUser { user } => {
                let user_id = self.resolve_user(&user)?;
                self.stores.users.stream_user_by_id(&user_id, &self.services.users);
                self.forward(
                    self.stores.users.store().subscribe(),
                    Watched::User(user_id.clone()),
                );
                AppEvent::Watching(user_id)
            }
            AppCmd::WatchFriends => {
                self.stores.friends.stream_friend_list(&self.services.friends)?;
                self.forward(self.stores.friends.store().subscribe(), Watched::Friends);
                AppEvent::Watching("friends".into())
            }
            AppCmd::WatchThreads => {
                self.stores.threads.stream_thread_list(&self.services.threads)?;
                self.forward(self.stores.threads.store().subscribe(), Watched::Threads);
                AppEvent::Watching("threads".into())
            }
            AppCmd::WatchMessages { user } => {
                let user_id = self.resolve_user(&user)?;
                let friend = self.services.messages.get_friend_by_user_id_or_throw(&user_id)?;
                let me = self.services.auth.get_profile()?.ok_or(ChatError::NoUser)?;
                let watch_tx = self.watch_tx.clone();
                let key = user_id.clone();
                self.stores.messages.stream_messages(
                    &friend,
                    &me,
                    &self.services.messages,
                    move |message| {
                        let _ = watch_tx.send(Watched::Message {
                            user_id: key.clone(),
                            message,
                        });
                    },
                )?;
                AppEvent::Watching(user_id)
            }
        };
        Ok(event)
    }

    fn signed_in(&self, username: String) -> Result<AppEvent> {
        if let Some(path) = &self.config.session_path {
            self.services.auth.remember(path)?;
        }
        Ok(AppEvent::SignedIn {
            user_id: self.services.auth.user_id()?,
            username,
        })
    }

    /// `@name` looks up a username, `~pub` is taken as an id, anything else
    /// is tried as a username first.
    fn resolve_user(&self, user: &str) -> Result<String> {
        let users = &self.services.users;
        if let Some(username) = user.strip_prefix('@') {
            return users
                .get_by_username(username)
                .map(|u| u.id)
                .ok_or(ChatError::UserNotFound);
        }
        if user.starts_with('~') {
            return Ok(normalize_user_id(user));
        }
        if let Some(found) = users.get_by_username(user) {
            return Ok(found.id);
        }
        users
            .get_by_id(user)
            .map(|u| u.id)
            .ok_or(ChatError::UserNotFound)
    }

    /// Closes the signed-out session's streams and starts over with empty
    /// stores.
    fn reset_stores(&mut self) {
        self.stores.unstream();
        for task in self.forwards.drain(..) {
            task.abort();
        }
        self.stores = Stores::default();
    }

    /// Pings the loop on every new revision of a store.
    fn forward(&mut self, mut revisions: watch::Receiver<u64>, kind: Watched) {
        let watch_tx = self.watch_tx.clone();
        let task = tokio::spawn(async move {
            // a commit may already have landed before this task runs
            let _ = watch_tx.send(kind.clone());
            while revisions.changed().await.is_ok() {
                if watch_tx.send(kind.clone()).is_err() {
                    break;
                }
            }
        });
        self.forwards.retain(|task| !task.is_finished());
        self.forwards.push(task);
    }

    fn handle_watched(&self, watched: Watched) {
        match watched {
            Watched::Profile => {
                if let RenderData::Ready(user) = self.stores.me.user() {
                    self.emit(AppEvent::ProfileFetched(Some(user.as_ref().clone())));
                }
            }
            Watched::User(user_id) => match self.stores.users.by_id(&user_id) {
                RenderData::Ready(user) => self.emit(AppEvent::UserFetched(Some(user.as_ref().clone()))),
                RenderData::Empty => self.emit(AppEvent::UserFetched(None)),
                RenderData::Loading => {}
            },
            Watched::Friends => match self.stores.friends.list() {
                RenderData::Ready(friends) => self.emit(AppEvent::FriendsFetched(
                    friends.iter().map(|f| f.as_ref().clone()).collect(),
                )),
                RenderData::Empty => self.emit(AppEvent::FriendsFetched(Vec::new())),
                RenderData::Loading => {}
            },
            Watched::Threads => match self.stores.threads.list() {
                RenderData::Ready(threads) => self.emit(AppEvent::ThreadsFetched(
                    threads.iter().map(|t| t.as_ref().clone()).collect(),
                )),
                RenderData::Empty => self.emit(AppEvent::ThreadsFetched(Vec::new())),
                RenderData::Loading => {}
            },
            Watched::Message { user_id, message } => self.emit(AppEvent::MessageReceived {
                user_id,
                message: message.as_ref().clone(),
            }),
        }
    }
}

/// Opens a backend from `config` and runs it until the command channel
/// closes.
pub async fn init(
    config: ChatConfig,
    cmd_rx: mpsc::UnboundedReceiver<AppCmd>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) {
    match Backend::open(config, cmd_rx, event_tx.clone()).await {
        Ok(mut backend) => backend.run().await,
        Err(e) => {
            tracing::error!(error = %e, "failed to open backend");
            let _ = event_tx.send(AppEvent::Error(e.to_string()));
        }
    }
}
