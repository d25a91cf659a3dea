use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use peerchat::backend::{self, AppCmd, AppEvent};
use peerchat::services::{Friend, MessageWithContext, Thread};
use peerchat::ChatConfig;

#[derive(Debug, Parser)]
#[command(name = "peerchat")]
#[command(about = "End-to-end encrypted chat over a local graph store")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite file holding the graph (overrides the config)
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an account and sign in
    Register {
        username: String,
        password: String,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Sign in and remember the session
    Login { username: String, password: String },
    /// Sign out and forget the session
    Logout,
    /// Show the signed-in profile
    Whoami,
    /// Show a user by `@username` or `~id`
    User { user: String },
    AddFriend { user: String },
    Friends,
    /// Open a thread, optionally with a first message
    Open {
        user: String,
        #[arg(long)]
        message: Option<String>,
    },
    Send { user: String, content: String },
    Threads,
    Messages { user: String },
    /// Print incoming messages until interrupted
    Watch { user: String },
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ChatConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => ChatConfig::default(),
    };
    if let Some(data) = cli.data {
        config.data_path = Some(data);
    }
    if config.data_path.is_none() {
        config.data_path = Some(PathBuf::from("peerchat.db"));
    }
    if config.session_path.is_none() {
        config.session_path = Some(PathBuf::from("peerchat.session.json"));
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(backend::init(config, cmd_rx, event_tx));

    let watching = matches!(cli.cmd, Command::Watch { .. });
    let cmd = match cli.cmd {
        Command::Register { username, password, avatar } => AppCmd::SignUp { username, password, avatar },
        Command::Login { username, password } => AppCmd::SignIn { username, password },
        Command::Logout => AppCmd::SignOut,
        Command::Whoami => AppCmd::FetchProfile,
        Command::User { user } => AppCmd::FetchUser { user },
        Command::AddFriend { user } => AppCmd::AddFriend { user },
        Command::Friends => AppCmd::FetchFriends,
        Command::Open { user, message } => AppCmd::CreateThread { user, first_message: message },
        Command::Send { user, content } => AppCmd::SendMessage { user, content },
        Command::Threads => AppCmd::FetchThreads,
        Command::Messages { user } => AppCmd::FetchMessages { user },
        Command::Watch { user } => AppCmd::WatchMessages { user },
        Command::Stats => AppCmd::FetchStorageStats,
    };
    if cmd_tx.send(cmd).is_err() {
        eprintln!("Backend stopped before accepting the command");
        std::process::exit(1);
    }

    let mut failed = false;
    loop {
        let event = if watching {
            tokio::select! {
                event = event_rx.recv() => event,
                _ = tokio::signal::ctrl_c() => break,
            }
        } else {
            match tokio::time::timeout(Duration::from_secs(30), event_rx.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    eprintln!("Timed out waiting for the backend");
                    failed = true;
                    break;
                }
            }
        };
        let Some(event) = event else { break };
        if let AppEvent::Error(_) = event {
            failed = true;
        }
        print_event(&event);
        if !watching || failed {
            break;
        }
    }

    drop(cmd_tx);
    if failed {
        std::process::exit(1);
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::SignedIn { user_id, username } => println!("Signed in as {} ({})", username, user_id),
        AppEvent::SignedOut => println!("Signed out"),
        AppEvent::FriendAdded(friend) => {
            println!("Added {}", friend_line(friend))
        }
        AppEvent::ThreadCreated { thread_id, user_id } => {
            println!("Thread {} with {}", thread_id, user_id)
        }
        AppEvent::MessageSent { message, .. } => println!("Sent {} at {}", message.id, message.created_at),
        AppEvent::FriendsFetched(friends) => {
            if friends.is_empty() {
                println!("No friends yet");
            }
            for friend in friends {
                println!("{}", friend_line(friend));
            }
        }
        AppEvent::ThreadsFetched(threads) => {
            if threads.is_empty() {
                println!("No threads yet");
            }
            for thread in threads {
                println!("{}", thread_line(thread));
            }
        }
        AppEvent::MessagesFetched { messages, .. } => {
            for message in messages {
                println!("{}", message_line(message));
            }
        }
        AppEvent::MessageReceived { message, .. } => println!("{}", message_line(message)),
        AppEvent::ProfileFetched(Some(user)) | AppEvent::UserFetched(Some(user)) => {
            println!("{} {}", user.username, user.id);
            if let Some(avatar) = &user.avatar {
                println!("avatar: {}", avatar);
            }
        }
        AppEvent::ProfileFetched(None) | AppEvent::UserFetched(None) => println!("No profile"),
        AppEvent::StorageStatsFetched { node_count, total_bytes } => {
            println!("{} nodes, {} bytes", node_count, total_bytes)
        }
        AppEvent::Watching(what) => println!("Watching {}", what),
        AppEvent::Error(message) => eprintln!("Error: {}", message),
    }
}

fn friend_line(friend: &Friend) -> String {
    let status = if friend.active { "" } else { " (inactive)" };
    format!("@{} {}{}", friend.profile.username, friend.profile.id, status)
}

fn thread_line(thread: &Thread) -> String {
    let who = if thread.latest_mine { "you" } else { thread.friend.profile.username.as_str() };
    if thread.latest_content.is_empty() {
        format!("@{}", thread.friend.profile.username)
    } else {
        format!(
            "@{} [{}] {}: {}",
            thread.friend.profile.username, thread.latest_at, who, thread.latest_content
        )
    }
}

fn message_line(message: &MessageWithContext) -> String {
    let author = match &message.sender {
        Some(friend) => friend.profile.username.as_str(),
        None => "you",
    };
    format!("[{}] {}: {}", message.message.created_at, author, message.message.content)
}
