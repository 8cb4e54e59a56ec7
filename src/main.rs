use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info};
use pawtalk::api::models::Session;
use pawtalk::api::{ApiClient, RealtimeClient};
use pawtalk::app::AppState;
use pawtalk::chat::{ChatStore, FeedListeners, Message, Participant, RetryPolicy, StoreEvent, SyncStatus};
use pawtalk::{ChatError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "pawtalk", about = "Chat with other dog owners from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and cache the session token
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// List conversations of your dogs
    Chats {
        #[arg(long = "dog", required = true)]
        dogs: Vec<String>,
    },
    /// Find or start the conversation between two dogs
    Start {
        from_id: String,
        from_name: String,
        to_id: String,
        to_name: String,
    },
    /// Show history, follow new messages and send lines from stdin
    Open {
        conversation_id: String,
        #[arg(long = "dog", required = true)]
        dogs: Vec<String>,
    },
    /// Delete a conversation
    Delete {
        conversation_id: String,
        #[arg(long = "dog", required = true)]
        dogs: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        error!("{}", e);
        eprintln!("pawtalk: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let mut state = AppState::load()?;
    if !state.is_configured() {
        let path = AppState::default_path().map(|p| p.display().to_string()).unwrap_or_default();
        return Err(ChatError::Config(format!("set base_url and api_key in {}", path)));
    }

    match command {
        Command::Login { email } => {
            if let Some(email) = email {
                state.email = email;
            }
            if state.email.is_empty() {
                return Err(ChatError::InvalidInput("no e-mail given".into()));
            }
            let password = read_password().await?;
            let session = ApiClient::new(&state)?.sign_in(&state.email, &password).await?;
            state.session = Some(session);
            state.save()?;
            println!("Signed in as {}", state.email);
        }
        Command::Chats { dogs } => {
            let (store, _) = connect(&mut state).await?;
            store.load_conversations(&dogs).await?;
            for conversation in store.conversations().await {
                let me = dogs.iter().find(|d| conversation.involves(d)).map(String::as_str).unwrap_or("");
                println!(
                    "{}  {:<20} {}",
                    conversation.id,
                    conversation.counterpart(me).name,
                    conversation.last_message_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Start { from_id, from_name, to_id, to_name } => {
            let (store, _) = connect(&mut state).await?;
            let conversation = store
                .find_or_create(Participant::new(from_id, from_name), Participant::new(to_id, to_name))
                .await?;
            println!("{}", conversation.id);
        }
        Command::Open { conversation_id, dogs } => {
            let (store, session) = connect(&mut state).await?;
            store.load_conversations(&dogs).await?;
            if store.conversation(&conversation_id).await.is_none() {
                return Err(ChatError::UnknownConversation(conversation_id));
            }
            store.load_messages(&conversation_id).await?;
            chat(&state, &session, store, &conversation_id).await?;
        }
        Command::Delete { conversation_id, dogs } => {
            let (store, _) = connect(&mut state).await?;
            store.load_conversations(&dogs).await?;
            store.delete(&conversation_id).await?;
            println!("Deleted {}", conversation_id);
        }
    }
    Ok(())
}

/// Valid session plus a store wired to the REST gateway.
async fn connect(state: &mut AppState) -> Result<(Arc<ChatStore>, Session)> {
    let session = session(state).await?;
    let client = ApiClient::new(state)?.with_session(&session);
    let store = Arc::new(ChatStore::new(Arc::new(client), session.user_id.clone()));
    Ok((store, session))
}

async fn session(state: &mut AppState) -> Result<Session> {
    let cached = state.session.clone().ok_or(ChatError::NotAuthenticated)?;
    if !cached.is_expired(Utc::now()) {
        return Ok(cached);
    }
    let refresh_token = cached.refresh_token.as_deref().ok_or(ChatError::NotAuthenticated)?;
    info!("Session expired, refreshing");
    let renewed = ApiClient::new(state)?.refresh(refresh_token).await?;
    state.session = Some(renewed.clone());
    state.save()?;
    Ok(renewed)
}

async fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("PAWTALK_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_message(message: &Message) {
    let who = if message.is_from_current_user { "me" } else { "them" };
    let mark = match message.status {
        SyncStatus::Pending => " …",
        SyncStatus::Failed => " (not sent)",
        SyncStatus::Confirmed => "",
    };
    println!("[{}] {:>4}: {}{}", message.timestamp.format("%H:%M"), who, message.text, mark);
}

async fn chat(state: &AppState, session: &Session, store: Arc<ChatStore>, conversation_id: &str) -> Result<()> {
    let mut printed = HashSet::new();
    for message in store.messages(conversation_id).await.unwrap_or_default() {
        print_message(&message);
        printed.insert(message.id);
    }

    let feed = Arc::new(RealtimeClient::new(state, session)?);
    let listeners = FeedListeners::new(store.clone(), feed, RetryPolicy::from(state.retry.clone()));
    listeners.watch(conversation_id).await;

    let mut events = store.subscribe();
    let printer_store = store.clone();
    let watched = conversation_id.to_string();
    let printer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => StoreEvent::MessagesChanged {
                    conversation_id: watched.clone(),
                },
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                StoreEvent::MessagesChanged { conversation_id } if conversation_id == watched => {
                    for message in printer_store.messages(&watched).await.unwrap_or_default() {
                        if !message.is_from_current_user && printed.insert(message.id.clone()) {
                            print_message(&message);
                        }
                    }
                }
                StoreEvent::MessageStatusChanged { status: SyncStatus::Failed, .. } => {
                    println!("(last message could not be sent)");
                }
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim() == "/quit" {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let sent = store.send(conversation_id, &line).await?;
        print_message(&sent);
    }

    listeners.unwatch_all().await;
    printer.abort();
    Ok(())
}
