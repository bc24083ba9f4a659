//! Notechat line client
//!
//! Plain lines are sent as chat messages; `/help` lists the commands.

use notechat::config::ChatConfig;
use notechat::orchestrator::{
    ChatError, ChatEvent, ChatOrchestrator, ChatServices, FormSubmission, OrchestratorOptions,
    Reply, SendOutcome,
};
use notechat::pagination::LoadMore;
use notechat::persistence::{KeyValueStore, SqliteStore};
use notechat::transport::{
    HttpCompletionService, HttpMessageApi, HttpToolExecutor, LoggingMessageApi, MessageApi,
};
use notechat::{Message, MessageStatus, MessageStore, OfflineQueue};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
/retry           resend the last unsent message
/reload          regenerate the last reply
/stop            stop the running reply
/more            load older messages
/switch <id>     open another conversation
/yes, /no        confirm or deny the proposed action
/discard <id>    drop an unsent message
/offline         simulate losing connectivity
/online          restore connectivity
/queue           show queued messages
/quit            exit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Retry,
    Reload,
    Stop,
    More,
    Switch(String),
    Yes,
    No,
    Discard(String),
    Offline,
    Online,
    Queue,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Command::Send(line.to_string()));
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        let parsed = match (name, arg) {
            ("retry", "") => Command::Retry,
            ("reload", "") => Command::Reload,
            ("stop", "") => Command::Stop,
            ("more", "") => Command::More,
            ("switch", id) if !id.is_empty() => Command::Switch(id.to_string()),
            ("yes", "") => Command::Yes,
            ("no", "") => Command::No,
            ("discard", id) if !id.is_empty() => Command::Discard(id.to_string()),
            ("offline", "") => Command::Offline,
            ("online", "") => Command::Online,
            ("queue", "") => Command::Queue,
            ("help", "") => Command::Help,
            ("quit" | "exit", "") => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        };
        Some(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they don't interleave with the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notechat=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ChatConfig::from_env();
    tracing::info!(path = %config.db_path, api = %config.api_url, "Opening database");
    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&config.db_path)?);

    let api: Arc<dyn MessageApi> = Arc::new(LoggingMessageApi::new(Arc::new(HttpMessageApi::new(
        &config.api_url,
        config.timeout,
    )?)));
    let services = ChatServices {
        api: Arc::clone(&api),
        completions: Arc::new(HttpCompletionService::new(&config.api_url)?),
        tools: Arc::new(HttpToolExecutor::new(&config.api_url, config.timeout)?),
    };

    let store = MessageStore::with_persistence(
        Arc::clone(&kv),
        config.cache_capacity,
        config.persist_debounce,
    )?;
    let queue = OfflineQueue::new(kv, api, store.clone(), config.retry_options())?;
    let chat = Arc::new(ChatOrchestrator::new(
        services,
        store.clone(),
        queue,
        OrchestratorOptions {
            conversation_id: config.conversation_id.clone(),
            retry: config.retry_options(),
            page_size: config.page_size,
            metadata: serde_json::json!({ "client": "notechat" }),
        },
    ));

    let (connectivity, signal) = watch::channel(true);
    let background = chat.spawn_background(signal);
    let printer = tokio::spawn(print_events(Arc::clone(&chat)));

    open_conversation(&chat, &config.conversation_id).await;
    println!("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        match command {
            Command::Send(input) => {
                let chat = Arc::clone(&chat);
                tokio::spawn(async move {
                    match chat.submit(FormSubmission { input }).await {
                        Ok(Some(outcome)) => report_send(&outcome),
                        Ok(None) => {}
                        Err(e) => report_error(&e),
                    }
                });
            }
            Command::Retry => {
                let chat = Arc::clone(&chat);
                tokio::spawn(async move {
                    match chat.retry().await {
                        Ok(outcome) => report_send(&outcome),
                        Err(e) => report_error(&e),
                    }
                });
            }
            Command::Reload => {
                let chat = Arc::clone(&chat);
                tokio::spawn(async move {
                    match chat.reload().await {
                        Ok(reply) => report_reply(&reply),
                        Err(e) => report_error(&e),
                    }
                });
            }
            Command::Stop => chat.stop(),
            Command::More => match chat.load_more().await {
                Ok(LoadMore::Loaded { added, has_more }) => {
                    let end = if has_more { "" } else { " (start of conversation)" };
                    println!("Loaded {added} older messages{end}");
                    print_history(&chat.messages());
                }
                Ok(LoadMore::Skipped) => println!("Nothing older to load"),
                Err(e) => report_error(&e),
            },
            Command::Switch(id) => open_conversation(&chat, &id).await,
            Command::Yes => {
                let chat = Arc::clone(&chat);
                tokio::spawn(async move {
                    if let Err(e) = chat.confirm_tool().await {
                        report_error(&e);
                    }
                });
            }
            Command::No => match chat.deny_tool() {
                Ok(Some(call)) => println!("Denied {}", call.tool_name),
                Ok(None) => {}
                Err(e) => report_error(&e),
            },
            Command::Discard(temp_id) => match chat.discard(&temp_id) {
                Ok(true) => println!("Discarded {temp_id}"),
                Ok(false) => println!("No unsent message {temp_id}"),
                Err(e) => report_error(&e),
            },
            Command::Offline => {
                connectivity.send_replace(false);
            }
            Command::Online => {
                connectivity.send_replace(true);
            }
            Command::Queue => {
                let queued = chat.queue().get_queued_messages(None);
                if queued.is_empty() {
                    println!("Queue is empty");
                }
                for entry in queued {
                    println!(
                        "[{}] {} {}{}",
                        entry.conversation_id,
                        entry.message.id.as_str(),
                        entry.message.content,
                        if entry.held { " (failed)" } else { "" }
                    );
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Unknown(line) => println!("Unknown command: {line} (try /help)"),
        }
    }

    chat.stop();
    store.flush_persistence()?;
    for task in background {
        task.abort();
    }
    printer.abort();
    tracing::info!("Shut down");
    Ok(())
}

async fn open_conversation(chat: &ChatOrchestrator, conversation_id: &str) {
    if let Err(e) = chat.switch_conversation(conversation_id).await {
        tracing::warn!(conv_id = %conversation_id, error = %e, "Failed to load conversation");
        println!("Could not load history: {e}");
    }
    println!("== {conversation_id} ==");
    print_history(&chat.messages());
}

fn print_history(messages: &[Message]) {
    for message in messages {
        let marker = match message.status {
            MessageStatus::Pending => " (sending)",
            MessageStatus::Failed => " (failed)",
            MessageStatus::Sent => "",
        };
        println!("{}: {}{marker}", message.role, message.content);
    }
}

fn report_send(outcome: &SendOutcome) {
    match outcome {
        SendOutcome::Queued { temp_id } => println!("Offline, queued as {temp_id}"),
        SendOutcome::Failed { temp_id, error } => {
            println!("Not sent ({error}); /retry or /discard {temp_id}");
        }
        SendOutcome::Sent { reply, .. } => report_reply(reply),
    }
}

fn report_reply(reply: &Reply) {
    if reply.message.is_some() {
        println!();
    }
    if reply.stopped {
        println!("(stopped)");
    }
}

fn report_error(error: &ChatError) {
    println!("Error: {error}");
}

/// Print events for the conversation on screen
async fn print_events(chat: Arc<ChatOrchestrator>) {
    let mut events = chat.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event
            .conversation_id()
            .is_some_and(|id| id != chat.conversation_id())
        {
            continue;
        }

        match event {
            ChatEvent::AssistantDelta { delta, .. } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            ChatEvent::RetryScheduled { attempt, .. } => println!(
                "Retrying in {:.1}s (attempt {}/{}): {}",
                attempt.next_delay.as_secs_f64(),
                attempt.attempt + 1,
                attempt.max_attempts,
                attempt.last_error
            ),
            ChatEvent::Notification {
                message, retryable, ..
            } => println!("! {message}{}", if retryable { " (/retry)" } else { "" }),
            ChatEvent::ToolCallProposed { call, .. } => {
                println!("? {} {} (/yes or /no)", call.tool_name, call.args);
            }
            ChatEvent::ToolCallUpdated { call, .. } => {
                println!("* {} {:?}", call.tool_name, call.state);
            }
            ChatEvent::ToolCallRejected {
                tool_name, reason, ..
            } => println!("* {tool_name} skipped: {reason}"),
            ChatEvent::ConnectivityChanged { online } => {
                println!("{}", if online { "[online]" } else { "[offline]" });
            }
            ChatEvent::MessagesChanged { .. } => {}
        }
    }
}
