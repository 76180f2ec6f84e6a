// Gisma CLI: terminal front end for gisma-link
//
// Composition root: builds the one ConnectionManager for the process, wires
// the chat service and streamer to a terminal listener, and maps REST calls
// onto subcommands.

use clap::{CommandFactory, Parser, Subcommand};
use gisma_link::{
    ApiClient, ChatMetadata, ChatService, ChatStreamer, ClientConfig, ConnectionManager, Conversation,
    LinkError, LinkResult, Message, ResponseFormat, StreamListener, StreamOptions,
};
use log::debug;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "gisma", version, about = "Chat with a Gisma server from the terminal")]
struct Cli {
    /// Server base URL (overrides config file and GISMA_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    #[arg(long, env = "GISMA_USERNAME", global = true)]
    username: Option<String>,

    #[arg(long, env = "GISMA_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and show the current user
    Whoami,

    /// Ask one question; starts a new chat unless --chat is given
    Ask {
        message: String,
        /// Continue an existing chat
        #[arg(long)]
        chat: Option<String>,
        /// SIMPLE, JSON or SCHEMA
        #[arg(long, default_value = "SIMPLE")]
        format: ResponseFormat,
        /// JSON schema file, used with --format SCHEMA
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Interactive chat on stdin; Ctrl-C stops the current answer
    Chat {
        #[arg(long)]
        chat: Option<String>,
    },

    /// List stored chats
    History {
        #[arg(long)]
        json: bool,
    },

    /// Print the messages of a stored chat
    Show { chat_id: String },

    /// Delete a stored chat
    Delete { chat_id: String },

    /// Generate shell completions
    Completions { shell: clap_complete::Shell },
}

// ── Terminal listener ──────────────────────────────────────────────────

struct TerminalUi {
    /// Bytes of the assistant message already printed.
    printed: Mutex<usize>,
    done: mpsc::UnboundedSender<Conversation>,
}

impl StreamListener for TerminalUi {
    fn on_stream_update(&self, conversation: &Conversation) {
        let Some(text) = conversation.last_assistant_content() else {
            return;
        };
        let mut printed = self.printed.lock();
        if let Some(delta) = text.get(*printed..).filter(|d| !d.is_empty()) {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
            *printed = text.len();
        }
    }

    fn on_metadata(&self, metadata: &ChatMetadata) {
        eprintln!("[chat {}: {}]", metadata.chat_id, metadata.description);
    }

    fn on_stream_complete(&self, conversation: &Conversation) {
        *self.printed.lock() = 0;
        println!();
        let _ = self.done.send(conversation.clone());
    }

    fn on_notice(&self, message: &str) {
        eprintln!("! {}", message);
    }
}

// ── Composition ────────────────────────────────────────────────────────

async fn login(cli: &Cli) -> LinkResult<(ClientConfig, ApiClient)> {
    let mut config = ClientConfig::load()?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
        config.validate()?;
    }
    let api = ApiClient::from_config(&config)?;
    let (Some(username), Some(password)) = (&cli.username, &cli.password) else {
        return Err(LinkError::Config(
            "--username and --password (or GISMA_USERNAME / GISMA_PASSWORD) are required".into(),
        ));
    };
    api.login(username, password).await?;
    Ok((config, api))
}

fn streamer(config: &ClientConfig, api: &ApiClient) -> LinkResult<(ChatStreamer, mpsc::UnboundedReceiver<Conversation>)> {
    let connection = Arc::new(ConnectionManager::from_config(config)?);
    connection.set_handshake(api.handshake());
    let service = Arc::new(ChatService::new(connection));
    service.set_authenticated(true);

    let (done, finished) = mpsc::unbounded_channel();
    let ui = Arc::new(TerminalUi { printed: Mutex::new(0), done });
    Ok((ChatStreamer::new(service, ui, StreamOptions::from(config)), finished))
}

/// Send one message and wait for the answer; Ctrl-C stops it early.
async fn exchange(
    streamer: &ChatStreamer,
    finished: &mut mpsc::UnboundedReceiver<Conversation>,
    conversation: Conversation,
    message: Message,
) -> LinkResult<Conversation> {
    streamer.send_message(conversation, message, 0).await?;
    tokio::select! {
        done = finished.recv() => done.ok_or_else(|| LinkError::Other("stream listener closed".into())),
        _ = tokio::signal::ctrl_c() => {
            streamer.stop();
            finished.recv().await.ok_or_else(|| LinkError::Other("stream listener closed".into()))
        }
    }
}

fn conversation_for(chat_id: Option<String>, history: Vec<Message>) -> Conversation {
    let mut conversation = Conversation::new("cli", "Terminal chat");
    conversation.chat_id = chat_id;
    conversation.messages = history;
    conversation
}

// ── Commands ───────────────────────────────────────────────────────────

async fn run(cli: Cli) -> LinkResult<()> {
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "gisma", &mut std::io::stdout());
        }
        Commands::Whoami => {
            let (_, api) = login(&cli).await?;
            let me = api.ensure_session().await?;
            println!("{}{}", me.username, if me.is_admin() { " (admin)" } else { "" });
            if let Some(email) = me.email {
                println!("{}", email);
            }
        }
        Commands::Ask { message, chat, format, schema } => {
            let (config, api) = login(&cli).await?;
            let history = match chat {
                Some(id) => api.chat_messages(id).await?,
                None => Vec::new(),
            };
            let mut conversation = conversation_for(chat.clone(), history);
            conversation.response_format = *format;
            if let Some(path) = schema {
                conversation.schema_json = Some(std::fs::read_to_string(path)?);
            }
            let (streamer, mut finished) = streamer(&config, &api)?;
            exchange(&streamer, &mut finished, conversation, Message::user(message.as_str())).await?;
        }
        Commands::Chat { chat } => {
            let (config, api) = login(&cli).await?;
            let history = match chat {
                Some(id) => api.chat_messages(id).await?,
                None => Vec::new(),
            };
            let mut conversation = conversation_for(chat.clone(), history);
            let (streamer, mut finished) = streamer(&config, &api)?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            eprint!("> ");
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    eprint!("> ");
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                conversation = exchange(&streamer, &mut finished, conversation, Message::user(line)).await?;
                debug!("chat id now {:?}", conversation.chat_id);
                eprint!("> ");
            }
            streamer.service().disconnect();
        }
        Commands::History { json } => {
            let (_, api) = login(&cli).await?;
            let chats = api.list_chats().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&chats)?);
            } else if chats.is_empty() {
                println!("No chats yet.");
            } else {
                for chat in chats {
                    println!("{}  {}", chat.chat_id, chat.description);
                }
            }
        }
        Commands::Show { chat_id } => {
            let (_, api) = login(&cli).await?;
            for message in api.chat_messages(chat_id).await? {
                let who = match message.role {
                    gisma_link::Role::User => "you",
                    gisma_link::Role::Assistant => "assistant",
                };
                println!("{}: {}\n", who, message.content);
            }
        }
        Commands::Delete { chat_id } => {
            let (_, api) = login(&cli).await?;
            api.delete_chat(chat_id).await?;
            println!("Deleted {}", chat_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
