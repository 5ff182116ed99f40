//! clinichub: command-line client for the clinic messaging hubs.
//!
//!   clinichub tail --conversation 42        follow a conversation
//!   clinichub payments --tenant acme        follow payment notifications
//!   clinichub send --conversation 42 "hi"   send one message
//!
//! The access token comes from `--token` or CLINICHUB_TOKEN.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use clinichub_sdk::api::HttpMessageApi;
use clinichub_sdk::notifications::PaymentNotifications;
use clinichub_sdk::ownership::OwnershipResolver;
use clinichub_sdk::transport::framed::TcpConnector;
use clinichub_sdk::{ChatSession, ConnectionState, EventChannel, HubConfig, Message, MessageId, SenderKind};

#[derive(Parser)]
#[command(name = "clinichub", about = "Clinic messaging hub client")]
struct Args {
    /// Config file (default: ~/.config/clinichub/hub.toml)
    #[arg(long, env = "CLINICHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Access token presented to the hubs and the REST API
    #[arg(long, env = "CLINICHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// Who is looking at the conversation
    #[arg(long, value_enum, default_value = "user")]
    viewer_kind: ViewerKind,

    /// Viewer id, used to mark own messages
    #[arg(long)]
    viewer_id: Option<i64>,

    /// Chat hub address (host:port), overrides the config file
    #[arg(long)]
    chat_endpoint: Option<String>,

    /// Payments hub address (host:port), overrides the config file
    #[arg(long)]
    payments_endpoint: Option<String>,

    /// REST API base URL, overrides the config file
    #[arg(long)]
    api_url: Option<String>,

    /// Use TLS for hub connections
    #[arg(long)]
    tls: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a conversation's recent history, then follow it
    Tail {
        #[arg(long)]
        conversation: i64,
        /// Extra pages of older history to load first
        #[arg(long, default_value_t = 0)]
        older_pages: u32,
    },
    /// Follow payment notifications for a tenant
    Payments {
        #[arg(long)]
        tenant: String,
    },
    /// Send one message and exit
    Send {
        #[arg(long)]
        conversation: i64,
        text: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewerKind {
    User,
    Patient,
}

impl From<ViewerKind> for SenderKind {
    fn from(kind: ViewerKind) -> Self {
        match kind {
            ViewerKind::User => SenderKind::User,
            ViewerKind::Patient => SenderKind::Patient,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs for log shippers (CLINICHUB_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CLINICHUB_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "clinichub=info,clinichub_sdk=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::load_default()?,
    };
    if let Some(endpoint) = &args.chat_endpoint {
        config.chat_endpoint = endpoint.clone();
    }
    if let Some(endpoint) = &args.payments_endpoint {
        config.payments_endpoint = endpoint.clone();
    }
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    config.tls |= args.tls;

    match &args.command {
        Command::Tail {
            conversation,
            older_pages,
        } => tail(&args, &config, *conversation, *older_pages).await,
        Command::Payments { tenant } => payments(&args, &config, tenant).await,
        Command::Send { conversation, text } => send(&args, &config, *conversation, text).await,
    }
}

fn chat_session(args: &Args, config: &HubConfig) -> ChatSession {
    let connector = Arc::new(TcpConnector::new(config.chat_endpoint.clone(), config.tls));
    let channel = EventChannel::new("chat", connector, config.channel_options());
    let api = HttpMessageApi::new(config.api_base_url.clone()).with_token(args.token.clone());
    let resolver = OwnershipResolver::new(args.viewer_kind.into(), args.viewer_id);
    ChatSession::new(channel, Arc::new(api), resolver, config.page_size)
}

async fn tail(args: &Args, config: &HubConfig, conversation: i64, older_pages: u32) -> Result<()> {
    let session = chat_session(args, config);
    let transcript = Arc::new(Transcript::default());
    let live = transcript.clone();
    session.on_message(move |message, own| {
        if let Some(line) = live.arrival(message, own) {
            println!("{line}");
        }
    });
    session.on_typing(|update| {
        if update.is_typing {
            println!("  ({:?} {} is typing)", update.sender_kind, update.sender_id);
        }
    });
    session.on_read(|receipt| {
        println!("  (read by {:?} {})", receipt.reader_kind, receipt.reader_id);
    });

    tracing::info!(endpoint = %config.chat_endpoint, conversation, "connecting");
    session.channel().connect(&args.token).await?;
    session.open_conversation(conversation).await?;
    for _ in 0..older_pages {
        if session.load_older().await? == 0 {
            break;
        }
    }
    let history = transcript.history(|| {
        session
            .snapshot()
            .into_iter()
            .map(|m| {
                let own = session.is_own(&m);
                (m, own)
            })
            .collect()
    });
    for line in history {
        println!("{line}");
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        result = until_failed(session.channel()) => result,
    };
    session.close().await;
    result
}

async fn payments(args: &Args, config: &HubConfig, tenant: &str) -> Result<()> {
    let connector = Arc::new(TcpConnector::new(config.payments_endpoint.clone(), config.tls));
    let channel = EventChannel::new("payments", connector, config.channel_options());
    let notifications = PaymentNotifications::new(channel);
    notifications.on_payment(|payment| {
        let amount = payment
            .amount
            .map(|a| format!(" {a:.2}"))
            .unwrap_or_default();
        println!(
            "[{}] payment {} {}{amount}",
            Local::now().format("%H:%M:%S"),
            payment.payment_id,
            payment.status
        );
    });

    tracing::info!(endpoint = %config.payments_endpoint, %tenant, "connecting");
    notifications.channel().connect(&args.token).await?;
    notifications.watch_tenant(tenant).await?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        result = until_failed(notifications.channel()) => result,
    };
    notifications.close().await;
    result
}

async fn send(args: &Args, config: &HubConfig, conversation: i64, text: &str) -> Result<()> {
    let session = chat_session(args, config);
    session.channel().connect(&args.token).await?;
    session.open_conversation(conversation).await?;
    let sent = session.send(Some(text.to_string()), None).await;
    session.close().await;
    let message = sent?;
    println!("sent message {}", message.id);
    Ok(())
}

/// What `tail` has printed. Arrivals are held back until the history is
/// out, since the history snapshot already contains them; after that each
/// message id prints once.
#[derive(Default)]
struct Transcript {
    shown: Mutex<Option<HashSet<MessageId>>>,
}

impl Transcript {
    /// Render the history and start letting arrivals through.
    fn history(&self, snapshot: impl FnOnce() -> Vec<(Message, bool)>) -> Vec<String> {
        let mut shown = self.shown.lock();
        let seen = shown.get_or_insert_with(HashSet::new);
        snapshot()
            .into_iter()
            .filter(|(m, _)| seen.insert(m.id))
            .map(|(m, own)| render(&m, own))
            .collect()
    }

    fn arrival(&self, message: &Message, own: bool) -> Option<String> {
        let mut shown = self.shown.lock();
        let seen = shown.as_mut()?;
        seen.insert(message.id).then(|| render(message, own))
    }
}

/// Resolves with an error once the channel gives up reconnecting.
async fn until_failed(channel: &EventChannel) -> Result<()> {
    let mut states = channel.subscribe_state();
    loop {
        states.changed().await?;
        let state = *states.borrow_and_update();
        if state == ConnectionState::Failed {
            channel.wait_connected().await?;
        }
    }
}

fn render(message: &Message, own: bool) -> String {
    let time = message
        .sent_at
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let who = if own {
        "me".to_string()
    } else {
        format!("{:?} {}", message.sender_kind, message.sender_id).to_lowercase()
    };
    let body = match (&message.content, &message.attachment) {
        (Some(text), Some(file)) => format!("{text} [{}]", file.name),
        (Some(text), None) => text.clone(),
        (None, Some(file)) => format!("[{}] {}", file.name, file.url),
        (None, None) => String::new(),
    };
    format!("[{time}] <{who}> {body}")
}
