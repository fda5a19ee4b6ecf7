//! # seqline
//!
//! Headless client for a seqline server: read history, send messages and
//! follow live patches from the terminal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use seqline_client::config::ClientConfig;
use seqline_client::core::patch::ChatPatch;
use seqline_client::realtime::OutgoingMessage;
use seqline_client::session::Session;
use seqline_shared::{ChatId, Message, UserId};
use seqline_store::Database;

#[derive(Parser, Debug)]
#[command(name = "seqline")]
#[command(about = "Seqline headless chat client", version)]
struct Cli {
    /// HTTP API base URL
    #[arg(long, env = "SEQLINE_API_BASE")]
    api: Option<String>,

    /// Realtime WebSocket URL (derived from --api when omitted)
    #[arg(long, env = "SEQLINE_WS_URL")]
    ws: Option<String>,

    /// Bearer token (JWT) for the API and the socket
    #[arg(long, env = "SEQLINE_TOKEN", hide_env_values = true)]
    token: String,

    /// User id the token was issued for
    #[arg(long, env = "SEQLINE_USER")]
    user: String,

    /// Local cache file (defaults to the platform data directory)
    #[arg(long, env = "SEQLINE_CACHE")]
    cache: Option<PathBuf>,

    /// Run without a durable cache
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the recent history of a chat
    History {
        /// Chat id (`p:<a>:<b>` or `g:<group>`)
        chat: ChatId,

        /// Extra pages of older history to load
        #[arg(short, long, default_value_t = 0)]
        pages: u32,
    },

    /// Send a text message
    Send {
        chat: ChatId,
        text: String,
    },

    /// Search a chat's loaded history
    Search {
        chat: ChatId,
        query: String,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Follow live patches as JSON lines until interrupted
    Tail {
        /// Open this chat first
        chat: Option<ChatId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    seqline_client::init_tracing();
    let cli = Cli::parse();

    let mut config = ClientConfig::from_env();
    if let Some(api) = &cli.api {
        config.api_base = api.trim_end_matches('/').to_string();
        config.ws_url = ClientConfig::ws_url_for(&config.api_base);
    }
    if let Some(ws) = &cli.ws {
        config.ws_url = ws.clone();
    }

    let cache = if cli.no_cache {
        None
    } else {
        Some(match &cli.cache {
            Some(path) => Database::open_at(path)
                .with_context(|| format!("opening cache {}", path.display()))?,
            None => Database::new().context("opening default cache")?,
        })
    };

    let realtime = matches!(cli.command, Commands::Send { .. } | Commands::Tail { .. });
    let (session, mut patches) =
        Session::start(UserId::from(cli.user.as_str()), &cli.token, config, cache, realtime)
            .await?;

    let result = run(cli.command, &session, &mut patches).await;
    session.shutdown().await;
    result
}

async fn run(
    command: Commands,
    session: &Session,
    patches: &mut mpsc::Receiver<Vec<ChatPatch>>,
) -> Result<()> {
    let core = session.core();
    match command {
        Commands::History { chat, pages } => {
            core.set_active_chat(chat.clone()).await?;
            for _ in 0..pages {
                core.load_more_before().await?;
            }
            for m in core.snapshot(chat).await? {
                println!("{}", render(&m));
            }
        }
        Commands::Send { chat, text } => {
            let ack = session.send(OutgoingMessage::text(chat, text)).await?;
            println!("sent {} seq={}", ack.message_id, ack.seq);
        }
        Commands::Search { chat, query, limit } => {
            core.set_active_chat(chat.clone()).await?;
            for m in core.search(chat, query, limit).await? {
                println!("{}", render(&m));
            }
        }
        Commands::Tail { chat } => {
            if let Some(chat) = chat {
                core.set_active_chat(chat).await?;
            }
            info!("Following patches, Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    batch = patches.recv() => match batch {
                        Some(batch) => print_patches(&batch)?,
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn render(m: &Message) -> String {
    let seq = m.seq.map_or_else(|| "-".to_string(), |s| s.to_string());
    let body = if m.is_deleted() {
        "<deleted>"
    } else {
        m.content.as_str()
    };
    format!(
        "[{seq:>6}] {} {}: {} ({:?})",
        m.sent_at.format("%Y-%m-%d %H:%M"),
        m.sender_id,
        body,
        m.status
    )
}

fn print_patches(batch: &[ChatPatch]) -> Result<()> {
    for patch in batch {
        println!("{}", serde_json::to_string(patch)?);
    }
    Ok(())
}
