//! # rag-session CLI (`rags`)
//!
//! Conversational question answering over a knowledge base, with cited
//! sources and bounded per-session history.
//!
//! ## Usage
//!
//! ```bash
//! rags --config ./config/rags.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rags init` | Create the turn-log database |
//! | `rags ask "<query>"` | Answer one question and print cited sources |
//! | `rags chat` | Interactive session on stdin (`/clear`, `/quit`) |
//! | `rags serve` | Start the HTTP server |
//!
//! Diagnostics go to stderr through `tracing`; set `RUST_LOG` to adjust
//! (default `rag_session=info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use rag_session::config::{load_config, Config};
use rag_session::engine::{SessionEngine, TurnEvent, TurnReply};
use rag_session::error::TurnError;
use rag_session::{migrate, server};

/// rag-session: retrieval-augmented chat with faithful citations.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rags.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rags",
    about = "Retrieval-augmented chat sessions with cited sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rags.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the turn-log database.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Answer a single question.
    Ask {
        /// The question.
        query: String,

        /// Session id. Each invocation starts from an empty history.
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Start an interactive chat session.
    ///
    /// `/clear` resets the history (keeping the system prompt) and `/quit`
    /// exits.
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rag_session=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ask { query, session } => {
            let engine = SessionEngine::from_config(&cfg).await?;
            let reply = engine.start_turn(&session, &query).await;
            engine.flush_logs().await;
            let reply = reply?;
            println!("{}", reply.answer);
            print_sources(&reply);
        }
        Commands::Chat { session } => {
            run_chat(&cfg, &session).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_chat(cfg: &Config, session: &str) -> Result<()> {
    let engine = SessionEngine::from_config(cfg).await?;
    let result = chat_loop(&engine, session).await;
    engine.flush_logs().await;
    result
}

async fn chat_loop(engine: &SessionEngine, session: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Session '{}'. Type /clear to reset, /quit to exit.", session);
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                match engine.clear_session(session, true).await {
                    Ok(()) => println!("History cleared."),
                    Err(TurnError::UnknownSession(_)) => println!("Nothing to clear."),
                    Err(e) => println!("Could not clear history: {}", e),
                }
                continue;
            }
            _ => {}
        }

        let mut events = engine.stream_turn(session, line).await?;
        let mut streamed = String::new();
        while let Some(event) = events.next().await {
            match event {
                TurnEvent::Delta(text) => {
                    print!("{}", text);
                    std::io::stdout().flush()?;
                    streamed.push_str(&text);
                }
                TurnEvent::Done(reply) => {
                    if !streamed.is_empty() {
                        println!();
                    }
                    // renumbered markers or a fixed answer differ from the stream
                    if reply.answer != streamed {
                        if !streamed.is_empty() {
                            println!();
                        }
                        println!("{}", reply.answer);
                    }
                    print_sources(&reply);
                }
            }
        }
    }

    Ok(())
}

fn print_sources(reply: &TurnReply) {
    if reply.sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for source in &reply.sources {
        println!("  [{}] {} ({})", source.id, source.title, source.parent_id);
    }
    if reply.history_trimmed {
        println!("(older history was compacted)");
    }
}
