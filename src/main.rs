//! dnschat - LLM chat tunneled over DNS
//!
//! Runs the resolver-side tunnel server or the interactive chat client, plus
//! small utilities for key generation and server inspection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use dnschat::{ChatClient, ChatConfig, CryptoManager, TunnelServer};

#[derive(Parser)]
#[command(name = "dnschat")]
#[command(version = dnschat::VERSION)]
#[command(about = "Encrypted LLM chat over DNS", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server (resolver + LLM backend)
    Server {
        /// UDP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Domain suffix terminating tunnel queries
        #[arg(short, long)]
        suffix: Option<String>,

        /// Backend model for new exchanges
        #[arg(short, long)]
        model: Option<String>,

        /// Backend API base URL
        #[arg(long)]
        base_url: Option<String>,

        /// Disable streaming; publish only finished responses
        #[arg(long)]
        no_stream: bool,
    },

    /// Chat interactively through a tunnel server
    Chat {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:5353")]
        server: SocketAddr,

        /// Domain suffix terminating tunnel queries
        #[arg(long)]
        suffix: Option<String>,

        /// Send one message and exit instead of starting a REPL
        #[arg(short, long)]
        message: Option<String>,

        /// Wait for the finished response instead of streaming
        #[arg(long)]
        no_stream: bool,
    },

    /// Query a server's version, protocol, and active model
    Info {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:5353")]
        server: SocketAddr,

        /// Domain suffix terminating tunnel queries
        #[arg(long)]
        suffix: Option<String>,
    },

    /// Generate a fresh shared encryption key
    Genkey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut config = match &cli.config {
        Some(path) => ChatConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChatConfig::default(),
    };
    config.apply_env();

    match cli.command {
        Commands::Server {
            listen,
            suffix,
            model,
            base_url,
            no_stream,
        } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(suffix) = suffix {
                config.dns_suffix = suffix;
            }
            if let Some(model) = model {
                config.llm.model = model;
            }
            if let Some(base_url) = base_url {
                config.llm.base_url = base_url;
            }
            if no_stream {
                config.llm.stream = false;
            }
            run_server(config).await
        }
        Commands::Chat {
            server,
            suffix,
            message,
            no_stream,
        } => {
            if let Some(suffix) = suffix {
                config.dns_suffix = suffix;
            }
            run_chat(config, server, message, no_stream).await
        }
        Commands::Info { server, suffix } => {
            if let Some(suffix) = suffix {
                config.dns_suffix = suffix;
            }
            show_info(config, server).await
        }
        Commands::Genkey => {
            let key = CryptoManager::generate_key().context("key generation failed")?;
            println!("{key}");
            eprintln!(
                "Export on both ends: {}={}",
                dnschat::config::ENV_KEY,
                key
            );
            Ok(())
        }
    }
}

fn crypto_from(config: &ChatConfig) -> Result<CryptoManager> {
    let key = config.key.as_deref().with_context(|| {
        format!(
            "no encryption key configured; set {} or the `key` config field \
             (generate one with `dnschat genkey`)",
            dnschat::config::ENV_KEY
        )
    })?;
    Ok(CryptoManager::new(key.as_bytes()))
}

async fn run_server(config: ChatConfig) -> Result<()> {
    let crypto = crypto_from(&config)?;
    info!(
        "dnschat {} ({} {})",
        dnschat::VERSION,
        dnschat::GIT_HASH,
        dnschat::BUILD_DATE
    );
    let server = TunnelServer::new(config, crypto)?;
    server.run().await?;
    Ok(())
}

async fn connect(config: &ChatConfig, server: SocketAddr) -> Result<ChatClient> {
    let crypto = crypto_from(config)?;
    let client = ChatClient::connect(
        server,
        &config.dns_suffix,
        crypto,
        config.poll.clone(),
        config.session_token_len,
    )
    .await?;
    Ok(client)
}

async fn run_chat(
    config: ChatConfig,
    server: SocketAddr,
    message: Option<String>,
    no_stream: bool,
) -> Result<()> {
    let client = connect(&config, server).await?;

    if let Some(message) = message {
        exchange(&client, &message, no_stream).await?;
        client.cleanup().await;
        return Ok(());
    }

    println!("dnschat {} (session {})", dnschat::VERSION, client.session());
    println!("Type a message, /help for server commands, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        if let Err(e) = exchange(&client, line, no_stream).await {
            eprintln!("error: {e}");
        }
    }

    client.cleanup().await;
    println!("bye");
    Ok(())
}

async fn exchange(client: &ChatClient, message: &str, no_stream: bool) -> Result<()> {
    if no_stream {
        let text = client.send_message_simple(message).await?;
        println!("{text}");
        return Ok(());
    }

    let mut on_delta = |delta: &str| {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    };
    let reply = client.send_message(message, &mut on_delta).await?;
    println!();
    if !reply.complete {
        eprintln!("[response timed out; shown text may be partial]");
    }
    Ok(())
}

async fn show_info(config: ChatConfig, server: SocketAddr) -> Result<()> {
    // The info query carries no encrypted payload, so no key is required
    let crypto = CryptoManager::new(config.key.as_deref().unwrap_or("").as_bytes());
    let client = ChatClient::connect(
        server,
        &config.dns_suffix,
        crypto,
        config.poll.clone(),
        config.session_token_len,
    )
    .await?;
    let info = client.server_info().await?;
    println!("server version: {}", info.version);
    println!("wire protocol:  {}", info.protocol);
    if let Some(model) = info.model {
        println!("active model:   {model}");
    }
    Ok(())
}
