//! Tessera - peer-to-peer overlay node with DHT content routing and FloodSub

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tessera_core::{ContentId, TcpTransport};
use tessera_node::config::{expand_path, DEFAULT_CONFIG_PATH};
use tessera_node::{Config, Node, NodeConfig};
use tessera_pubsub::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Interval};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Peer-to-peer overlay node: DHT content routing and FloodSub messaging", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap peer address, repeatable (overrides config)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Identity seed the peer id is derived from (overrides config)
    #[arg(short, long)]
    identity: Option<String>,

    /// Address advertised to other peers, e.g. when listening on 0.0.0.0 (overrides config)
    #[arg(long)]
    external_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Run a node that only routes for others (bootstrap mode)
    Serve,

    /// Announce that this node provides some data
    Provide {
        /// Data whose raw content id is announced
        #[arg(required = true)]
        data: String,

        /// Keep providing for this many seconds, then exit (default: until Ctrl-C)
        #[arg(long)]
        hold: Option<u64>,
    },

    /// Find the providers of a content id
    Find {
        /// Content id (hex-encoded)
        #[arg(required = true)]
        cid: String,

        /// Maximum number of providers
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Chat on a topic: stdin lines and/or a periodic message
    Chat {
        /// Topic to join
        #[arg(short, long, default_value = "chat")]
        topic: String,

        /// Publish the message every this many seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Wait this many seconds before publishing anything
        #[arg(short, long)]
        delay: Option<u64>,

        /// Message to publish (once, or periodically with --interval)
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Commands::Init = cli.command {
        return init_config(&cli.config);
    }

    let mut config = Config::load_or_default(&expand_path(&cli.config))?;
    if let Some(listen) = &cli.listen {
        config.node.listen = listen.clone();
    }
    if !cli.bootstrap.is_empty() {
        config.node.bootstrap = cli.bootstrap.clone();
    }
    if let Some(identity) = &cli.identity {
        config.node.identity = Some(identity.clone());
    }
    if let Some(external) = &cli.external_addr {
        config.node.external_addr = Some(external.clone());
    }

    let node = start_node(&config).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Serve => serve(&node).await?,
        Commands::Provide { data, hold } => provide(&node, &data, hold).await?,
        Commands::Find {
            cid,
            limit,
            timeout,
        } => find(&node, &cid, limit, timeout).await?,
        Commands::Chat {
            topic,
            interval,
            delay,
            message,
        } => chat(&node, &topic, interval, delay, message).await?,
    }

    Ok(())
}

async fn start_node(config: &Config) -> Result<Node<TcpTransport>> {
    let peer_id = config.peer_id()?;
    let listen = config.listen_addr()?;
    let transport = TcpTransport::bind_with_external(peer_id, &listen, config.external_addr()?)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    let node = Node::new(NodeConfig {
        transport,
        dht: Some(config.dht_config()),
        pubsub: Some(config.pubsub_config()?),
    })?;
    for addr in node.listen_addrs() {
        println!("Listening on {}", addr);
    }

    let bootstrap = config.bootstrap_addrs()?;
    if !bootstrap.is_empty() {
        node.bootstrap(&bootstrap).await?;
    }
    Ok(node)
}

async fn serve(node: &Node<TcpTransport>) -> Result<()> {
    tracing::info!("Serving as {}; press Ctrl-C to stop", node.local_peer_id());
    tokio::signal::ctrl_c().await?;
    tracing::info!(
        "Shutting down with {} connected peers",
        node.connected_peers().await.len()
    );
    Ok(())
}

async fn provide(node: &Node<TcpTransport>, data: &str, hold: Option<u64>) -> Result<()> {
    let cid = ContentId::raw(data.as_bytes());
    println!("Content id: {}", cid);

    let duration = hold.map(Duration::from_secs);
    let acks = node.provide(&cid, duration).await?;
    println!("Provider record stored by {} peers", acks);

    match duration {
        Some(duration) => time::sleep(duration).await,
        None => {
            tracing::info!("Providing until Ctrl-C");
            tokio::signal::ctrl_c().await?;
        }
    }
    node.stop_providing(&cid).await?;
    Ok(())
}

async fn find(node: &Node<TcpTransport>, cid: &str, limit: usize, timeout: u64) -> Result<()> {
    let cid: ContentId = cid.parse().context("Invalid content id")?;
    tracing::info!("Looking for providers of {}", cid);

    let providers = node
        .find_providers(&cid, limit, Duration::from_secs(timeout))
        .await?;
    if providers.is_empty() {
        println!("No providers found.");
        return Ok(());
    }

    println!("Found {} provider(s):\n", providers.len());
    for provider in providers {
        println!("  {}", provider.peer_id);
        for addr in &provider.addrs {
            println!("      {}", addr);
        }
    }
    Ok(())
}

async fn chat(
    node: &Node<TcpTransport>,
    topic: &str,
    interval: Option<u64>,
    delay: Option<u64>,
    message: Option<String>,
) -> Result<()> {
    node.subscribe(topic).await?;
    node.on_message(topic, |m: &Message| {
        println!("[{}] {}", m.from, String::from_utf8_lossy(&m.data));
    })
    .await?;

    if let Some(delay) = delay {
        time::sleep(Duration::from_secs(delay)).await;
    }

    let mut ticker = interval.map(|secs| time::interval(Duration::from_secs(secs.max(1))));
    if ticker.is_none() {
        if let Some(text) = &message {
            node.publish(topic, text.clone().into_bytes()).await?;
        }
    }
    let periodic = message.unwrap_or_else(|| format!("hello from {}", node.local_peer_id()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if !line.trim().is_empty() => {
                    node.publish(topic, line.into_bytes()).await?;
                }
                Some(_) => {}
                None => {
                    stdin_open = false;
                    if ticker.is_none() {
                        break;
                    }
                }
            },
            _ = tick(&mut ticker) => {
                node.publish(topic, periodic.clone().into_bytes()).await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Wait for the next tick, or forever without a ticker
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn init_config(path: &str) -> Result<()> {
    let config_path = expand_path(path);
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    Config::default().save(&config_path)?;
    println!("Initialized Tessera config at: {}", config_path.display());
    Ok(())
}
