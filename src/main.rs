//! topicwire CLI - demo server and event listener.
//!
//! See the `topicwire` library for the protocol implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::stream::{self, StreamExt};
use mimalloc::MiMalloc;
use serde_json::{json, Value};
use topicwire::{Client, Config, EventSource, ObservableMap, ServerBuilder, WsConnector};

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "topicwire")]
#[command(version)]
#[command(about = "Multiplexed publish/subscribe over one WebSocket")]
struct Cli {
    /// JSON config file (defaults plus TOPICWIRE_* environment otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo server publishing `clock` and `users`, answering `echo`
    Serve {
        /// Address to listen on
        #[arg(long)]
        addr: Option<String>,
    },
    /// Connect to a server and print the given events as they arrive
    Listen {
        /// Server URL (http(s) URLs are converted to ws(s))
        #[arg(long)]
        url: Option<String>,
        /// Event types to subscribe to
        #[arg(required = true)]
        events: Vec<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    match cli.command {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.listen_addr.clone());
            runtime.block_on(serve(&addr, config))
        }
        Commands::Listen { url, events } => {
            let url = url.unwrap_or_else(|| config.url.clone());
            runtime.block_on(listen(&url, events, config))
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Ticks once a second while anyone is subscribed.
fn clock_source() -> EventSource {
    EventSource::shared(|| {
        log::info!("[Serve] Clock started");
        let interval = tokio::time::interval(Duration::from_secs(1));
        stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some((json!(unix_millis()), interval))
        })
        .boxed()
    })
}

async fn serve(addr: &str, config: Config) -> Result<()> {
    let users: Arc<ObservableMap<String, Value>> = Arc::new(ObservableMap::new());

    let join_users = Arc::clone(&users);
    let leave_users = Arc::clone(&users);
    let builder = ServerBuilder::new()
        .options(config.server)
        .register_event_provider([("clock", clock_source()), ("users", users.event_source())])
        .handle("echo", |data, responder| {
            if let Some(responder) = responder {
                responder.reply(data);
            }
        })
        .handle("join", move |data, _| {
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                join_users.set(name.to_string(), data.clone());
            }
        })
        .handle("leave", move |data, _| {
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                leave_users.delete(&[name.to_string()]);
            }
        });

    let mut server = builder.listen(addr).await?;
    println!("Listening on ws://{}", server.local_addr());

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                log::info!("[Serve] Shutting down");
                server.shutdown();
                return Ok(());
            }
            Some(conn) = server.accept() => {
                log::info!("[Serve] Peer connected: {}", conn.connection_id());
                tokio::spawn(async move {
                    conn.closed().await;
                    log::info!("[Serve] Peer disconnected: {}", conn.connection_id());
                });
            }
        }
    }
}

async fn listen(url: &str, events: Vec<String>, config: Config) -> Result<()> {
    let connector = WsConnector::new(url);
    log::info!("[Listen] Connecting to {}", connector.url());
    let client = Client::connect(connector, config.client);

    let streams = events.into_iter().map(|event| {
        client
            .receive(&event)
            .map(move |data| (event.clone(), data))
            .boxed()
    });
    let mut merged = stream::select_all(streams);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                client.disconnect();
                return Ok(());
            }
            () = client.closed() => {
                anyhow::bail!("Gave up reconnecting to {url}");
            }
            Some((event, data)) = merged.next() => {
                println!("{event} {data}");
            }
        }
    }
}
