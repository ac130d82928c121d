//! Command line front end
//!
//! - `serve`: accept TCP clients and answer them with the echo responder
//! - `connect`: run a layered client, subscribe, send a query and print
//!   session events for a while

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use layered_ws::client::LayeredClient;
use layered_ws::server::{EchoResponder, serve_tcp};
use layered_ws::session::SessionEvent;
use layered_ws::transport::io::TcpConnector;
use layered_ws::{Config, Error, Result};

#[derive(Debug, Parser)]
#[command(name = "layered-ws", version, about = "Layered WebSocket client and echo server")]
struct Cli {
    /// JSON config file; command line flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the echo server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9001")]
        bind: String,
    },
    /// Run a client against a server
    Connect(ConnectArgs),
}

#[derive(Debug, Args)]
struct ConnectArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    path: Option<String>,

    #[arg(long)]
    client_id: Option<String>,

    /// Topics to subscribe to once connected
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Query type to send as a request
    #[arg(long)]
    query: Option<String>,

    /// Seconds to stay connected
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_json_str(&std::fs::read_to_string(path)?),
        None => Ok(Config::default()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_logging(&config.log_level);

    match cli.command {
        Command::Serve { bind } => {
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(%bind, "listening");
            serve_tcp(listener, config, Arc::new(EchoResponder::new())).await
        }
        Command::Connect(args) => {
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            if let Some(path) = args.path {
                config.path = path;
            }
            if let Some(client_id) = args.client_id {
                config.client_id = client_id;
            }
            config.validate()?;
            connect(config, args.topics, args.query, Duration::from_secs(args.duration)).await
        }
    }
}

async fn connect(config: Config, topics: Vec<String>, query: Option<String>, duration: Duration) -> Result<()> {
    let client = Arc::new(LayeredClient::new(config, TcpConnector)?);

    let weak = Arc::downgrade(&client);
    client.on_session_event(move |event| {
        match event {
            SessionEvent::Connected => {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                for topic in &topics {
                    // subscriptions are restored by the session on reconnect
                    match client.subscribe(topic) {
                        Ok(_) | Err(Error::AlreadySubscribed(_)) => {}
                        Err(e) => error!(%topic, error = %e, "subscribe failed"),
                    }
                }
                if let Some(query) = &query {
                    if let Err(e) = client.send_request(query, Some(json!({}))) {
                        error!(error = %e, "request failed");
                    }
                }
            }
            other => info!(event = ?other, "session event"),
        }
    });

    let runner = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });

    tokio::time::sleep(duration).await;
    client.stop();
    let result = runner
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    match client.stats().to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "stats export failed"),
    }
    client.shutdown();
    result
}
