//! unity-bridge - command-line front end for the Unity Editor command channel.
//!
//! Logs go to stderr; stdout only ever carries JSON replies.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unity_bridge::config::BridgeConfig;
use unity_bridge::ipc::{ConnectionManager, RetryPolicy};
use unity_bridge::playmode;

#[derive(Parser)]
#[command(author, version, about = "Drive a running Unity Editor over its command channel", long_about = None)]
struct Cli {
    /// Editor host (overrides config and UNITY_BRIDGE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Editor port (overrides config and UNITY_BRIDGE_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one command and print its result
    Call {
        command: String,
        /// JSON object of parameters
        params: Option<String>,
    },
    /// Read newline-delimited JSON requests on stdin, reply on stdout
    Serve,
    /// Enter play mode and wait until the editor is playing
    Play {
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Exit play mode and wait until the editor has stopped
    Stop {
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Wait until play mode matches --playing
    WaitState {
        #[arg(long, action = clap::ArgAction::Set)]
        playing: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Print connection status
    Status,
}

#[derive(clap::Args, Clone, Copy)]
struct WaitArgs {
    /// Give up after this many milliseconds (0 waits indefinitely)
    #[arg(long, default_value_t = 60_000)]
    max_wait_ms: u64,

    /// Pause between state polls
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

impl WaitArgs {
    fn max_wait(self) -> Option<Duration> {
        (self.max_wait_ms > 0).then(|| Duration::from_millis(self.max_wait_ms))
    }

    fn policy(self) -> RetryPolicy {
        RetryPolicy {
            max_wait: self.max_wait(),
            poll_interval: Duration::from_millis(self.poll_ms),
            ..RetryPolicy::default()
        }
    }
}

/// One line of `serve` input.
#[derive(Debug, Deserialize)]
struct ServeRequest {
    #[serde(default)]
    id: Option<Value>,
    #[serde(alias = "type")]
    command: String,
    #[serde(default)]
    params: Value,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "unity_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BridgeConfig::load().context("Failed to load bridge configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    debug!("Using editor endpoint {}", config.endpoint());

    let channel = ConnectionManager::from_config(&config);
    let result = dispatch(&channel, cli.command).await;
    channel.disconnect();
    result
}

async fn dispatch(channel: &ConnectionManager, command: Commands) -> Result<()> {
    match command {
        Commands::Call { command, params } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid params JSON: {}", raw))?,
                None => json!({}),
            };
            let result = channel.invoke(&command, params).await?;
            print_json(&result)
        }
        Commands::Serve => serve(channel).await,
        Commands::Play { wait } => {
            let outcome = playmode::enter_play_mode(channel, &wait.policy()).await?;
            info!("{}", outcome.message);
            print_json(&outcome)
        }
        Commands::Stop { wait } => {
            let outcome = playmode::exit_play_mode(channel, &wait.policy()).await?;
            info!("{}", outcome.message);
            print_json(&outcome)
        }
        Commands::WaitState { playing, wait } => {
            let outcome = playmode::wait_for_play_state(
                channel,
                playing,
                wait.max_wait(),
                Duration::from_millis(wait.poll_ms),
            )
            .await?;
            print_json(&outcome)?;
            if !outcome.reached {
                anyhow::bail!(
                    "Editor did not reach isPlaying == {} within {}ms",
                    playing,
                    outcome.waited_ms
                );
            }
            Ok(())
        }
        Commands::Status => {
            if let Err(e) = channel.connect().await {
                warn!("{}", e);
            }
            print_json(&channel.status())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", text);
    Ok(())
}

/// Run every stdin request concurrently; replies go out as they complete.
async fn serve(channel: &ConnectionManager) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rx.recv().await {
            let mut line = reply.to_string();
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls = JoinSet::new();
    info!("Serving requests from stdin");

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let request: ServeRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx.send(json!({"status": "error", "error": format!("Invalid request: {}", e)}));
                continue;
            }
        };

        let channel = channel.clone();
        let tx = tx.clone();
        calls.spawn(async move {
            let reply = match channel.invoke(&request.command, request.params).await {
                Ok(result) => json!({"id": request.id, "status": "success", "result": result}),
                Err(e) => json!({
                    "id": request.id,
                    "status": "error",
                    "error": e.to_string(),
                    "transient": e.is_transient(),
                }),
            };
            let _ = tx.send(reply);
        });
    }

    while calls.join_next().await.is_some() {}
    drop(tx);
    writer
        .await
        .context("Output task failed")?
        .context("Failed to write to stdout")?;
    Ok(())
}
