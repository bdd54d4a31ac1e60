//! sessionhub - share one CLI assistant conversation across devices

use clap::{Parser, Subcommand};
use sessionhub::config::Config;
use sessionhub::hub::Hub;
use sessionhub::protocol::{ClientMessage, ServerMessage};
use sessionhub::runner::{calculate_timeout_for_command, resolve_executable};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

type StdinLines = Lines<BufReader<Stdin>>;

#[derive(Parser)]
#[command(name = "sessionhub")]
#[command(author, version, about = "Share one CLI assistant conversation across devices")]
struct Cli {
    /// Config file (default: <config dir>/sessionhub/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the concurrent session ceiling
    #[arg(long, global = true)]
    max_sessions: Option<usize>,

    /// Path to the CLI executable
    #[arg(long, global = true)]
    claude_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve newline-delimited JSON requests on stdin, responses on stdout
    Serve,
    /// Show the timeout a command would run with
    Timeout {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Show which CLI executable would be used
    Resolve,
    /// Print the effective configuration
    Config,
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sessionhub=info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_from(&path)?;
    config.apply_env();
    if let Some(max) = cli.max_sessions {
        config.max_concurrent_sessions = max;
    }
    if let Some(path) = &cli.claude_path {
        config.claude_path = Some(path.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Timeout { command } => {
            let timeout = calculate_timeout_for_command(&command.join(" "));
            println!("{}ms ({}s)", timeout.as_millis(), timeout.as_secs());
        }
        Commands::Resolve => {
            println!(
                "{}",
                resolve_executable(config.claude_path.as_deref()).display()
            );
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let hub = Hub::new(config);
    hub.start();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    hub.forward_events(tx.clone());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = rx.recv().await {
            let mut line = msg.to_line();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    #[cfg(unix)]
    run_loop_unix(&hub, &mut lines, &tx).await;

    #[cfg(not(unix))]
    run_loop_ctrlc_only(&hub, &mut lines, &tx).await;

    hub.shutdown().await;
    drop(tx);
    drop(hub);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(())
}

fn handle_line(hub: &Hub, line: &str, tx: &mpsc::UnboundedSender<ServerMessage>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let reply = match serde_json::from_str::<ClientMessage>(line) {
        Ok(msg) => hub.handle(msg),
        Err(e) => {
            tracing::warn!("Invalid request: {}", e);
            ServerMessage::error("invalid_request", e.to_string())
        }
    };
    let _ = tx.send(reply);
}

/// Request loop with Unix signal handling (SIGTERM + Ctrl+C)
#[cfg(unix)]
async fn run_loop_unix(hub: &Hub, lines: &mut StdinLines, tx: &mpsc::UnboundedSender<ServerMessage>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {:?}. Only Ctrl+C will work for shutdown.",
                e
            );
            run_loop_ctrlc_only(hub, lines, tx).await;
            return;
        }
    };

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(hub, &line, tx),
                Ok(None) => {
                    tracing::info!("Input closed, shutting down");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (Ctrl+C)");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Shutting down (SIGTERM)");
                break;
            }
        }
    }
}

/// Request loop with Ctrl+C only (fallback or non-Unix)
async fn run_loop_ctrlc_only(hub: &Hub, lines: &mut StdinLines, tx: &mpsc::UnboundedSender<ServerMessage>) {
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(hub, &line, tx),
                Ok(None) => {
                    tracing::info!("Input closed, shutting down");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (Ctrl+C)");
                break;
            }
        }
    }
}
