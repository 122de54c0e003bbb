//! micro-repl - command-line host for the connection engine
//!
//! Connects to the first supported board, then either runs a single command
//! and prints its reply, or pipes stdin lines to the REPL and echoes its output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use micro_repl_lib::{ConnectionManager, ConnectionStatus, ReplEvent, ReplSettings, SerialPortCatalog};

#[derive(Parser, Debug)]
#[command(name = "micro-repl")]
#[command(about = "Talk to a MicroPython board over USB serial")]
#[command(version)]
struct Args {
    /// Path to a JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Run one statement synchronously, print the reply and exit
    #[arg(short, long)]
    exec: Option<String>,

    /// Reply deadline for --exec, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let settings = match &args.config {
        Some(path) => ReplSettings::load(path)?,
        None => ReplSettings::default(),
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ReplEvent>();
    let catalog = Arc::new(SerialPortCatalog::new(settings.baud_rate));
    let manager = ConnectionManager::new(catalog, Arc::new(events_tx), settings);

    manager.start().await;

    // Wait for discovery to settle on a terminal status
    loop {
        match events_rx.recv().await {
            Some(ReplEvent::Status(ConnectionStatus::Connected { board })) => {
                eprintln!("Connected to {} on {}", board.board, board.port);
                break;
            }
            Some(ReplEvent::Status(ConnectionStatus::Failed { code, message })) => {
                manager.teardown().await;
                if message.is_empty() {
                    bail!("{}", code);
                }
                bail!("{}: {}", code, message);
            }
            Some(_) => continue,
            None => bail!("connection manager stopped"),
        }
    }

    let outcome = match args.exec {
        Some(code) => exec_once(&manager, &code, Duration::from_millis(args.timeout_ms)).await,
        None => interactive(&manager, &mut events_rx).await,
    };

    manager.teardown().await;
    outcome
}

async fn exec_once(manager: &ConnectionManager, code: &str, timeout: Duration) -> Result<()> {
    let response = manager.request(code, timeout).await?;
    println!("{}", response.text);
    if let Some(diagnostic) = response.diagnostic {
        bail!("board reported {}", diagnostic);
    }
    Ok(())
}

async fn interactive(manager: &ConnectionManager, events_rx: &mut mpsc::UnboundedReceiver<ReplEvent>) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line? {
                    Some(line) => manager.write(&line, None).await?,
                    None => break,
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(ReplEvent::Data(text)) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(ReplEvent::Status(ConnectionStatus::Failed { code, message })) => {
                        bail!("{} {}", code, message);
                    }
                    Some(ReplEvent::Status(status)) => log::info!("Status: {:?}", status),
                    None => break,
                }
            }
        }
    }
    Ok(())
}
