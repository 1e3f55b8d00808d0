// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switch_transfer::config::DEFAULT_HOST;
use switch_transfer::prelude::*;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "switch-transfer",
    version,
    about = "Download screenshots and clips from a console's temporary Wi-Fi hotspot"
)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join the hotspot and download every file the console offers
    Connect {
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: String,
    },
    /// Show the last completed download
    Status,
    /// Fetch from another host, or `default` for the built-in address
    Host { value: String },
}

enum CliEvent {
    State(SessionState),
    Error(SessionError),
    Completed,
}

/// Forwards session callbacks to the command loop.
struct CliListener {
    events: mpsc::UnboundedSender<CliEvent>,
}

impl SessionListener for CliListener {
    fn on_state_changed(&self, state: SessionState) {
        let _ = self.events.send(CliEvent::State(state));
    }

    fn on_session_error(&self, error: &SessionError) {
        let _ = self.events.send(CliEvent::Error(error.clone()));
    }

    fn on_session_completed(&self) {
        let _ = self.events.send(CliEvent::Completed);
    }
}

fn print_state(state: &DownloadState) {
    println!("{}", state.console_name);
    for (i, item) in state.items.iter().enumerate() {
        let kind = if item.is_video { "video" } else { "image" };
        let size = item
            .size
            .map_or_else(|| "?".to_string(), |size| size.to_string());
        println!(
            "  #{:<3} {:<6} {:<11} {:>10}/{:<10} {}",
            i,
            kind,
            format!("{:?}", item.status),
            item.downloaded,
            size,
            item.destination.as_deref().unwrap_or("-"),
        );
    }
}

async fn connect(config: &TransferConfig, ssid: &str, password: &str) -> Result<()> {
    let state_manager = StateManager::open(&config.state_path)
        .await
        .context("opening state database")?;
    let nmcli = (config.link == LinkBackend::Nmcli).then(|| Arc::new(NmcliLink::new()));
    let link: Arc<dyn NetworkLink> = match &nmcli {
        Some(nmcli) => nmcli.clone(),
        None => Arc::new(DirectLink),
    };
    let peer = Arc::new(HttpPeer::new(config.connect_timeout(), config.read_timeout())?);
    let store = Arc::new(
        DirectoryStore::open(&config.download_dir)
            .await
            .context("opening download directory")?,
    );

    let manager = TransferManager::spawn(
        config,
        Collaborators {
            link,
            peer,
            store,
            notifier: Arc::new(LogNotifier),
            state_manager,
        },
    )
    .await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    manager
        .add_listener(Arc::new(CliListener { events: events_tx }))
        .await?;
    manager.connect(ssid, password).await?;

    let mut started = false;
    let mut completed = false;
    let mut errors = Vec::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(CliEvent::State(SessionState::Idle)) if started => break,
                Some(CliEvent::State(state)) => started |= state != SessionState::Idle,
                Some(CliEvent::Error(e)) => {
                    error!(error = %e, "transfer failed");
                    errors.push(e);
                }
                Some(CliEvent::Completed) => completed = true,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, disconnecting");
                manager.disconnect();
            }
        }
    }

    if let Some(nmcli) = &nmcli {
        nmcli.wait_teardown().await;
    }
    if let Some(state) = manager.download_state().await? {
        print_state(&state);
    }
    if let Some(e) = errors.first() {
        bail!("{e}");
    }
    if !completed {
        bail!("transfer cancelled");
    }
    info!("all done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    switch_transfer::logging::init(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => TransferConfig::load(path)?,
        None => TransferConfig::default(),
    };

    match cli.command {
        Command::Connect { ssid, password } => connect(&config, &ssid, &password).await,
        Command::Status => {
            let state_manager = StateManager::open(&config.state_path).await?;
            match state_manager.load().await {
                Some(state) => print_state(&state),
                None => println!("no completed download"),
            }
            Ok(())
        }
        Command::Host { value } => {
            let state_manager = StateManager::open(&config.state_path).await?;
            state_manager.set_host_override(Some(&value)).await?;
            match state_manager.host_override().await? {
                Some(host) => println!("host set to {host}"),
                None => println!("host reset to {DEFAULT_HOST}"),
            }
            Ok(())
        }
    }
}
