use socksprobe::api::{self, StatusResponse};
use socksprobe::config::{Config, ProbeSettings};
use socksprobe::probe::{self, Credentials, ProbeConfig};
use socksprobe::state::State;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use clap::{Parser, Subcommand};

// TUI Imports
use crossterm::{
    ExecutableCommand,
    event::{self, KeyCode, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, Row, Table},
};

/// socksprobe: SOCKS5 proxy prober and local control-plane daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane daemon
    Run {
        /// Path to the configuration file (built-in defaults when omitted)
        #[arg(short, long)]
        config: Option<String>,
        /// Override the API listen address
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
    },
    /// Probe a SOCKS5 server once and print the summary
    Probe {
        /// Proxy address, host:port
        #[arg(short, long)]
        server: String,
        /// CONNECT destination, host:port
        #[arg(short, long, default_value = probe::DEFAULT_CONNECT_TARGET)]
        target: String,
        /// Budget for the whole probe
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
        /// Also try UDP ASSOCIATE
        #[arg(long)]
        udp: bool,
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "socksprobe.toml")]
        config: String,
    },
    /// Show current daemon state
    Show {
        /// Watch mode (interactive TUI)
        #[arg(short, long)]
        watch: bool,
        /// API URL
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        api: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: None,
        listen: None,
    }) {
        Commands::Run { config, listen } => run_daemon(config.as_deref(), listen).await,
        Commands::Probe {
            server,
            target,
            timeout_ms,
            udp,
            username,
            password,
        } => {
            let auth = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials { username, password }),
                _ => None,
            };
            let config = ProbeConfig {
                server,
                timeout: Duration::from_millis(timeout_ms),
                auth,
                connect_target: target,
                udp_test: udp,
            };
            probe_once(&config).await
        }
        Commands::Validate { config } => validate_config(&config),
        Commands::Show { watch, api } => show_state(watch, &api).await,
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("API Listen: {}", cfg.api.listen);
            match cfg.probe.periodic() {
                Some((server, every)) => info!("Periodic probe: {} every {:?}", server, every),
                None => info!("Periodic probe: disabled"),
            }
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn probe_once(config: &ProbeConfig) -> anyhow::Result<()> {
    let (summary, result) = probe::probe_socks(config, None).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    result.map_err(|e| anyhow::anyhow!("probe failed: {}", e))
}

async fn run_daemon(
    config_path: Option<&str>,
    listen: Option<std::net::SocketAddr>,
) -> anyhow::Result<()> {
    // 1. Load Config
    let mut config = match config_path {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow::anyhow!("failed to load config '{}': {}", path, e))?,
        None => Config::default(),
    };
    if let Some(addr) = listen {
        config.api.listen = addr;
    }

    let state = Arc::new(State::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 2. Spawn API
    let listener = tokio::net::TcpListener::bind(config.api.listen).await?;
    info!("API Server running at http://{}", listener.local_addr()?);
    let api_state = state.clone();
    let api_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = api::serve(listener, api_state, api_shutdown).await {
            error!("API Server Error: {}", e);
        }
    });

    // 3. Periodic probe
    let prober = tokio::spawn(probe_loop(state.clone(), config.probe.clone(), shutdown_rx));

    // Signal handling
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.api.shutdown_secs);
    if tokio::time::timeout(grace, async {
        let _ = server.await;
        let _ = prober.await;
    })
    .await
    .is_err()
    {
        warn!("Shutdown did not finish within {:?}", grace);
    }

    Ok(())
}

async fn probe_loop(
    state: Arc<State>,
    settings: ProbeSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some((server, every)) = settings.periodic() else {
        return;
    };
    let config = settings.probe_config(server);
    info!("Probing {} every {:?}", server, every);

    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|&v| v) => break,
        }
        let (summary, _) = probe::probe_socks(&config, Some(shutdown.clone())).await;
        state.update_probe(summary);
    }
}

async fn fetch_status(api_url: &str) -> anyhow::Result<StatusResponse> {
    let resp = reqwest::get(format!("{}/v1/status", api_url)).await?;
    Ok(resp.error_for_status()?.json::<StatusResponse>().await?)
}

async fn show_state(watch: bool, api_url: &str) -> anyhow::Result<()> {
    if watch {
        run_tui(api_url).await
    } else {
        match fetch_status(api_url).await {
            Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            Err(e) => eprintln!("Failed to connect to API: {}", e),
        }
        Ok(())
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "ok"
    } else {
        "fail"
    }
}

async fn run_tui(api_url: &str) -> anyhow::Result<()> {
    std::io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;

    loop {
        let status_opt = fetch_status(api_url).await.ok();

        terminal.draw(|frame| {
            let layout = Layout::default()
                .direction(Direction::Vertical)
                .constraints(vec![
                    Constraint::Length(3),
                    Constraint::Length(8),
                    Constraint::Min(0),
                ])
                .split(frame.area());

            if let Some(status) = &status_opt {
                let snap = &status.snapshot;
                let title = Paragraph::new(format!(
                    "State: {} | Uptime: {}s | TUN: {} ({}) | tun2socks pid: {}",
                    snap.agent_state,
                    status.uptime_sec,
                    if snap.tun.name.is_empty() {
                        "-"
                    } else {
                        snap.tun.name.as_str()
                    },
                    if snap.tun.up { "up" } else { "down" },
                    snap.tun2socks.pid,
                ))
                .block(Block::default().borders(Borders::ALL).title("Status"));
                frame.render_widget(title, layout[0]);

                let probe = &snap.last_probe;
                let latency = |key: &str| {
                    probe
                        .latencies_ms
                        .get(key)
                        .map(|ms| format!("{} ms", ms))
                        .unwrap_or_else(|| "-".to_string())
                };
                let steps = [
                    ("TCP connect", probe.reachable, "tcp_connect"),
                    ("SOCKS handshake", probe.socks_ok, "socks_handshake"),
                    ("CONNECT", probe.connect_ok, "connect"),
                    ("UDP ASSOCIATE", probe.udp_ok, "udp_associate"),
                ];
                let rows: Vec<Row> = steps
                    .iter()
                    .map(|(name, ok, key)| {
                        Row::new(vec![
                            name.to_string(),
                            yes_no(*ok).to_string(),
                            latency(key),
                        ])
                    })
                    .collect();
                let checked = probe
                    .last_checked
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let table = Table::new(
                    rows,
                    [
                        Constraint::Percentage(40),
                        Constraint::Percentage(20),
                        Constraint::Percentage(20),
                    ],
                )
                .header(Row::new(vec!["Step", "Result", "Latency"]))
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title(format!("Last probe ({})", checked)),
                );
                frame.render_widget(table, layout[1]);

                let warnings: Vec<String> = snap
                    .warnings
                    .iter()
                    .chain(probe.warnings.iter())
                    .cloned()
                    .collect();
                let body = if warnings.is_empty() {
                    "none".to_string()
                } else {
                    warnings.join("\n")
                };
                let warnings = Paragraph::new(body)
                    .block(Block::default().borders(Borders::ALL).title("Warnings"));
                frame.render_widget(warnings, layout[2]);
            } else {
                frame.render_widget(Paragraph::new("Connecting to daemon API..."), layout[0]);
            }
        })?;

        if event::poll(std::time::Duration::from_millis(1000))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && key.code == KeyCode::Char('q') {
                    break;
                }
            }
        }
    }

    disable_raw_mode()?;
    std::io::stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}
