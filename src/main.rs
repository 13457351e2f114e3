//! Rollcall - UDP session server and headless demo participant

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollcall::config::{self, Config};
use rollcall::network::{Client, NetworkConfig, Server, ServerEvent};
use rollcall::protocol::{self, ParticipantState, Rect, MAX_DATAGRAM_SIZE};

/// Rollcall - session layer for small multiplayer games
#[derive(Parser)]
#[command(name = "rollcall")]
#[command(author = "Rollcall Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Admit players, assign identities, broadcast who is where", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Server {
        /// Host to bind both sockets to
        #[arg(long)]
        host: Option<String>,

        /// Session socket port
        #[arg(short, long)]
        port: Option<u16>,

        /// Admission socket port
        #[arg(short, long)]
        admission_port: Option<u16>,

        /// Maximum concurrent participants
        #[arg(short, long)]
        max_clients: Option<usize>,

        /// Keep the admission socket open after the server fills up
        #[arg(long)]
        keep_admitting: bool,
    },

    /// Join a server as a headless demo participant
    Client {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server session port
        #[arg(short, long)]
        port: Option<u16>,

        /// Server admission port
        #[arg(short, long)]
        admission_port: Option<u16>,

        /// Display name (random if not given)
        #[arg(short, long)]
        name: Option<String>,

        /// Stop after this many frames
        #[arg(short, long)]
        frames: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            host,
            port,
            admission_port,
            max_clients,
            keep_admitting,
        } => {
            let mut net_config = config.network_config();
            override_addresses(&mut net_config, host, port, admission_port);
            if let Some(max_clients) = max_clients {
                net_config.max_clients = max_clients;
            }
            if keep_admitting {
                net_config = net_config.keep_admitting();
            }
            run_server(net_config).await?;
        }
        Commands::Client {
            host,
            port,
            admission_port,
            name,
            frames,
        } => {
            let mut net_config = config.network_config();
            override_addresses(&mut net_config, host, port, admission_port);
            let name = name
                .or(config.general.name.clone())
                .unwrap_or_else(random_name);
            run_client(net_config, name, frames).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

fn override_addresses(
    net_config: &mut NetworkConfig,
    host: Option<String>,
    port: Option<u16>,
    admission_port: Option<u16>,
) {
    if let Some(host) = host {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.session_port = port;
    }
    if let Some(admission_port) = admission_port {
        net_config.admission_port = admission_port;
    }
}

/// Run the session server
async fn run_server(net_config: NetworkConfig) -> anyhow::Result<()> {
    let mut server = Server::bind(net_config.clone()).await?;
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;
    let shutdown = server.shutdown_handle();

    println!("Waiting for clients...");

    let mut running = tokio::spawn(server.run());
    let mut joined = 0usize;

    loop {
        tokio::select! {
            result = &mut running => {
                result??;
                break;
            }
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ParticipantJoined { identity, addr, name } => {
                        joined += 1;
                        println!("Got a new client! {} ({}) as {} - {} so far", name, addr, identity, joined);
                    }
                    ServerEvent::ParticipantLeft { identity, name, reason, .. } => {
                        println!("Disconnected {} ({}): {}", name, identity, reason);
                    }
                    ServerEvent::AdmissionClosed { active } => {
                        println!("\nDone accepting clients ({} active)", active);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                shutdown.shutdown();
            }
        }
    }

    println!("\nShutdown");
    Ok(())
}

/// Run a headless participant that walks in a square
async fn run_client(net_config: NetworkConfig, name: String, frames: Option<u64>) -> anyhow::Result<()> {
    let frame = Duration::from_secs_f64(1.0 / f64::from(net_config.frame_rate.max(1)));
    let frame_rate = u64::from(net_config.frame_rate.max(1));
    let color = rand::thread_rng().gen_range(0..3);
    let mut local = ParticipantState::new(name.clone(), Rect::new(10, 10, 10, 10), color, false);

    let mut client = Client::new(net_config, local.clone());
    match client.connect().await {
        Ok(identity) => println!("Player: {} | Multiplayer: Enabled (ID {})", name, identity),
        Err(e) => println!("Player: {} | Multiplayer: Doesn't Work ({})", name, e),
    }

    let mut ping_timer = client.ping_timer();
    let mut ticker = tokio::time::interval(frame);
    let mut count = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let changed = step(&mut local, count);
        if client.is_connected() {
            if changed {
                if let Err(e) = client.send_state(local.clone()) {
                    tracing::debug!("State not queued: {}", e);
                }
            }
            if ping_timer.tick(changed) && client.queued() == 0 {
                if let Err(e) = client.send_ping() {
                    tracing::debug!("Ping not queued: {}", e);
                }
            }
        }

        if count % frame_rate == 0 {
            let others: Vec<String> = client
                .remote_participants()
                .iter()
                .map(|p| format!("{}@({},{})", p.name, p.rect.x, p.rect.y))
                .collect();
            println!(
                "{} at ({}, {}) | others: [{}]",
                local.name,
                local.rect.x,
                local.rect.y,
                others.join(", ")
            );
        }

        count += 1;
        if frames.is_some_and(|limit| count >= limit) {
            break;
        }
    }

    if client.is_connected() {
        client.disconnect().await?;
    }
    println!("closed");

    Ok(())
}

/// Move one frame along a square path; returns whether anything changed
fn step(state: &mut ParticipantState, frame: u64) -> bool {
    const SPEED: i32 = 3;
    const SIDE: u64 = 60;

    // every fourth side, stand still for a while
    let (dx, dy, flip) = match (frame / SIDE) % 5 {
        0 => (SPEED, 0, true),
        1 => (0, SPEED, state.flip),
        2 => (-SPEED, 0, false),
        3 => (0, -SPEED, state.flip),
        _ => return false,
    };

    state.rect.x += dx;
    state.rect.y += dy;
    state.flip = flip;
    true
}

fn random_name() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Print protocol information
fn print_protocol_info() {
    let defaults = NetworkConfig::default();

    println!("Rollcall Protocol Information");
    println!("=============================\n");
    println!("Transport: UDP, one JSON object per datagram");
    println!("Max datagram: {} bytes", MAX_DATAGRAM_SIZE);
    println!("Default host: {}", protocol::DEFAULT_HOST);
    println!("Session port: {}", protocol::DEFAULT_SESSION_PORT);
    println!("Admission port: {}", protocol::DEFAULT_ADMISSION_PORT);
    println!("Capacity: {}", defaults.max_clients);
    println!("Tick: {:?}", defaults.tick_interval());
    println!("\nControl signals: {{\"ping\": true}}, {{\"quit\": true}}");
    println!("Handshake reply: {{\"{}\": <id>}}", protocol::ASSIGNED_ID_KEY);
}
