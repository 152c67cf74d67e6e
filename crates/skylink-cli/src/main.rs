//! Skylink CLI
//!
//! Relay-tunnel client with transport auto-switching

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use skylink_auth::{ClaimValidator, ConnectionType, mint_hs256};
use skylink_core::{AutoSwitchController, ClientConfig, SessionEngine, SessionError};
use skylink_transport::{TransportClient, TransportFactory};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

use config::ConfigFile;

/// Skylink - relay tunnels that survive blocked networks
#[derive(Parser)]
#[command(name = "skylink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path [default: <config dir>/skylink/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the relay and hold the session until Ctrl+C
    Connect {
        /// Bearer token
        #[arg(short, long)]
        token: String,

        /// Tunnel as id:local_port:remote_host:remote_port (repeatable)
        #[arg(long = "tunnel", value_name = "SPEC")]
        tunnels: Vec<TunnelSpec>,

        /// Relay host, overriding the configuration
        #[arg(long)]
        host: Option<String>,

        /// Primary transport: datagram, tunnel or rpc
        #[arg(long)]
        transport: Option<String>,

        /// Fallback transport
        #[arg(long)]
        fallback: Option<String>,

        /// Stay on the primary transport
        #[arg(long)]
        no_auto_switch: bool,
    },

    /// Token utilities
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Configuration file utilities
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Validate a token with the configured validator and print its claims
    Inspect {
        /// Token to inspect
        token: String,
    },

    /// Mint an HS256 token
    Mint {
        /// Signing secret
        #[arg(long)]
        secret: String,

        /// Subject
        #[arg(long)]
        sub: String,

        /// Tenant id
        #[arg(long)]
        tenant: Option<String>,

        /// client-server, server-server or p2p-mesh
        #[arg(long)]
        connection_type: Option<String>,

        /// Permission (repeatable)
        #[arg(long = "permission")]
        permissions: Vec<String>,

        /// Key id header
        #[arg(long)]
        kid: Option<String>,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

/// `id:local_port:remote_host:remote_port`
#[derive(Debug, Clone, PartialEq, Eq)]
struct TunnelSpec {
    id: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
}

impl FromStr for TunnelSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let usage = || format!("invalid tunnel '{s}' (expected id:local_port:remote_host:remote_port)");

        let (id, rest) = s.split_once(':').ok_or_else(usage)?;
        let (local_port, rest) = rest.split_once(':').ok_or_else(usage)?;
        // hosts may be IPv6 literals, so the remote port is taken from the right
        let (remote_host, remote_port) = rest.rsplit_once(':').ok_or_else(usage)?;
        let remote_host = remote_host.trim_start_matches('[').trim_end_matches(']');

        if id.is_empty() || remote_host.is_empty() {
            return Err(usage());
        }
        let local_port: u16 = local_port.parse().map_err(|_| usage())?;
        let remote_port: u16 = remote_port.parse().map_err(|_| usage())?;
        if local_port == 0 || remote_port == 0 {
            return Err(usage());
        }

        Ok(Self {
            id: id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let config = match &cli.command {
        Commands::Config {
            action: ConfigAction::Init { .. },
        } => ClientConfig::default(),
        _ if cli.config.is_some() => ClientConfig::load(&config_path)?,
        _ => ClientConfig::load_or_default(&config_path)?,
    };

    // RUST_LOG wins, then --log-level, then the configuration
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Connect {
            token,
            tunnels,
            host,
            transport,
            fallback,
            no_auto_switch,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(primary) = transport {
                config.transport.primary = primary;
            }
            if let Some(fallback) = fallback {
                config.transport.fallback = fallback;
            }
            if no_auto_switch {
                config.switch.enabled = false;
            }
            config.validate()?;
            connect(&config, &token, &tunnels).await?;
        }
        Commands::Token { action } => match action {
            TokenAction::Inspect { token } => {
                config.validate()?;
                inspect_token(&config, &token).await?;
            }
            TokenAction::Mint {
                secret,
                sub,
                tenant,
                connection_type,
                permissions,
                kid,
                ttl_secs,
            } => {
                let token = mint_token(
                    &secret,
                    &sub,
                    tenant.as_deref(),
                    connection_type.as_deref(),
                    &permissions,
                    kid.as_deref(),
                    ttl_secs,
                )?;
                println!("{token}");
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                ClientConfig::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
            ConfigAction::Show => {
                println!("# {}", config_path.display());
                print!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

async fn build_validator(config: &ClientConfig) -> anyhow::Result<Arc<ClaimValidator>> {
    let validator = ClaimValidator::new(config.validator_config()?, tracing::info_span!("claims"))
        .await
        .context("initializing token validator")?;
    Ok(Arc::new(validator))
}

/// Run a full session until Ctrl+C
async fn connect(config: &ClientConfig, token: &str, tunnels: &[TunnelSpec]) -> anyhow::Result<()> {
    let validator = build_validator(config).await?;
    let settings = config.transport_settings()?;
    let (primary_kind, fallback_kind) = (config.primary_kind()?, config.fallback_kind()?);
    let primary = TransportFactory::create(primary_kind, &settings);
    let fallback = TransportFactory::create(fallback_kind, &settings);

    let engine = Arc::new(
        SessionEngine::new(Arc::clone(&primary), validator, tracing::info_span!("session"))
            .with_mesh_settings(config.mesh_settings()?),
    );

    println!("Skylink {}", env!("CARGO_PKG_VERSION"));
    println!("Relay: {}", config.relay.host);
    println!("Transports: {primary_kind} (primary), {fallback_kind} (fallback)");

    dial(&engine, config, Arc::clone(&fallback)).await?;
    engine.authenticate(token).await?;

    for spec in tunnels {
        let tunnel = engine
            .create_tunnel(&spec.id, spec.local_port, &spec.remote_host, spec.remote_port)
            .await
            .with_context(|| format!("creating tunnel {}", spec.id))?;
        println!("Tunnel {}: {}", tunnel.tunnel_id, tunnel.mapping());
    }
    engine.start_heartbeat(config.heartbeat_interval()).await?;

    let session = engine.session().await;
    println!("Client: {}", session.client_id);
    if !session.tenant_id.is_empty() {
        println!("Tenant: {}", session.tenant_id);
    }
    if let Some(connection_type) = session.connection_type {
        println!("Connection type: {connection_type}");
    }
    if engine.mesh().is_running() {
        println!("Mesh peers: {}", engine.mesh().peer_count());
    }

    let controller = Arc::new(AutoSwitchController::new(
        Arc::clone(&engine),
        primary,
        fallback,
        config.switch_config(),
        config.retry_config(),
        tracing::info_span!("auto_switch"),
    )?);
    controller
        .on_switch(|from, to| println!("Switched transport: {from} -> {to}"))
        .await;
    let mut switch_task = controller.spawn();

    println!("\nSession ready on {}", engine.transport_kind());
    println!("Press Ctrl+C to stop");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.map_err(anyhow::Error::from),
        joined = &mut switch_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
    };

    println!("\nShutting down...");
    controller.stop();
    engine.close().await?;
    if !switch_task.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(2), switch_task).await;
    }

    let traffic = engine.metrics().traffic();
    println!(
        "Sent {} bytes / received {} bytes, {} transport switch(es)",
        traffic.bytes_sent,
        traffic.bytes_received,
        engine.metrics().switch_count()
    );
    outcome
}

/// Connect with backoff, moving to the fallback once the primary's retries
/// are used up
async fn dial(
    engine: &SessionEngine,
    config: &ClientConfig,
    fallback: Arc<dyn TransportClient>,
) -> anyhow::Result<()> {
    let retry = config.retry_config();
    let mut on_fallback = false;
    let mut attempt = 0;

    loop {
        match engine.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if retry.exhausted(attempt) {
                    if on_fallback || !config.switch.enabled {
                        return Err(SessionError::exhausted().into());
                    }
                    tracing::warn!(error = %e, "primary unreachable, trying fallback");
                    engine.switch_transport(Arc::clone(&fallback)).await?;
                    on_fallback = true;
                    attempt = 0;
                    continue;
                }
                let wait = retry.backoff_duration(attempt - 1);
                tracing::info!(attempt, ?wait, error = %e, "connect failed, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Validate a token and print its claims
async fn inspect_token(config: &ClientConfig, token: &str) -> anyhow::Result<()> {
    let validator = build_validator(config).await?;
    let claims = validator.validate(token).await?;

    println!("Validator: {}", validator.mode_name());
    println!("Subject: {}", claims.subject());
    println!("Connection type: {}", claims.connection_type());
    if let Some(exp) = claims.expires_at() {
        println!("Expires: {exp} (unix)");
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

fn mint_token(
    secret: &str,
    sub: &str,
    tenant: Option<&str>,
    connection_type: Option<&str>,
    permissions: &[String],
    kid: Option<&str>,
    ttl_secs: u64,
) -> anyhow::Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut claims = json!({
        "sub": sub,
        "iat": now,
        "exp": now + ttl_secs,
    });

    if let Some(tenant) = tenant {
        claims["tenant_id"] = json!(tenant);
    }
    if let Some(connection_type) = connection_type {
        let known = [
            ConnectionType::ClientServer,
            ConnectionType::ServerServer,
            ConnectionType::P2pMesh,
        ];
        if !known.iter().any(|ct| ct.as_str() == connection_type) {
            anyhow::bail!(
                "unknown connection type '{connection_type}' (expected client-server, server-server or p2p-mesh)"
            );
        }
        claims["connection_type"] = json!(connection_type);
    }
    if !permissions.is_empty() {
        claims["permissions"] = json!(permissions);
    }

    Ok(mint_hs256(&claims, secret.as_bytes(), kid)?)
}
