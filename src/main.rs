use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wstunnel_ech::config::{self, Cli, Command, LocalListener, WsClientConfig, WsServerConfig};
use wstunnel_ech::ech::{self, DohEchConfigSource, EchConfigSource};
use wstunnel_ech::tls::ServerTlsMaterial;
use wstunnel_ech::tunnel::pool::Pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cli = apply_config_overlay(cli)?;

    match cli.command {
        Command::Client(args) => run_client(args).await,
        Command::Server(args) => run_server(args).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

/// Overlay an optional YAML config file onto the CLI-parsed args; CLI flags
/// that were actually supplied always win (`clap`'s values are already
/// authoritative, the file only fills gaps left as defaults).
fn apply_config_overlay(cli: Cli) -> anyhow::Result<Cli> {
    let Some(path) = &cli.config else { return Ok(cli) };
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    match cli.command {
        Command::Client(args) => {
            let overlay: config::ClientArgs =
                serde_yaml::from_str(&contents).with_context(|| format!("failed to parse client config {}", path.display()))?;
            Ok(Cli { command: Command::Client(merge_client(args, overlay)), config: cli.config })
        }
        Command::Server(args) => {
            let overlay: config::ServerArgs =
                serde_yaml::from_str(&contents).with_context(|| format!("failed to parse server config {}", path.display()))?;
            Ok(Cli { command: Command::Server(merge_server(args, overlay)), config: cli.config })
        }
    }
}

fn merge_client(cli: config::ClientArgs, file: config::ClientArgs) -> config::ClientArgs {
    config::ClientArgs {
        ws_url: cli.ws_url.or(file.ws_url),
        local_to_remote: if cli.local_to_remote.is_empty() { file.local_to_remote } else { cli.local_to_remote },
        pool_size: cli.pool_size,
        token: cli.token.or(file.token),
        sni_pin_ip: cli.sni_pin_ip.or(file.sni_pin_ip),
        doh_server: cli.doh_server,
        ech_domain: cli.ech_domain.or(file.ech_domain),
        socks5_user: cli.socks5_user.or(file.socks5_user),
        socks5_password: cli.socks5_password.or(file.socks5_password),
    }
}

fn merge_server(cli: config::ServerArgs, file: config::ServerArgs) -> config::ServerArgs {
    config::ServerArgs {
        listen: cli.listen,
        allow_cidr: if cli.allow_cidr.is_empty() { file.allow_cidr } else { cli.allow_cidr },
        token: cli.token.or(file.token),
        tls_cert: cli.tls_cert.or(file.tls_cert),
        tls_key: cli.tls_key.or(file.tls_key),
    }
}

async fn run_client(args: config::ClientArgs) -> anyhow::Result<()> {
    let cfg = WsClientConfig::from_args(&args)?;
    let listeners: Vec<LocalListener> = config::parse_local_listeners(&args)?;
    if listeners.is_empty() {
        anyhow::bail!("at least one -L/--local-to-remote listener is required");
    }

    let ech_source: Arc<dyn EchConfigSource> = Arc::new(DohEchConfigSource::new(cfg.doh_server.clone()));
    info!(domain = %cfg.ech_domain, "priming ECH config");
    ech::prime(&ech_source, &cfg.ech_domain).await;

    let pool = Pool::new(cfg, ech_source);
    pool.start();
    wstunnel_ech::client::spawn_listeners(listeners, pool);

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested, exiting");
    Ok(())
}

async fn run_server(args: config::ServerArgs) -> anyhow::Result<()> {
    let cfg = Arc::new(WsServerConfig::from_args(&args)?);

    let tls = match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert), Some(key)) => ServerTlsMaterial::from_files(cert, key)?,
        _ => {
            info!("no --tls-cert/--tls-key provided, generating a self-signed certificate");
            ServerTlsMaterial::self_signed(&cfg.listen.ip().to_string())?
        }
    };

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_for_signal.cancel();
        }
    });

    wstunnel_ech::server::serve(cfg, Arc::new(tls), shutdown).await
}
