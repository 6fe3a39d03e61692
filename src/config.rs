//! Configuration surface (CLI argument parsing lives here per spec §6 — the
//! wire/runtime contract it describes, not flag parsing itself, which is
//! named in spec §1 as an external collaborator. `clap` is the teacher's own
//! choice for this and is kept unchanged.)

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "wstunnel-ech", about = "ECH-protected multi-channel TCP/UDP tunnel")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Optional YAML config file overlaying the CLI flags below.
    #[arg(long, global = true, env = "WSTUNNEL_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Client(ClientArgs),
    Server(ServerArgs),
}

#[derive(Debug, Parser, Deserialize, Default)]
pub struct ClientArgs {
    /// wss:// URL of the remote gateway.
    #[arg(long, env = "WSTUNNEL_WS_URL")]
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Repeatable local listener spec: `socks5://bind`, `http://bind`, or
    /// `tcp://bind:target_host:target_port`.
    #[arg(short = 'L', long = "local-to-remote", value_name = "SPEC")]
    #[serde(default)]
    pub local_to_remote: Vec<String>,

    #[arg(long, default_value_t = 3, env = "WSTUNNEL_POOL_SIZE")]
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[arg(long, env = "WSTUNNEL_TOKEN")]
    #[serde(default)]
    pub token: Option<String>,

    /// Pin the TCP connect to this IP while keeping SNI = WS host.
    #[arg(long)]
    #[serde(default)]
    pub sni_pin_ip: Option<IpAddr>,

    #[arg(long, default_value = "https://dns.google/dns-query")]
    #[serde(default = "default_doh_server")]
    pub doh_server: String,

    /// Domain whose HTTPS (type 65) record carries the ECH config.
    #[arg(long)]
    #[serde(default)]
    pub ech_domain: Option<String>,

    #[arg(long)]
    #[serde(default)]
    pub socks5_user: Option<String>,

    #[arg(long)]
    #[serde(default)]
    pub socks5_password: Option<String>,
}

fn default_pool_size() -> usize {
    3
}
fn default_doh_server() -> String {
    "https://dns.google/dns-query".to_string()
}

#[derive(Debug, Parser, Deserialize, Default)]
pub struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:8443")]
    #[serde(default = "default_server_listen")]
    pub listen: String,

    /// Repeatable CIDR allowed to connect, e.g. `10.0.0.0/8`.
    #[arg(long = "allow-cidr", value_name = "CIDR")]
    #[serde(default)]
    pub allow_cidr: Vec<String>,

    #[arg(long, env = "WSTUNNEL_TOKEN")]
    #[serde(default)]
    pub token: Option<String>,

    #[arg(long)]
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[arg(long)]
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

fn default_server_listen() -> String {
    "0.0.0.0:8443".to_string()
}

/// A fully resolved client-side runtime configuration.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub ws_scheme_is_tls: bool,
    pub ws_host: String,
    pub ws_port: u16,
    pub http_upgrade_path_prefix: String,
    pub pool_size: usize,
    pub protocol_token: Option<String>,
    pub sni_pin_ip: Option<IpAddr>,
    pub doh_server: String,
    pub ech_domain: String,
}

impl WsClientConfig {
    pub fn from_args(args: &ClientArgs) -> anyhow::Result<Self> {
        let ws_url = args.ws_url.as_deref().ok_or_else(|| anyhow!("--ws-url is required"))?;
        let url = url::Url::parse(ws_url).with_context(|| format!("invalid --ws-url {ws_url}"))?;
        if url.scheme() != "wss" {
            return Err(anyhow!("--ws-url must use the wss:// scheme, got {}", url.scheme()));
        }
        let ws_host = url.host_str().ok_or_else(|| anyhow!("--ws-url is missing a host"))?.to_string();
        let ws_port = url.port().unwrap_or(443);
        let ech_domain = args.ech_domain.clone().unwrap_or_else(|| ws_host.clone());

        Ok(Self {
            ws_scheme_is_tls: true,
            ws_host,
            ws_port,
            http_upgrade_path_prefix: url.path().trim_matches('/').to_string(),
            pool_size: args.pool_size.max(1),
            protocol_token: args.token.clone().filter(|t| !t.is_empty()),
            sni_pin_ip: args.sni_pin_ip,
            doh_server: args.doh_server.clone(),
            ech_domain,
        })
    }
}

/// A fully resolved server-side runtime configuration.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub listen: SocketAddr,
    pub allow_cidr: Vec<IpNet>,
    pub token: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl WsServerConfig {
    pub fn from_args(args: &ServerArgs) -> anyhow::Result<Self> {
        let listen: SocketAddr = args.listen.parse().with_context(|| format!("invalid --listen {}", args.listen))?;
        let allow_cidr = args
            .allow_cidr
            .iter()
            .map(|c| c.parse::<IpNet>().with_context(|| format!("invalid --allow-cidr {c}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            listen,
            allow_cidr,
            token: args.token.clone().filter(|t| !t.is_empty()),
            tls_cert: args.tls_cert.clone(),
            tls_key: args.tls_key.clone(),
        })
    }

    pub fn cidr_allowed(&self, ip: IpAddr) -> bool {
        self.allow_cidr.is_empty() || self.allow_cidr.iter().any(|net| net.contains(&ip))
    }
}

/// One locally-terminated listener: SOCKS5 proxy, HTTP(S) CONNECT proxy, or
/// a plain TCP port-forward (spec §6's local listener CLI surface).
#[derive(Debug, Clone)]
pub enum LocalListener {
    Socks5 { listen: SocketAddr, username: Option<String>, password: Option<String> },
    HttpProxy { listen: SocketAddr },
    TcpForward { listen: SocketAddr, target: String },
}

pub fn parse_local_listeners(args: &ClientArgs) -> anyhow::Result<Vec<LocalListener>> {
    args.local_to_remote
        .iter()
        .map(|spec| parse_one_listener(spec, args))
        .collect()
}

fn parse_one_listener(spec: &str, args: &ClientArgs) -> anyhow::Result<LocalListener> {
    if let Some(rest) = spec.strip_prefix("socks5://") {
        let listen: SocketAddr = rest.parse().with_context(|| format!("invalid SOCKS5 listen address {rest}"))?;
        return Ok(LocalListener::Socks5 {
            listen,
            username: args.socks5_user.clone(),
            password: args.socks5_password.clone(),
        });
    }
    if let Some(rest) = spec.strip_prefix("http://") {
        let listen: SocketAddr = rest.parse().with_context(|| format!("invalid HTTP proxy listen address {rest}"))?;
        return Ok(LocalListener::HttpProxy { listen });
    }
    if let Some(rest) = spec.strip_prefix("tcp://") {
        let (listen, target) = rest
            .split_once(':')
            .and_then(|(l, rest)| rest.rsplit_once(':').map(|(h, p)| (l, h, p)))
            .map(|(l, h, p)| (format!("{l}"), format!("{h}:{p}")))
            .ok_or_else(|| anyhow!("expected tcp://listen_host:listen_port:target_host:target_port, got {spec}"))?;
        let listen: SocketAddr = listen.parse().with_context(|| format!("invalid TCP forward listen address {listen}"))?;
        return Ok(LocalListener::TcpForward { listen, target });
    }
    Err(anyhow!("unrecognized local listener spec {spec:?}, expected socks5://, http://, or tcp:// prefix"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socks5_listener() {
        let args = ClientArgs { local_to_remote: vec!["socks5://127.0.0.1:1080".into()], ..Default::default() };
        let listeners = parse_local_listeners(&args).unwrap();
        assert!(matches!(listeners[0], LocalListener::Socks5 { .. }));
    }

    #[test]
    fn parses_tcp_forward_listener() {
        let args = ClientArgs { local_to_remote: vec!["tcp://127.0.0.1:10001:127.0.0.1:7".into()], ..Default::default() };
        let listeners = parse_local_listeners(&args).unwrap();
        match &listeners[0] {
            LocalListener::TcpForward { listen, target } => {
                assert_eq!(listen.to_string(), "127.0.0.1:10001");
                assert_eq!(target, "127.0.0.1:7");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_tls_ws_url() {
        let args = ClientArgs { ws_url: Some("ws://example.com/tunnel".into()), ..Default::default() };
        assert!(WsClientConfig::from_args(&args).is_err());
    }
}
