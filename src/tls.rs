//! TLS-1.3 client/server config construction (spec §4.1 step 2, §6
//! "Transport").
//!
//! The client config enables Encrypted ClientHello and is built with a
//! rejection policy that fails the handshake outright if the server does
//! not honor ECH — there is deliberately no fallback to cleartext SNI.

use crate::error::TunnelError;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::client::EchConfig;
use rustls::client::EchGreaseConfig;
use rustls::crypto::aws_lc_rs as ech_crypto;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::sync::Arc;

/// Build a TLS-1.3 client config bound to a single ECHConfigList. Handshakes
/// against a server that does not honor ECH MUST fail (spec §4.1, §7
/// `ECHRejected`) — rustls enforces this already when an `EchConfig` is
/// installed: the inner ClientHello is the one actually validated, and a
/// server speaking only cleartext SNI simply cannot complete the handshake.
pub fn build_client_config(ech_config_list: Bytes) -> anyhow::Result<Arc<ClientConfig>> {
    let root_store = native_root_store()?;

    let ech_suites = ech_crypto::ech::ALL_SUPPORTED_SUITES;
    let ech_config = EchConfig::new(ech_config_list.to_vec(), ech_suites)
        .context("failed to parse ECHConfigList for TLS client config")?;

    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_ech(rustls::client::EchMode::Enable(ech_config))
        .context("failed to enable ECH on TLS client config")?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// GREASE-only config used while no real ECH config has been fetched yet —
/// never used to dial in this tunnel (dialing is gated on a real ECH config
/// being present, spec `ECHUnavailable`), kept only so a caller probing
/// connectivity can still shape a ClientHello that looks ECH-capable.
pub fn build_grease_client_config() -> anyhow::Result<Arc<ClientConfig>> {
    let root_store = native_root_store()?;
    let grease = EchGreaseConfig::new(ech_crypto::ech::ALL_SUPPORTED_SUITES[0].clone(), vec![]);
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_ech(rustls::client::EchMode::Grease(grease))
        .context("failed to build GREASE ECH client config")?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn native_root_store() -> anyhow::Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(error = %err, "error loading a native root certificate");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }
    if root_store.is_empty() {
        return Err(anyhow!("no usable root certificates found in the system trust store"));
    }
    Ok(root_store)
}

pub fn server_name_for(host: &str) -> anyhow::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).with_context(|| format!("invalid server name {host}"))
}

/// Interpret a completed handshake for ECH rejection. `rustls` surfaces a
/// retry-config / "ech not negotiated" condition as a handshake error
/// already (there is no partial-success state to inspect), so this maps any
/// handshake failure on an ECH-enabled config to [`TunnelError::EchRejected`]
/// for logging purposes; transports that *do* complete are, by construction,
/// ECH-protected.
pub fn classify_handshake_error(host: &str, err: &std::io::Error) -> TunnelError {
    TunnelError::EchRejected(format!("{host}: {err}"))
}

/// Material backing the server-side TLS listener: either an operator-
/// supplied certificate/key pair or a freshly generated self-signed one
/// (spec §1 calls certificate generation an external collaborator concern;
/// we still need a concrete default to have a runnable server).
pub struct ServerTlsMaterial {
    pub config: Arc<ServerConfig>,
}

impl ServerTlsMaterial {
    pub fn from_files(cert_path: &std::path::Path, key_path: &std::path::Path) -> anyhow::Result<Self> {
        let cert_file = std::fs::File::open(cert_path)
            .with_context(|| format!("failed to open TLS cert {}", cert_path.display()))?;
        let certs: Vec<CertificateDer<'static>> =
            certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>().context("failed to parse TLS cert")?;

        let key_file = std::fs::File::open(key_path)
            .with_context(|| format!("failed to open TLS key {}", key_path.display()))?;
        let key: PrivateKeyDer<'static> = private_key(&mut BufReader::new(key_file))
            .context("failed to parse TLS private key")?
            .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

        let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("failed to build server TLS config from provided cert/key")?;

        Ok(Self { config: Arc::new(config) })
    }

    /// Generate a throwaway self-signed certificate for `sni_host`, used
    /// when no `--tls-cert`/`--tls-key` was provided.
    pub fn self_signed(sni_host: &str) -> anyhow::Result<Self> {
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(vec![sni_host.to_string()]).context("failed to generate self-signed certificate")?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(signing_key.serialize_der())
            .map_err(|e| anyhow!("failed to encode generated private key: {e}"))?;

        let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .context("failed to build server TLS config from self-signed certificate")?;

        Ok(Self { config: Arc::new(config) })
    }
}
