use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use tracing::info;

/// Build a rustls server config from a PEM certificate chain and private
/// key. Certificate sourcing is an external concern; the gateway only reads
/// the two configured paths.
pub fn build_tls_config(cert_file: &str, key_file: &str) -> Result<rustls::ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_file).with_context(|| format!("Failed to open certificate {}", cert_file))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to parse certificate {}", cert_file))?;

    let mut key_reader = BufReader::new(
        File::open(key_file).with_context(|| format!("Failed to open private key {}", key_file))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("Failed to parse private key {}", key_file))?
        .context("No private key found in key file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate/key pair rejected")?;

    info!(cert = %cert_file, "TLS configuration loaded");
    Ok(config)
}
