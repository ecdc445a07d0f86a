//! Certificate/key loading and the rustls configs for terminating client
//! TLS and, optionally, dialing the backend over TLS. The relay never
//! requires a client certificate and never presents one to the backend by
//! default, so the configs use `with_no_client_auth`/plain root-store
//! verification rather than mTLS.

use std::{fs::File, io::BufReader, path::Path};

use anyhow::Result;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::config::Config;

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: std::result::Result<Vec<CertificateDer>, _> =
        parsed.map(|res| res.map(CertificateDer::from)).collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> Result<RootCertStore> {
    let ca_certs = cert_reader(ca_path.as_ref())?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        anyhow::bail!("CA-file did not contain any valid certs")
    }
    Ok(root_store)
}

/// Build the server-side TLS config used to terminate incoming client
/// connections, when `tls_cert_path`/`tls_key_path` are configured.
pub fn build_server_config(cfg: &Config) -> Result<ServerConfig> {
    let cert_path = cfg
        .tls_cert_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("ssl_certificate not configured"))?;
    let key_path = cfg
        .tls_key_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("ssl_certificate_key not configured"))?;

    let server_cert = cert_reader(cert_path)?;
    let privkey_server = privkey_reader(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(server_cert, privkey_server)?;

    Ok(config)
}

/// Build the client-side TLS config used to dial a backend over TLS, when
/// `backend_tls_ca` is configured. Off by default: a configuration-only
/// extension for backends that require TLS.
pub fn build_backend_client_config(ca_path: &str) -> Result<ClientConfig> {
    let root_store = load_root_store(ca_path)?;

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Write a throw-away self-signed cert/key pair to two temp files,
    /// returning their paths. Leaked into the OS temp dir; the OS cleans
    /// these up, and each test uses a distinct random suffix.
    fn write_throwaway_cert() -> (std::path::PathBuf, std::path::PathBuf) {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir();
        let suffix = format!("{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed));
        let cert_path = dir.join(format!("uds-tunnel-test-{suffix}.crt"));
        let key_path = dir.join(format!("uds-tunnel-test-{suffix}.key"));

        File::create(&cert_path).unwrap().write_all(cert.pem().as_bytes()).unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();

        (cert_path, key_path)
    }

    #[test]
    fn cert_reader_parses_a_self_signed_certificate() {
        let (cert_path, key_path) = write_throwaway_cert();
        let certs = cert_reader(&cert_path).expect("cert should parse");
        assert_eq!(certs.len(), 1);
        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_file(&key_path);
    }

    #[test]
    fn privkey_reader_parses_a_pkcs8_key() {
        let (cert_path, key_path) = write_throwaway_cert();
        privkey_reader(&key_path).expect("key should parse");
        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_file(&key_path);
    }

    #[test]
    fn build_server_config_succeeds_with_matching_cert_and_key() {
        let (cert_path, key_path) = write_throwaway_cert();
        let cfg = Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 7777,
            ipv6: false,
            tls_cert_path: Some(cert_path.to_string_lossy().to_string()),
            tls_key_path: Some(key_path.to_string_lossy().to_string()),
            tls_ciphers: None,
            backend_tls_ca: None,
            uds_server: "https://x".to_string(),
            uds_token: "t".to_string(),
            uds_timeout: std::time::Duration::from_secs(10),
            uds_verify_ssl: true,
            allow: std::collections::HashSet::new(),
            secret: "s".to_string(),
            workers: 8,
            log_level: "INFO".to_string(),
            log_file: "-".to_string(),
            allowed_fails: 5,
            fail_window: std::time::Duration::from_secs(60),
        };

        build_server_config(&cfg).expect("server config should build from a valid cert/key pair");
        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_file(&key_path);
    }

    #[test]
    fn cert_reader_errors_on_missing_file() {
        assert!(cert_reader("/nonexistent/path/does-not-exist.crt").is_err());
    }
}
