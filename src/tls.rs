use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` when the
/// server runs in plaintext. Partial pairs are rejected by [`Config`].
pub fn load_tls_acceptor(cfg: &Config) -> anyhow::Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())
    else {
        return Ok(None);
    };

    let cert_file =
        File::open(cert_path).with_context(|| format!("opening certificate {cert_path}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("reading certificate {cert_path}"))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate found in {cert_path}"));
    }

    let key_file = File::open(key_path).with_context(|| format!("opening key {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("reading key {key_path}"))?
        .ok_or_else(|| anyhow!("no private key found in {key_path}"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[test]
    fn plaintext_without_cert_pair() {
        let cfg = config(&[("ROOMBOOK_SECRET_KEY", "k")]);
        assert!(load_tls_acceptor(&cfg).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_names_the_path() {
        let cfg = config(&[
            ("ROOMBOOK_SECRET_KEY", "k"),
            ("ROOMBOOK_TLS_CERT", "/nonexistent/roombook.crt"),
            ("ROOMBOOK_TLS_KEY", "/nonexistent/roombook.key"),
        ]);
        let err = load_tls_acceptor(&cfg).err().unwrap();
        assert!(format!("{err:#}").contains("/nonexistent/roombook.crt"));
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = std::env::temp_dir().join("roombook_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.crt");
        let key = dir.join("empty.key");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let cfg = config(&[
            ("ROOMBOOK_SECRET_KEY", "k"),
            ("ROOMBOOK_TLS_CERT", cert.to_str().unwrap()),
            ("ROOMBOOK_TLS_KEY", key.to_str().unwrap()),
        ]);
        let err = load_tls_acceptor(&cfg).err().unwrap();
        assert!(err.to_string().contains("no certificate found"));
    }
}
