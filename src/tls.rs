use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTSWAP_TLS_CERT and SLOTSWAP_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_kind(cert: Option<&str>, key: Option<&str>) -> Option<ErrorKind> {
        match load_tls_acceptor(cert, key) {
            Ok(_) => None,
            Err(e) => Some(e.kind()),
        }
    }

    #[test]
    fn neither_path_disables_tls() {
        assert!(matches!(load_tls_acceptor(None, None), Ok(None)));
    }

    #[test]
    fn cert_and_key_must_come_together() {
        assert_eq!(error_kind(Some("cert.pem"), None), Some(ErrorKind::InvalidInput));
        assert_eq!(error_kind(None, Some("key.pem")), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let dir = std::env::temp_dir().join("slotswap_test_tls_missing");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        assert_eq!(
            error_kind(cert.to_str(), key.to_str()),
            Some(ErrorKind::NotFound)
        );
    }

    #[test]
    fn key_file_without_a_key_is_rejected() {
        let dir = std::env::temp_dir().join("slotswap_test_tls_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        assert_eq!(
            error_kind(cert.to_str(), key.to_str()),
            Some(ErrorKind::InvalidInput)
        );
    }
}
