//! rustls connector built from PEM files.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::{SqlConfig, SslMode};
use raidstore_common::{Error, Result};

/// Build a TLS connector for `mode`, or `None` when it is `disable`.
///
/// `mode` is the effective mode after a connection url has been applied,
/// which may differ from `config.sslmode`. Server certificates are always verified against `sslroot`, hostname
/// included.
///
/// # Errors
/// - `sslroot` missing while TLS is enabled
/// - Only one of `sslcert` / `sslkey` set
/// - A PEM file cannot be read or holds no usable item
pub fn connector(config: &SqlConfig, mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    if mode == SslMode::Disable {
        return Ok(None);
    }

    let root_path = config.sslroot.as_deref().ok_or_else(|| {
        Error::InvalidInput("sslroot is required unless sslmode is disable".to_string())
    })?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(root_path)? {
        roots
            .add(cert)
            .map_err(|e| Error::InvalidInput(format!("Invalid root certificate: {}", e)))?;
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Storage(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(roots);

    let tls = match (&config.sslcert, &config.sslkey) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::InvalidInput(format!("Invalid client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::InvalidInput(
                "sslcert and sslkey must be set together".to_string(),
            ))
        }
    };

    Ok(Some(MakeRustlsConnect::new(tls)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::InvalidInput(format!(
            "No certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut data.as_slice())?
        .ok_or_else(|| Error::InvalidInput(format!("No private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_disabled_needs_nothing() {
        assert!(connector(&SqlConfig::default(), SslMode::Disable)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_root_required() {
        let config = SqlConfig {
            sslmode: SslMode::VerifyFull,
            ..SqlConfig::default()
        };
        assert!(matches!(
            connector(&config, config.sslmode),
            Err(Error::InvalidInput(_))
        ));
        // the effective mode decides, not the configured field
        assert!(matches!(
            connector(&SqlConfig::default(), SslMode::Require),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"not a certificate").unwrap();

        let config = SqlConfig {
            sslmode: SslMode::Require,
            sslroot: Some(PathBuf::from(temp.path())),
            ..SqlConfig::default()
        };
        assert!(matches!(
            connector(&config, config.sslmode),
            Err(Error::InvalidInput(_))
        ));
    }
}
