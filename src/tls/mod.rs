use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::TlsSettings;

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("no certificates in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("certificate and key do not form a usable pair: {0}")]
    Pair(#[from] rustls::Error),
}

// -----------------------------------------------------------------------------
// ----- TLS: Exported ---------------------------------------------------------

/// Acceptor for `wss://` listeners. `None` settings means plain TCP.
pub fn acceptor(settings: Option<&TlsSettings>) -> Result<Option<TlsAcceptor>, TlsError> {
    let Some(settings) = settings else {
        return Ok(None);
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain(&settings.cert)?, private_key(&settings.key)?)?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

// -----------------------------------------------------------------------------
// ----- TLS: Private helpers --------------------------------------------------

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_error(path, source))
}

fn read_error(path: &Path, source: io::Error) -> TlsError {
    TlsError::Read {
        path: path.to_path_buf(),
        source,
    }
}

fn cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut pem = open_pem(path)?;
    let chain = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| read_error(path, source))?;

    if chain.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(chain)
}

fn private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut pem = open_pem(path)?;
    rustls_pemfile::private_key(&mut pem)
        .map_err(|source| read_error(path, source))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn not_pem() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a pem file\n").unwrap();
        file
    }

    #[test]
    fn no_settings_means_plain_tcp() {
        assert!(acceptor(None).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_reported() {
        let settings = TlsSettings {
            cert: PathBuf::from("/nonexistent/server.crt"),
            key: PathBuf::from("/nonexistent/server.key"),
        };
        let err = acceptor(Some(&settings)).err().expect("expected an error");
        assert!(matches!(err, TlsError::Read { ref path, .. } if path == &settings.cert));
    }

    #[test]
    fn files_without_pem_blocks_are_rejected() {
        let file = not_pem();
        assert!(matches!(
            cert_chain(file.path()),
            Err(TlsError::NoCertificates(_))
        ));
        assert!(matches!(
            private_key(file.path()),
            Err(TlsError::NoPrivateKey(_))
        ));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
