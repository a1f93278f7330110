//! Mutual-TLS plumbing for the serve subcommand: a TLS 1.3-only rustls
//! config and an accept loop that hands established streams to tonic.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("no certificate found in {0}")]
    EmptyCertChain(PathBuf),
    #[error("no private key found in {0}")]
    MissingKey(PathBuf),
    #[error("CA certificate rejected: {0}")]
    BadCaCert(rustls::Error),
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("server TLS config: {0}")]
    Config(#[from] rustls::Error),
}

/// Builds the server-side rustls config: TLS 1.3 only, this server's identity
/// from `cert`/`key`, and client certificates required and verified against
/// the CA bundle.
pub fn server_config(cert: &Path, key: &Path, ca: &Path) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert)?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertChain(cert.to_path_buf()));
    }
    let key = load_key(key)?;

    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca)? {
        roots.add(ca_cert).map_err(TlsError::BadCaCert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingKey(path.to_path_buf()))
}

/// Accepts TCP connections and completes handshakes off the accept loop so a
/// slow client cannot stall other connections. Handshake failures drop that
/// connection only; the listener keeps serving. The stream ends when the
/// server side is dropped.
pub fn incoming(
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> ReceiverStream<io::Result<TlsStream<TcpStream>>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                conn = listener.accept() => conn,
                _ = tx.closed() => return,
            };
            let (stream, peer) = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "accepting connection");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        let _ = tx.send(Ok(tls)).await;
                    }
                    Err(err) => debug!(%peer, error = %err, "TLS handshake failed"),
                }
            });
        }
    });
    ReceiverStream::new(rx)
}
