//! QUIC tunnel transport.
//!
//! One QUIC connection per side; each tunnel link is one bidirectional
//! stream on it. ALPN is `moto-accel`. When no certificate is configured the
//! server generates a self-signed one at startup (validity one year) and the
//! client skips verification; production certificate validation is an
//! external concern.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::{Connection, Endpoint};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::Mutex;

use super::{LinkIo, TunnelDialer, ALPN};
use crate::error::{Error, Result, TransportError};

fn quic_err(e: impl std::fmt::Display) -> Error {
    TransportError::Quic(e.to_string()).into()
}

fn tls_err(e: impl std::fmt::Display) -> Error {
    TransportError::Tls(e.to_string()).into()
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Load a PEM cert/key pair, or generate a self-signed certificate valid
/// for one year when no paths are configured.
fn load_or_generate_cert(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let (Some(cert_path), Some(key_path)) = (cert_path, key_path) {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        let certs = rustls_pemfile_certs(&cert_pem)?;
        let key = rustls_pemfile_key(&key_pem)?;
        return Ok((certs, key));
    }

    let mut params = rcgen::CertificateParams::new(vec!["moto".to_string()]).map_err(tls_err)?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);
    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok((vec![cert_der], key_der.into()))
}

fn rustls_pemfile_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_err)?;
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificate in PEM file".into()).into());
    }
    Ok(certs)
}

fn rustls_pemfile_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut rd = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut rd)
        .map_err(tls_err)?
        .ok_or_else(|| TransportError::Tls("no private key in PEM file".into()).into())
}

/// Certificate verifier that accepts anything; the tunnel admits a PKI
/// layer but does not mandate one.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn link_io_from_bi(
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    peer: String,
) -> LinkIo {
    LinkIo {
        reader: Box::new(recv),
        writer: Box::new(send),
        peer,
    }
}

/// Dials tunnel links as bidirectional streams on a shared QUIC connection.
/// The connection is (re-)established lazily when a link is requested.
pub struct QuicDialer {
    endpoint: Endpoint,
    conn: Mutex<Option<Connection>>,
}

impl QuicDialer {
    pub fn new() -> Result<Self> {
        install_crypto_provider();

        let mut tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth();
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(tls_err)?,
        ));

        let mut endpoint =
            Endpoint::client("0.0.0.0:0".parse().expect("static addr")).map_err(quic_err)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self, remote: &str) -> Result<Connection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let addr = resolve_one(remote).await?;
        let server_name = remote.rsplit_once(':').map_or(remote, |(host, _)| host);
        let conn = self
            .endpoint
            .connect(addr, server_name)
            .map_err(quic_err)?
            .await
            .map_err(quic_err)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl TunnelDialer for QuicDialer {
    async fn dial(&self, remote: &str) -> Result<LinkIo> {
        let conn = self.connection(remote).await?;
        let peer = format!("{} (quic)", conn.remote_address());
        match conn.open_bi().await {
            Ok((send, recv)) => Ok(link_io_from_bi(send, recv, peer)),
            Err(e) => {
                // Connection died between handshake and stream open; drop it
                // so the next dial reconnects.
                *self.conn.lock().await = None;
                Err(quic_err(e))
            }
        }
    }
}

async fn resolve_one(remote: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(remote)
        .await
        .map_err(|e| Error::DialFailed {
            addr: remote.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| Error::DialFailed {
            addr: remote.to_string(),
            reason: "no addresses resolved".into(),
        })
}

/// Server-side QUIC tunnel listener. Accepts connections and yields every
/// bidirectional stream the peer opens as one link.
pub struct QuicTunnelListener {
    endpoint: Endpoint,
    incoming: Mutex<tokio::sync::mpsc::Receiver<LinkIo>>,
    incoming_tx: tokio::sync::mpsc::Sender<LinkIo>,
}

impl QuicTunnelListener {
    pub fn bind(
        addr: &str,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<Self> {
        install_crypto_provider();

        let (certs, key) = load_or_generate_cert(cert_path, key_path)?;
        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_err)?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls).map_err(tls_err)?,
        ));

        let bind_addr: SocketAddr = addr.parse().map_err(|e| TransportError::BindFailed {
            addr: addr.to_string(),
            reason: format!("{e}"),
        })?;
        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(|e| TransportError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let (incoming_tx, incoming) = tokio::sync::mpsc::channel(16);
        Ok(Self {
            endpoint,
            incoming: Mutex::new(incoming),
            incoming_tx,
        })
    }

    /// Accept the next inbound link (a bidirectional stream on any peer
    /// connection).
    pub async fn accept(&self) -> Result<LinkIo> {
        loop {
            let mut rx = self.incoming.lock().await;
            tokio::select! {
                Some(io) = rx.recv() => return Ok(io),
                conn = self.endpoint.accept() => {
                    drop(rx);
                    let Some(connecting) = conn else {
                        return Err(TransportError::ReadFailed("quic endpoint closed".into()).into());
                    };
                    match connecting.await {
                        Ok(connection) => self.spawn_stream_acceptor(connection),
                        Err(e) => tracing::warn!(error = %e, "quic handshake failed"),
                    }
                }
            }
        }
    }

    fn spawn_stream_acceptor(&self, connection: Connection) {
        let tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            let peer = format!("{} (quic)", connection.remote_address());
            while let Ok((send, recv)) = connection.accept_bi().await {
                let io = link_io_from_bi(send, recv, peer.clone());
                if tx.send(io).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_generation() {
        let (certs, _key) = load_or_generate_cert(None, None).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(!certs[0].is_empty());
    }

    #[test]
    fn test_missing_key_pem_errors() {
        assert!(rustls_pemfile_key(b"not a pem").is_err());
    }
}
