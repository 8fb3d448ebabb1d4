use anyhow::Context;
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rcgen::generate_simple_self_signed;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::channel::{serve_stream, Responder};
use crate::error::{ExchangeError, ProbeError};
use crate::peer::{PeerAddress, PeerId};
use crate::protocol::PROTOCOL_ID;
use crate::state::lock;

pub type SendHalf = Box<dyn AsyncWrite + Send + Unpin>;
pub type RecvHalf = Box<dyn AsyncRead + Send + Unpin>;

/// An established link to one peer that can carry many request streams.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_stream(&self) -> io::Result<(SendHalf, RecvHalf)>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, ExchangeError>;

    /// Protocol identifiers the peer advertises.
    async fn advertised_protocols(&self, peer: &PeerId) -> Result<Vec<String>, ProbeError>;
}

/// Protocols each peer announced, as learned from discovery.
#[derive(Default)]
pub struct ProtocolBook {
    protocols: Mutex<HashMap<PeerId, Vec<String>>>,
}

impl ProtocolBook {
    pub fn record(&self, id: &PeerId, protocols: Vec<String>) {
        lock(&self.protocols).insert(id.clone(), protocols);
    }

    pub fn get(&self, id: &PeerId) -> Option<Vec<String>> {
        lock(&self.protocols).get(id).cloned()
    }
}

const SERVER_NAME: &str = "datapeer-local";

#[derive(Clone)]
pub struct QuicTransport {
    endpoint: Endpoint,
    protocols: Arc<ProtocolBook>,
}

impl QuicTransport {
    /// Binds a QUIC endpoint on `0.0.0.0:port` (0 picks a free port).
    pub fn new(port: u16) -> anyhow::Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let (cert_der, key_der) = generate_self_signed_cert()?;
        let server_config = configure_server(cert_der, key_der)?;
        let client_config = configure_client()?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut endpoint =
            Endpoint::server(server_config, addr).context("failed to bind QUIC endpoint")?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            protocols: Arc::new(ProtocolBook::default()),
        })
    }

    pub fn protocols(&self) -> &Arc<ProtocolBook> {
        &self.protocols
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accepts connections and answers every inbound stream with `responder`.
    pub fn start_listening(&self, responder: Arc<dyn Responder>) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let responder = responder.clone();
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "inbound connection failed");
                            return;
                        }
                    };
                    let remote = conn.remote_address();
                    loop {
                        match conn.accept_bi().await {
                            Ok((send, recv)) => {
                                let responder = responder.clone();
                                tokio::spawn(async move {
                                    serve_stream(send, recv, responder.as_ref()).await;
                                });
                            }
                            Err(e) => {
                                tracing::debug!(%remote, reason = %e, "connection closed");
                                break;
                            }
                        }
                    }
                });
            }
        })
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, ExchangeError> {
        let mut reason = String::from("no known addresses");
        for addr in &peer.addrs {
            let connecting = match self.endpoint.connect(*addr, SERVER_NAME) {
                Ok(connecting) => connecting,
                Err(e) => {
                    reason = e.to_string();
                    continue;
                }
            };
            match connecting.await {
                Ok(conn) => return Ok(Arc::new(QuicConnection(conn))),
                Err(e) => {
                    tracing::debug!(peer = %peer.id, %addr, error = %e, "dial attempt failed");
                    reason = e.to_string();
                }
            }
        }
        Err(ExchangeError::Connection {
            peer: peer.id.clone(),
            reason,
        })
    }

    async fn advertised_protocols(&self, peer: &PeerId) -> Result<Vec<String>, ProbeError> {
        self.protocols
            .get(peer)
            .ok_or_else(|| ProbeError::UnknownPeer(peer.clone()))
    }
}

struct QuicConnection(quinn::Connection);

#[async_trait]
impl Connection for QuicConnection {
    async fn open_stream(&self) -> io::Result<(SendHalf, RecvHalf)> {
        let (send, recv) = self.0.open_bi().await.map_err(io::Error::other)?;
        Ok((Box::new(send), Box::new(recv)))
    }

    fn is_closed(&self) -> bool {
        self.0.close_reason().is_some()
    }
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let cert = generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    Ok((cert.cert.der().to_vec(), cert.signing_key.serialize_der()))
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> anyhow::Result<ServerConfig> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|e| anyhow::anyhow!("invalid private key: {}", e))?;

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    crypto.alpn_protocols = vec![PROTOCOL_ID.as_bytes().to_vec()];

    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)?;
    Ok(ServerConfig::with_crypto(Arc::new(quic)))
}

fn configure_client() -> anyhow::Result<ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    // Peers use throwaway self-signed certificates; identity comes from discovery.
    #[derive(Debug)]
    struct SkipServerVerification;
    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![PROTOCOL_ID.as_bytes().to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?;
    Ok(ClientConfig::new(Arc::new(quic)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_book_replaces_entries() {
        let book = ProtocolBook::default();
        let id = PeerId::from("A1");
        assert!(book.get(&id).is_none());

        book.record(&id, vec!["/other/1.0".into()]);
        book.record(&id, vec![PROTOCOL_ID.into()]);
        assert_eq!(book.get(&id), Some(vec![PROTOCOL_ID.to_string()]));
    }
}
