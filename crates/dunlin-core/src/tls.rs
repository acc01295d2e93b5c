//! TLS setup for encrypted peer and hub connections
//!
//! Direct Connect peers use anonymous TLS: both sides present throwaway
//! self-signed certificates and neither verifies the other, the handshake
//! only provides transport encryption. The listening side generates its
//! identity once per client instance.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::conn::NetStream;
use crate::error::{DcError, Result};

/// Self-signed identity for the TLS listener plus the ready-made
/// acceptor/connector pair.
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    pub fn new() -> Result<Self> {
        let key = rcgen::generate_simple_self_signed(vec!["dunlin".to_string()])
            .map_err(|e| DcError::TlsHandshake(format!("certificate generation: {}", e)))?;
        let cert_der = CertificateDer::from(key.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.key_pair.serialize_der(),
        ));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| DcError::TlsHandshake(format!("server config: {}", e)))?;

        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();

        Ok(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }

    /// Server side of the handshake, for inbound peers on the TLS port.
    pub async fn accept(&self, stream: TcpStream) -> Result<NetStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| DcError::TlsHandshake(e.to_string()))?;
        Ok(NetStream::Tls(Box::new(TlsStream::Server(tls))))
    }

    /// Client side of the handshake, for outbound dials.
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<NetStream> {
        let name = ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("dunlin").expect("static name"));
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| DcError::TlsHandshake(e.to_string()))?;
        Ok(NetStream::Tls(Box::new(TlsStream::Client(tls))))
    }
}

/// Verifier that accepts every peer certificate.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::FramedConn;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn anonymous_handshake_and_echo() {
        let ctx_server = TlsContext::new().unwrap();
        let ctx_client = TlsContext::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let stream = ctx_server.accept(tcp).await.unwrap();
            let mut conn = FramedConn::new(stream, b'|');
            let line = conn.read_frame().await.unwrap();
            conn.write_frame(&line).await.unwrap();
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let stream = ctx_client.connect("127.0.0.1", tcp).await.unwrap();
        assert!(stream.is_tls());
        let mut conn = FramedConn::new(stream, b'|');
        conn.write_frame(b"over tls").await.unwrap();
        assert_eq!(conn.read_frame().await.unwrap(), b"over tls");
        server.await.unwrap();
    }
}
