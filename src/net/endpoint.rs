use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::SystemTime,
};

use quinn::Connecting;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tracing::{debug, debug_span, Instrument};

use super::link::Link;
use crate::{config::TransportSettings, Error, Result};

/// Name baked into every self-signed certificate and presented as SNI.
const SERVER_NAME: &str = "lifenet";

/// A rendezvous point: a QUIC endpoint that can both accept links and dial
/// out. Every process owns one; the address it advertises is its contact.
///
/// Can be cloned to obtain another handle to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    ep: quinn::Endpoint,
    contact: SocketAddr,
}

impl Endpoint {
    /// Binds a QUIC endpoint with a fresh self-signed certificate. When bound
    /// to an unspecified address, `advertise` (or loopback) replaces the IP in
    /// the contact address handed to peers.
    pub fn bind(
        addr: SocketAddr,
        advertise: Option<IpAddr>,
        settings: &TransportSettings,
    ) -> Result<Self> {
        let (client_tls, server_tls) = Self::tls_config()?;

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(settings.keep_alive_interval));
        let transport_config = Arc::new(transport_config);

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        let mut ep = quinn::Endpoint::server(server_config, addr)?;
        ep.set_default_client_config(client_config);

        let local = ep.local_addr()?;
        let ip = match advertise {
            Some(ip) => ip,
            None if local.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => local.ip(),
        };
        let contact = SocketAddr::new(ip, local.port());
        debug!(%local, %contact, "endpoint bound");
        Ok(Self { ep, contact })
    }

    /// The address peers should dial to reach this endpoint.
    pub fn contact(&self) -> SocketAddr {
        self.contact
    }

    /// Dials `remote` and opens the link's stream. Nothing reaches the peer
    /// until the caller writes its hello.
    pub async fn connect(&self, remote: SocketAddr) -> Result<Link> {
        let span = debug_span!("link", %remote);
        async move {
            debug!("connecting");
            let conn = self.ep.connect(remote, SERVER_NAME)?.await?;
            let (send, recv) = conn.open_bi().await?;
            debug!("link open");
            Ok(Link::quic(conn, send, recv))
        }
        .instrument(span)
        .await
    }

    /// Waits for the next incoming connection.
    pub async fn incoming(&self) -> Result<Connecting> {
        self.ep.accept().await.ok_or(Error::EndpointClosed)
    }

    /// Completes an incoming connection and waits for the peer to open its
    /// stream.
    pub async fn establish(in_progress: Connecting) -> Result<Link> {
        let remote = in_progress.remote_address();
        let span = debug_span!("link", %remote);
        async move {
            let conn = in_progress.await?;
            debug!("connection accepted, waiting for stream");
            let (send, recv) = conn.accept_bi().await?;
            Ok(Link::quic(conn, send, recv))
        }
        .instrument(span)
        .await
    }

    pub async fn accept(&self) -> Result<Link> {
        Self::establish(self.incoming().await?).await
    }

    /// Closes every connection and waits for the close to reach peers.
    pub async fn shutdown(&self) {
        self.ep.close(0u32.into(), b"done");
        self.ep.wait_idle().await;
    }

    /// Returns rustls configurations around a throw-away self-signed
    /// certificate. Peers are not authenticated, so the client side accepts
    /// whatever certificate the server presents.
    fn tls_config() -> Result<(rustls::ClientConfig, rustls::ServerConfig)> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
        let key = PrivateKey(cert.serialize_private_key_der());
        let cert = Certificate(cert.serialize_der()?);

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServer))
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;

        Ok((client_config, server_config))
    }
}

struct AcceptAnyServer;

impl ServerCertVerifier for AcceptAnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
