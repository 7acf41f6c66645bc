//! TCP/TLS transport with incremental packet framing
//!
//! The transport hides the byte stream behind a packet interface. Incoming
//! bytes are reassembled into whole packets using the declared length at the
//! start of the header, which is 16 bits until large-SDU is negotiated and
//! 32 bits afterwards. Outgoing writes are counted so long bursts yield the
//! scheduler periodically.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::config::TransportSettings;
use crate::descriptor;
use crate::error::{Error, Result};
use crate::navigator::ConnectOption;
use crate::packet::{get_u16, get_u32, Packet, NSPSIZHD};

const DEFAULT_PORT: u16 = 1521;
const DEFAULT_HTTPS_PROXY_PORT: u16 = 80;
/// Writes between forced pauses, to avoid starving other tasks
const WRITE_PAUSE_THRESHOLD: u32 = 100;
/// SNI values longer than this are dropped rather than truncated
const MAX_SNI_LEN: usize = 255;

/// How to tear the transport down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// flush and half-close
    Graceful,
    /// drop the socket on the floor
    Immediate,
}

/// Reassembles whole packets from arbitrary chunk boundaries
#[derive(Debug)]
pub(crate) struct PacketFramer {
    buf: BytesMut,
    large_sdu: bool,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            large_sdu: false,
        }
    }

    pub fn set_large_sdu(&mut self, large: bool) {
        self.large_sdu = large;
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pop the next whole packet, or None until enough bytes arrive
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < NSPSIZHD {
            return Ok(None);
        }
        let declared = if self.large_sdu {
            get_u32(&self.buf, 0)? as usize
        } else {
            usize::from(get_u16(&self.buf, 0)?)
        };
        if declared < NSPSIZHD {
            return Err(Error::ProtocolViolation("bad packet length"));
        }
        if self.buf.len() < declared {
            return Ok(None);
        }
        let frame = self.buf.split_to(declared).freeze();
        Packet::parse(frame).map(Some)
    }
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(buf).await,
            Self::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush().await,
            Self::Tls(s) => s.flush().await,
        }
    }

    async fn read_chunk(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read_buf(buf).await,
            Self::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown().await,
            Self::Tls(s) => s.shutdown().await,
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(s) => s.peer_addr(),
            Self::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// One established socket, framed into packets
pub struct Transport {
    stream: Option<Stream>,
    framer: PacketFramer,
    pending: VecDeque<Packet>,
    writes_since_pause: u32,
    host: String,
    port: u16,
    tls: Option<TlsContext>,
}

impl Transport {
    /// Establish the raw socket, tunneling through an HTTPS proxy when one
    /// is configured, then layer TLS for tcps
    pub async fn connect(option: &ConnectOption, settings: &TransportSettings) -> Result<Self> {
        let host = option.hostname.clone();
        let port = if option.port == 0 {
            DEFAULT_PORT
        } else {
            option.port
        };
        let proxy = option
            .https_proxy
            .clone()
            .or_else(|| settings.https_proxy.clone());

        let tcp = if let Some(proxy_host) = proxy {
            let proxy_port = option
                .https_proxy_port
                .or(settings.https_proxy_port)
                .unwrap_or(DEFAULT_HTTPS_PROXY_PORT);
            proxy_connect(&proxy_host, proxy_port, &host, port).await?
        } else {
            direct_connect(option, &host, port).await?
        };

        if settings.expire_time.is_some() || settings.enable_dcd {
            let mut keepalive = TcpKeepalive::new();
            if let Some(interval) = settings.expire_time {
                keepalive = keepalive.with_time(interval);
            }
            SockRef::from(&tcp)
                .set_tcp_keepalive(&keepalive)
                .map_err(|source| Error::TransportConnectFailed {
                    host: host.clone(),
                    port,
                    source,
                })?;
        }
        if settings.tcp_no_delay {
            let _ = tcp.set_nodelay(true);
        }

        let mut transport = Self {
            stream: Some(Stream::Tcp(tcp)),
            framer: PacketFramer::new(),
            pending: VecDeque::new(),
            writes_since_pause: 0,
            host,
            port,
            tls: None,
        };
        if option.protocol.eq_ignore_ascii_case("tcps") {
            let ctx = build_tls_context(option, settings)?;
            transport.upgrade_tls(ctx).await?;
        }
        debug!(host = %transport.host, port = transport.port, "transport connected");
        Ok(transport)
    }

    async fn upgrade_tls(&mut self, ctx: TlsContext) -> Result<()> {
        let tcp = match self.stream.take() {
            Some(Stream::Tcp(tcp)) => tcp,
            Some(Stream::Tls(tls)) => tls.into_inner().0,
            None => {
                return Err(Error::ConnectionClosed {
                    reason: "transport is gone".into(),
                })
            }
        };
        let tls = ctx
            .connector
            .connect(ctx.server_name.clone(), tcp)
            .await
            .map_err(|err| Error::TlsHandshakeFailed {
                host: self.host.clone(),
                reason: err.to_string(),
            })?;
        self.stream = Some(Stream::Tls(Box::new(tls)));
        self.tls = Some(ctx);
        Ok(())
    }

    /// Re-run the TLS handshake over the already-established socket.
    /// The server requests this with the renegotiate flag on a Resend.
    pub async fn renegotiate_tls(&mut self) -> Result<()> {
        let ctx = self
            .tls
            .take()
            .ok_or(Error::ProtocolViolation("renegotiation on insecure transport"))?;
        self.upgrade_tls(ctx).await
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.peer_addr().ok()
    }

    /// Length prefix width changes once large-SDU is negotiated
    pub fn set_large_sdu(&mut self, large: bool) {
        self.framer.set_large_sdu(large);
    }

    pub async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        stream.write_all(buf).await.map_err(|err| {
            Error::ConnectionClosed {
                reason: err.to_string(),
            }
        })?;
        self.writes_since_pause += 1;
        trace!(len = buf.len(), "packet sent");
        Ok(())
    }

    /// Whether the caller should pause before the next write
    pub fn should_pause_write(&self) -> bool {
        self.writes_since_pause >= WRITE_PAUSE_THRESHOLD
    }

    /// Flush outstanding writes and yield so other tasks can run
    pub async fn pause_write(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        stream.flush().await.map_err(|err| Error::ConnectionClosed {
            reason: err.to_string(),
        })?;
        tokio::task::yield_now().await;
        self.writes_since_pause = 0;
        Ok(())
    }

    /// Whether a packet can be popped without touching the socket
    pub fn has_pending(&mut self) -> Result<bool> {
        while let Some(packet) = self.framer.next_packet()? {
            self.pending.push_back(packet);
        }
        Ok(!self.pending.is_empty())
    }

    /// Next whole packet, reading from the socket as needed
    pub async fn receive(&mut self) -> Result<Packet> {
        loop {
            while let Some(packet) = self.framer.next_packet()? {
                self.pending.push_back(packet);
            }
            if let Some(packet) = self.pending.pop_front() {
                trace!(ty = ?packet.ty, len = packet.buf.len(), "packet received");
                return Ok(packet);
            }
            let stream = self.stream.as_mut().ok_or_else(closed)?;
            let n = stream
                .read_chunk(self.framer.buf_mut())
                .await
                .map_err(|err| Error::ConnectionClosed {
                    reason: err.to_string(),
                })?;
            if n == 0 {
                return Err(Error::ConnectionClosed {
                    reason: "end of file on transport".into(),
                });
            }
        }
    }

    /// Put a packet back at the head of the receive queue
    pub fn requeue(&mut self, packet: Packet) {
        self.pending.push_front(packet);
    }

    /// Pop an already-framed packet without touching the socket
    pub fn receive_queued(&mut self) -> Option<Packet> {
        self.pending.pop_front()
    }

    pub async fn disconnect(&mut self, mode: DisconnectMode) {
        if let Some(mut stream) = self.stream.take() {
            if mode == DisconnectMode::Graceful {
                let _ = stream.shutdown().await;
            }
        }
        self.tls = None;
        self.pending.clear();
        debug!(host = %self.host, port = self.port, ?mode, "transport disconnected");
    }
}

fn closed() -> Error {
    Error::ConnectionClosed {
        reason: "transport is gone".into(),
    }
}

async fn direct_connect(option: &ConnectOption, host: &str, port: u16) -> Result<TcpStream> {
    let attempt = if let Some(ip) = option.ip {
        TcpStream::connect((ip, port)).await
    } else {
        TcpStream::connect((host, port)).await
    };
    attempt.map_err(|source| Error::TransportConnectFailed {
        host: host.to_string(),
        port,
        source,
    })
}

/// Open an HTTP CONNECT tunnel through the proxy
async fn proxy_connect(
    proxy_host: &str,
    proxy_port: u16,
    host: &str,
    port: u16,
) -> Result<TcpStream> {
    let fail = |source: io::Error| Error::TransportConnectFailed {
        host: proxy_host.to_string(),
        port: proxy_port,
        source,
    };
    let mut tcp = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(fail)?;
    let request = format!("CONNECT {host}:{port} HTTP/1.0\r\n\r\n");
    tcp.write_all(request.as_bytes()).await.map_err(fail)?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") && response.len() < 2048 {
        let n = tcp.read(&mut byte).await.map_err(fail)?;
        if n == 0 {
            break;
        }
        response.push(byte[0]);
    }
    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !ok {
        return Err(fail(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy replied \"{status_line}\""),
        )));
    }
    Ok(tcp)
}

fn build_tls_context(option: &ConnectOption, settings: &TransportSettings) -> Result<TlsContext> {
    let tls_err = |reason: String| Error::TlsHandshakeFailed {
        host: option.hostname.clone(),
        reason,
    };

    let mut roots = RootCertStore::empty();
    #[cfg(feature = "platform-verifier")]
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut client_certs: Vec<CertificateDer<'static>> = Vec::new();
    let mut client_key: Option<PrivateKeyDer<'static>> = None;
    if let Some(pem) = settings.wallet.as_deref() {
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            let cert = cert.map_err(|err| tls_err(format!("bad wallet certificate: {err}")))?;
            // the wallet doubles as trust anchor and client identity
            let _ = roots.add(cert.clone());
            client_certs.push(cert);
        }
        client_key = rustls_pemfile::private_key(&mut pem.as_bytes())
            .map_err(|err| tls_err(format!("bad wallet key: {err}")))?;
    }
    if roots.is_empty() {
        return Err(tls_err("no trusted certificates available".into()));
    }

    let inner = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| tls_err(err.to_string()))?;

    let sni = if settings.use_sni {
        derive_sni(&option.connect_data())
    } else {
        None
    };
    let handshake_name = sni.as_deref().unwrap_or(option.hostname.as_str());
    let server_name = ServerName::try_from(handshake_name.to_string())
        .map_err(|_| tls_err(format!("invalid server name \"{handshake_name}\"")))?;

    // the certificate must still match the endpoint host when a service
    // name rides in the SNI slot
    let mut alt_names = Vec::new();
    if sni.is_some() {
        if let Ok(name) = ServerName::try_from(option.hostname.clone()) {
            alt_names.push(name);
        }
    }
    if let Some(origin) = settings.origin_host.as_deref() {
        if origin != option.hostname {
            if let Ok(name) = ServerName::try_from(origin.to_string()) {
                alt_names.push(name);
            }
        }
    }

    let weak_cn = if settings.ssl_allow_weak_dn_match {
        service_name_of(&option.connect_data())
    } else {
        None
    };
    let verifier = Arc::new(TnsServerVerifier {
        inner,
        dn_match: settings.ssl_server_dn_match,
        cert_dn: settings.ssl_server_cert_dn.clone(),
        alt_names,
        weak_cn,
    });

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    let config = match client_key {
        Some(key) if !client_certs.is_empty() => builder
            .with_client_auth_cert(client_certs, key)
            .map_err(|err| tls_err(err.to_string()))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsContext {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

/// Names that may appear in connect-data without suppressing SNI
const SNI_SAFE_PARAMS: &[&str] = &["SERVICE_NAME", "SID", "SERVER", "INSTANCE_NAME", "CONNECTION_ID"];

/// Server name carried in the TLS hello, derived from connect-data.
/// Suppressed when any unexpected field is present, when the value uses
/// characters outside `[A-Za-z0-9._-]`, or when it exceeds the length cap.
fn derive_sni(connect_data: &str) -> Option<String> {
    let root = descriptor::parse(&format!("(CONNECT_DATA={connect_data})")).ok()?;
    let mut value: Option<String> = None;
    for child in root.children() {
        let name = child.name.to_ascii_uppercase();
        if !SNI_SAFE_PARAMS.contains(&name.as_str()) {
            return None;
        }
        let is_candidate = name == "SERVICE_NAME" || (name == "SID" && value.is_none());
        if is_candidate {
            value = child.atom().map(str::to_string);
        }
    }
    let value = value?;
    let valid = !value.is_empty()
        && value.len() <= MAX_SNI_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    valid.then_some(value)
}

fn service_name_of(connect_data: &str) -> Option<String> {
    let root = descriptor::parse(&format!("(CONNECT_DATA={connect_data})")).ok()?;
    root.find("SERVICE_NAME")
        .and_then(|p| p.atom())
        .map(str::to_string)
}

/// Identity checks layered over standard chain verification.
///
/// Chain validity is always required. The name check depends on settings:
/// a configured certificate DN replaces the hostname match entirely, and
/// with DN matching disabled a name mismatch is tolerated. The weak
/// fallback accepts the service name standing in for the CN.
#[derive(Debug)]
struct TnsServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    dn_match: bool,
    cert_dn: Option<String>,
    alt_names: Vec<ServerName<'static>>,
    weak_cn: Option<String>,
}

impl TnsServerVerifier {
    fn check_cert_dn(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let Some(expected) = self.cert_dn.as_deref() else {
            return Ok(());
        };
        let subject = cert_subject(end_entity)?;
        let subject_pairs = parse_dn(&subject);
        for (key, value) in parse_dn(expected) {
            let found = subject_pairs
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(&key) && *v == value);
            if !found {
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(())
    }

    fn weak_cn_matches(&self, end_entity: &CertificateDer<'_>) -> bool {
        let Some(service) = self.weak_cn.as_deref() else {
            return false;
        };
        let Ok(subject) = cert_subject(end_entity) else {
            return false;
        };
        parse_dn(&subject)
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("CN") && v.eq_ignore_ascii_case(service))
    }
}

impl ServerCertVerifier for TnsServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => {
                self.check_cert_dn(end_entity)?;
                Ok(verified)
            }
            Err(rustls::Error::InvalidCertificate(cert_err)) if is_name_mismatch(&cert_err) => {
                if !self.dn_match {
                    return Ok(ServerCertVerified::assertion());
                }
                if self.cert_dn.is_some() {
                    // the configured DN replaces the hostname check
                    self.check_cert_dn(end_entity)?;
                    return Ok(ServerCertVerified::assertion());
                }
                for alt in &self.alt_names {
                    if self
                        .inner
                        .verify_server_cert(end_entity, intermediates, alt, ocsp_response, now)
                        .is_ok()
                    {
                        return Ok(ServerCertVerified::assertion());
                    }
                }
                if self.weak_cn_matches(end_entity) {
                    return Ok(ServerCertVerified::assertion());
                }
                Err(rustls::Error::InvalidCertificate(cert_err))
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

fn cert_subject(end_entity: &CertificateDer<'_>) -> std::result::Result<String, rustls::Error> {
    use x509_parser::prelude::FromDer;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(end_entity.as_ref())
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
    Ok(cert.subject().to_string())
}

/// Split "CN=db, O=org" into trimmed key/value pairs
fn parse_dn(dn: &str) -> Vec<(String, String)> {
    dn.split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn frame(ty: u8, payload: &[u8]) -> Vec<u8> {
        let len = (NSPSIZHD + payload.len()) as u16;
        let mut buf = vec![0u8; NSPSIZHD];
        buf[0..2].copy_from_slice(&len.to_be_bytes());
        buf[4] = ty;
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn framer_reassembles_across_chunk_splits() {
        let bytes = frame(11, &[]);
        let mut framer = PacketFramer::new();
        framer.extend(&bytes[..3]);
        assert!(framer.next_packet().unwrap().is_none());
        framer.extend(&bytes[3..7]);
        assert!(framer.next_packet().unwrap().is_none());
        framer.extend(&bytes[7..]);
        let packet = framer.next_packet().unwrap().unwrap();
        assert_eq!(packet.ty, PacketType::Resend);
    }

    #[test]
    fn framer_splits_coalesced_packets() {
        let mut bytes = frame(12, &[1, 2]);
        bytes.extend_from_slice(&frame(14, &[0, 0, 49, 28, 0, 0]));
        let mut framer = PacketFramer::new();
        framer.extend(&bytes);
        assert_eq!(
            framer.next_packet().unwrap().unwrap().ty,
            PacketType::Marker
        );
        assert_eq!(
            framer.next_packet().unwrap().unwrap().ty,
            PacketType::Control
        );
        assert!(framer.next_packet().unwrap().is_none());
    }

    #[test]
    fn framer_uses_wide_length_after_large_sdu() {
        let payload = vec![0u8; 4];
        let len = (NSPSIZHD + payload.len()) as u32;
        let mut buf = len.to_be_bytes().to_vec();
        buf.extend_from_slice(&[6, 0, 0, 0]);
        buf.extend_from_slice(&payload);
        let mut framer = PacketFramer::new();
        framer.set_large_sdu(true);
        framer.extend(&buf);
        assert_eq!(framer.next_packet().unwrap().unwrap().ty, PacketType::Data);
    }

    #[test]
    fn framer_rejects_undersized_length() {
        let mut framer = PacketFramer::new();
        framer.extend(&[0, 3, 0, 0, 6, 0, 0, 0]);
        assert!(framer.next_packet().is_err());
    }

    #[test]
    fn sni_from_service_name() {
        assert_eq!(
            derive_sni("(SERVICE_NAME=orclpdb1)(SERVER=dedicated)").as_deref(),
            Some("orclpdb1")
        );
        assert_eq!(derive_sni("(SID=xe)").as_deref(), Some("xe"));
    }

    #[test]
    fn sni_suppressed_by_unexpected_field() {
        assert!(derive_sni("(SERVICE_NAME=orclpdb1)(POOL_PURITY=SELF)").is_none());
    }

    #[test]
    fn sni_suppressed_by_charset_and_length() {
        assert!(derive_sni("(SERVICE_NAME=bad name)").is_none());
        let long = format!("(SERVICE_NAME={})", "a".repeat(MAX_SNI_LEN + 1));
        assert!(derive_sni(&long).is_none());
    }

    #[test]
    fn dn_parsing_trims_components() {
        let pairs = parse_dn("CN=db.example.com, O=Example, C=US");
        assert_eq!(pairs[0], ("CN".into(), "db.example.com".into()));
        assert_eq!(pairs[2], ("C".into(), "US".into()));
    }
}
