//! Network session: connect-string resolution, the connect handshake, and
//! the post-accept packet interface
//!
//! A session owns one transport at a time. `connect` resolves the connect
//! string, navigates the descriptor into candidate endpoints, and walks
//! them under the retry strategy until a server accepts. The handshake
//! handles Refuse, Resend, and Redirect packets along the way. Once
//! accepted, payload moves through reusable Data packets, break and reset
//! travel as Marker packets, and Control packets are consumed in-band.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ConnectConfig, SessionAttributes};
use crate::descriptor::{self, NvPair};
use crate::down_hosts::DownHostsCache;
use crate::error::{Error, RefuseReason, Result, TimeoutKind};
use crate::ezconnect;
use crate::navigator::{self, ConnectOption};
use crate::negotiation::Negotiator;
use crate::packet::{
    AcceptPacket, ConnectPacket, ControlNotification, DataPacket, MarkerEvent, MarkerPacket,
    Packet, PacketType, RedirectPacket, RefusePacket, NIQBMARK, NIQIMARK, NIQRMARK, NSINAWANTED,
    NSPABSSDULN, NSPDAFEOF, NSPFRDR, NSPFRDS, NSPFSRN, NSPMNSDULN,
};
use crate::strategy::{Candidate, ConnectionStrategy};
use crate::transport::{DisconnectMode, Transport};

/// Supplies descriptor text for a bare alias. Reading and caching the
/// alias file is the implementor's concern.
pub trait AliasSource {
    fn lookup(&self, alias: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    TransportConnecting,
    HandshakePending,
    Connected,
    Disconnecting,
}

/// Resolve user-supplied connect text into long-form descriptor text.
/// Descriptors pass through, URLs go through easy-connect translation,
/// and anything else is treated as an alias.
pub(crate) async fn resolve_connect_string(
    text: &str,
    alias_source: Option<&dyn AliasSource>,
) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('(') && trimmed.contains(')') {
        return Ok(trimmed.to_string());
    }
    if trimmed.contains(':') || trimmed.contains('/') {
        return ezconnect::translate(trimmed).await;
    }
    alias_source
        .and_then(|source| source.lookup(trimmed))
        .ok_or_else(|| Error::InvalidConnectString(format!("unknown alias \"{trimmed}\"")))
}

async fn with_timeout<T, F>(
    limit: Option<Duration>,
    kind: TimeoutKind,
    host: &str,
    port: u16,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(Error::OperationTimedOut {
                kind,
                millis: limit.as_millis() as u64,
                host: host.to_string(),
                port,
            })
        }),
        None => fut.await,
    }
}

pub struct NetworkSession {
    state: SessionState,
    attrs: SessionAttributes,
    transport: Option<Transport>,
    snd_data: DataPacket,
    rcv_data: DataPacket,
    marker: MarkerPacket,
    down_hosts: Arc<DownHostsCache>,
    /// descriptor actually sent, for attribute queries
    descriptor: Option<NvPair>,
    is_break: bool,
    is_reset: bool,
    break_posted: bool,
    pending_control: Option<ControlNotification>,
    auth_activated: bool,
}

impl NetworkSession {
    pub fn new(down_hosts: Arc<DownHostsCache>) -> Self {
        Self {
            state: SessionState::Disconnected,
            attrs: SessionAttributes::default(),
            transport: None,
            snd_data: DataPacket::new(false),
            rcv_data: DataPacket::new(false),
            marker: MarkerPacket::new(false),
            down_hosts,
            descriptor: None,
            is_break: false,
            is_reset: false,
            break_posted: false,
            pending_control: None,
            auth_activated: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_healthy(&self) -> bool {
        self.is_connected() && self.transport.is_some()
    }

    pub fn session_attributes(&self) -> &SessionAttributes {
        &self.attrs
    }

    /// Server accepted certificate-based external authentication
    pub fn auth_activated(&self) -> bool {
        self.auth_activated
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.transport.as_ref()?.remote_address()
    }

    fn descriptor_value(&self, path: &[&str]) -> Option<String> {
        self.descriptor.as_ref()?.find_value(path)
    }

    pub fn service_name(&self) -> Option<String> {
        self.descriptor_value(&["DESCRIPTION", "CONNECT_DATA", "SERVICE_NAME"])
    }

    pub fn sid(&self) -> Option<String> {
        self.descriptor_value(&["DESCRIPTION", "CONNECT_DATA", "SID"])
    }

    pub fn server_type(&self) -> Option<String> {
        self.descriptor_value(&["DESCRIPTION", "CONNECT_DATA", "SERVER"])
    }

    pub fn connection_class(&self) -> Option<String> {
        self.descriptor_value(&["DESCRIPTION", "CONNECT_DATA", "POOL_CONNECTION_CLASS"])
    }

    pub fn purity(&self) -> Option<String> {
        self.descriptor_value(&["DESCRIPTION", "CONNECT_DATA", "POOL_PURITY"])
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed {
            reason: "transport is gone".into(),
        })
    }

    /// Resolve, navigate, and try candidates until one accepts.
    /// The last failure is surfaced when every candidate is exhausted.
    pub async fn connect(
        &mut self,
        config: &ConnectConfig,
        alias_source: Option<&dyn AliasSource>,
    ) -> Result<()> {
        let resolved = resolve_connect_string(&config.connect_string, alias_source).await?;
        let root = descriptor::parse(&resolved)?;
        let descriptions = {
            let mut rng = rand::rng();
            navigator::navigate(&root, &mut rng).await?
        };
        let mut strategy = ConnectionStrategy::new(
            descriptions,
            Arc::clone(&self.down_hosts),
            config.retry_count,
            config.retry_delay,
        );

        let mut saved_err: Option<Error> = None;
        loop {
            let candidate = match strategy.next().await {
                Ok(candidate) => candidate,
                Err(exhausted) => {
                    self.state = SessionState::Disconnected;
                    return Err(saved_err.unwrap_or(exhausted));
                }
            };
            let connect_data = match self.prepare_candidate(&candidate, config) {
                Ok(text) => text,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    saved_err = Some(err);
                    continue;
                }
            };

            let connect_timeout = self.attrs.connect_timeout;
            let host = candidate.option.hostname.clone();
            let port = candidate.option.port;
            let attempt = with_timeout(
                connect_timeout,
                TimeoutKind::Connect,
                &host,
                port,
                self.establish(&candidate, &connect_data),
            )
            .await;

            match attempt {
                Ok(()) => {
                    self.finish_connect();
                    return Ok(());
                }
                Err(err) => {
                    if matches!(
                        err,
                        Error::TransportConnectFailed { .. } | Error::OperationTimedOut { .. }
                    ) {
                        strategy.mark_down(&host);
                    }
                    if let Some(transport) = self.transport.as_mut() {
                        transport.disconnect(DisconnectMode::Immediate).await;
                    }
                    self.transport = None;
                    self.state = SessionState::Disconnected;
                    if err.is_fatal() {
                        return Err(err);
                    }
                    warn!(host = %host, port, error = %err, "connection attempt failed");
                    saved_err = Some(err);
                }
            }
        }
    }

    /// Rebuild session attributes for one candidate, preserving the random
    /// identity, and stamp the connection id into its connect-data
    fn prepare_candidate(&mut self, candidate: &Candidate, config: &ConnectConfig) -> Result<String> {
        let uuid = self.attrs.uuid.take();
        self.attrs = SessionAttributes {
            uuid,
            ..SessionAttributes::default()
        };
        self.attrs.set_from_config(config);
        self.attrs.set_from_params(&candidate.params);
        self.attrs
            .prepare(&candidate.option.protocol, config.external_auth)?;

        let mut root = descriptor::parse(&candidate.option.connect_data())?;
        let connection_id = self.attrs.connection_id.clone().unwrap_or_default();
        descriptor::insert_connection_id(&mut root, &connection_id)?;
        let text = root.to_string();
        self.descriptor = Some(root);
        Ok(text)
    }

    /// Transport connect plus the Connect/Accept handshake for one endpoint
    async fn establish(&mut self, candidate: &Candidate, connect_data: &str) -> Result<()> {
        self.attrs.sdu = self.attrs.sdu.clamp(NSPMNSDULN, NSPABSSDULN);

        let mut option = candidate.option.clone();
        let mut cdata: Vec<u8> = connect_data.as_bytes().to_vec();
        self.transport_connect(&option).await?;
        let mut connect_pkt = ConnectPacket::build(&cdata, &self.attrs, 0);
        self.send_connect(&connect_pkt, &cdata).await?;

        loop {
            let packet = self.recv_handshake_packet().await?;
            match packet.ty {
                PacketType::Accept => {
                    AcceptPacket::parse(&packet, &mut self.attrs)?;
                    let large_sdu = self.attrs.large_sdu;
                    self.transport_mut()?.set_large_sdu(large_sdu);
                    if self.attrs.na_flags & NSINAWANTED != 0 && !self.attrs.no_na {
                        self.negotiate_security().await?;
                    }
                    return Ok(());
                }
                PacketType::Refuse => {
                    return Err(self.refused(&option, &packet).await?);
                }
                PacketType::Resend => {
                    if packet.flags & NSPFSRN != 0 {
                        self.transport_mut()?.renegotiate_tls().await?;
                    }
                    self.send_connect(&connect_pkt, &cdata).await?;
                }
                PacketType::Redirect => {
                    let (new_option, new_cdata) =
                        self.redirect(&option, &cdata, &packet).await?;
                    option = new_option;
                    cdata = new_cdata;
                    connect_pkt = ConnectPacket::build(&cdata, &self.attrs, NSPFRDR);
                    self.send_connect(&connect_pkt, &cdata).await?;
                }
                _ => {
                    return Err(Error::ProtocolViolation(
                        "unexpected packet during connect handshake",
                    ))
                }
            }
        }
    }

    async fn transport_connect(&mut self, option: &ConnectOption) -> Result<()> {
        let protocol = option.protocol.to_ascii_lowercase();
        if protocol == "tcp" && option.https_proxy.is_some() {
            return Err(Error::InvalidConnectString(
                "an https proxy requires the tcps protocol".into(),
            ));
        }
        if protocol != "tcp" && protocol != "tcps" {
            return Err(Error::InvalidConnectString(format!(
                "protocol \"{}\" is not supported",
                option.protocol
            )));
        }
        self.state = SessionState::TransportConnecting;
        let transport = with_timeout(
            self.attrs.transport_connect_timeout,
            TimeoutKind::TransportConnect,
            &option.hostname,
            option.port,
            Transport::connect(option, &self.attrs.nt),
        )
        .await?;
        self.transport = Some(transport);
        self.state = SessionState::HandshakePending;
        self.snd_data = DataPacket::new(self.attrs.large_sdu);
        self.rcv_data = DataPacket::new(self.attrs.large_sdu);
        Ok(())
    }

    /// Tear down, re-resolve the redirect target, merge its parameters,
    /// and reconnect. Returns the new endpoint and the connect-data to
    /// replay with the redirected flag.
    async fn redirect(
        &mut self,
        option: &ConnectOption,
        cdata: &[u8],
        packet: &Packet,
    ) -> Result<(ConnectOption, Vec<u8>)> {
        let redirect = RedirectPacket::parse(packet)?;
        let payload = if redirect.overflow {
            self.recv_overflow().await?
        } else {
            redirect.data.to_vec()
        };

        let (address_text, new_cdata) = if redirect.flags & NSPFRDS != 0 {
            let nul = payload
                .iter()
                .position(|&b| b == 0)
                .ok_or(Error::ProtocolViolation("redirect data missing separator"))?;
            (
                String::from_utf8_lossy(&payload[..nul]).into_owned(),
                payload[nul + 1..].to_vec(),
            )
        } else {
            (
                String::from_utf8_lossy(&payload).into_owned(),
                cdata.to_vec(),
            )
        };
        debug!(target = %address_text, "redirected");

        let resolved = resolve_connect_string(&address_text, None).await?;
        let root = descriptor::parse(&resolved)?;
        let descriptions = {
            let mut rng = rand::rng();
            navigator::navigate(&root, &mut rng).await?
        };
        let description = descriptions
            .into_iter()
            .find(|d| !d.options.is_empty())
            .ok_or(Error::MalformedDescriptor)?;
        self.attrs.set_from_params(&description.params);
        let new_option = description
            .options
            .into_iter()
            .next()
            .ok_or(Error::MalformedDescriptor)?;

        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect(DisconnectMode::Immediate).await;
        }
        self.transport = None;
        self.attrs.nt.origin_host = Some(option.hostname.clone());
        self.transport_connect(&new_option).await?;
        Ok((new_option, new_cdata))
    }

    async fn refused(&mut self, option: &ConnectOption, packet: &Packet) -> Result<Error> {
        let mut refuse = RefusePacket::parse(packet)?;
        if refuse.overflow {
            let payload = self.recv_overflow().await?;
            refuse.data = String::from_utf8_lossy(&payload).into_owned();
        }
        let code = descriptor::parse(&refuse.data)
            .ok()
            .and_then(|root| root.find_value(&["DESCRIPTION", "ERR"]));
        let reason = match code.as_deref() {
            Some("12514") => {
                RefuseReason::ServiceNotRegistered(self.service_name().unwrap_or_default())
            }
            Some("12505") => RefuseReason::SidNotRegistered(self.sid().unwrap_or_default()),
            Some(code) => code
                .parse::<u32>()
                .map(RefuseReason::Code)
                .unwrap_or(RefuseReason::Unknown),
            None => RefuseReason::Unknown,
        };
        Ok(Error::ProtocolRefused {
            host: option.hostname.clone(),
            port: option.port,
            reason,
        })
    }

    async fn send_connect(&mut self, pkt: &ConnectPacket, cdata: &[u8]) -> Result<()> {
        let buf = pkt.buf.clone();
        self.transport_mut()?.send(&buf).await?;
        if pkt.overflow {
            // connect-data that did not fit inline follows in a Data packet
            self.send(cdata).await?;
            self.flush().await?;
        }
        Ok(())
    }

    /// Run security negotiation over Data packets after the Accept
    async fn negotiate_security(&mut self) -> Result<()> {
        let uuid = self.attrs.uuid.clone().unwrap_or_default();
        let mut negotiator = Negotiator::new(&uuid);
        let request = negotiator.build_packet();

        let mut dp = DataPacket::new(self.attrs.large_sdu);
        dp.fill(&request, 0);
        let bytes = dp.as_bytes().to_vec();
        self.transport_mut()?.send(&bytes).await?;

        loop {
            let packet = self.recv_handshake_packet().await?;
            if packet.ty == PacketType::Data {
                negotiator.process_packet(&packet.buf)?;
                break;
            }
            return Err(Error::ProtocolViolation(
                "unexpected packet during security negotiation",
            ));
        }
        self.auth_activated = negotiator.auth_activated();
        Ok(())
    }

    fn finish_connect(&mut self) {
        self.state = SessionState::Connected;
        self.snd_data = DataPacket::new(self.attrs.large_sdu);
        self.snd_data.create(self.attrs.sdu as usize);
        self.rcv_data = DataPacket::new(self.attrs.large_sdu);
        self.marker = MarkerPacket::new(self.attrs.large_sdu);
        // TLS material is not needed once the handshake is done
        self.attrs.nt.wallet = None;
        debug!(
            version = self.attrs.version,
            sdu = self.attrs.sdu,
            large_sdu = self.attrs.large_sdu,
            "session connected"
        );
    }

    /// Receive one packet, consuming Control packets and folding Marker
    /// packets into the break/reset state
    async fn recv_packet(&mut self) -> Result<Packet> {
        loop {
            let packet = self.transport_mut()?.receive().await?;
            match packet.ty {
                PacketType::Control => {
                    let notification = ControlNotification::parse(&packet)?;
                    warn!(errno = notification.errno, "in-band notification");
                    self.pending_control = Some(notification);
                }
                PacketType::Marker => {
                    match MarkerPacket::parse(&packet)? {
                        MarkerEvent::Break => self.is_break = true,
                        MarkerEvent::Reset => self.is_reset = true,
                    }
                    return Ok(packet);
                }
                _ => return Ok(packet),
            }
        }
    }

    async fn recv_handshake_packet(&mut self) -> Result<Packet> {
        loop {
            let packet = self.recv_packet().await?;
            if packet.ty != PacketType::Marker {
                return Ok(packet);
            }
        }
    }

    /// Overflow continuation of a Refuse or Redirect packet
    async fn recv_overflow(&mut self) -> Result<Vec<u8>> {
        let packet = self.recv_packet().await?;
        if packet.ty != PacketType::Data {
            return Err(Error::ProtocolViolation("expected overflow data packet"));
        }
        self.rcv_data.from_packet(&packet)?;
        Ok(self.rcv_data.remaining().to_vec())
    }

    /// Buffer payload, sending full Data packets as the buffer fills.
    /// Suppressed while a break is in progress.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.is_break {
            return Ok(());
        }
        let mut src = data;
        loop {
            let taken = self.snd_data.fill(src, 0);
            src = &src[taken..];
            if src.is_empty() {
                return Ok(());
            }
            let bytes = self.snd_data.as_bytes().to_vec();
            let transport = self.transport_mut()?;
            transport.send(&bytes).await?;
            if transport.should_pause_write() {
                transport.pause_write().await?;
            }
            self.snd_data.reset();
            if self.is_break {
                return Ok(());
            }
        }
    }

    /// Send whatever is buffered, even a payload of zero bytes
    pub async fn flush(&mut self) -> Result<()> {
        if self.is_break {
            return Ok(());
        }
        self.snd_data.prepare_to_send(0);
        let bytes = self.snd_data.as_bytes().to_vec();
        self.transport_mut()?.send(&bytes).await?;
        self.transport_mut()?.pause_write().await?;
        self.snd_data.reset();
        Ok(())
    }

    /// Next Data packet payload, honoring the receive timeout
    pub async fn receive(&mut self) -> Result<u16> {
        let recv_timeout = self.attrs.recv_timeout;
        let host = self
            .remote_address()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        let port = self.remote_address().map(|a| a.port()).unwrap_or_default();
        let packet = with_timeout(recv_timeout, TimeoutKind::Recv, &host, port, async {
            loop {
                let packet = self.recv_packet().await?;
                match packet.ty {
                    PacketType::Data => return Ok(packet),
                    PacketType::Marker => continue,
                    _ => return Err(Error::ProtocolViolation("unexpected packet type")),
                }
            }
        })
        .await?;
        self.rcv_data.from_packet(&packet)
    }

    /// Payload bytes of the last received Data packet
    pub fn received(&self) -> &[u8] {
        self.rcv_data.remaining()
    }

    pub fn advance_received(&mut self, n: usize) {
        self.rcv_data.advance(n);
    }

    /// Interrupt the server mid-operation. Posted locally until the
    /// session is connected.
    pub async fn send_break(&mut self) -> Result<()> {
        if self.is_break {
            return Ok(());
        }
        if !self.is_connected() {
            self.is_break = true;
            self.break_posted = true;
            return Ok(());
        }
        self.is_break = true;
        let bytes = self.marker.prepare(NIQIMARK).to_vec();
        self.transport_mut()?.send(&bytes).await
    }

    /// Resynchronize after a break: send the reset marker and drain until
    /// the server's reset marker arrives
    pub async fn reset(&mut self) -> Result<()> {
        if self.break_posted {
            let bytes = self.marker.prepare(NIQBMARK).to_vec();
            self.transport_mut()?.send(&bytes).await?;
            self.break_posted = false;
        }
        let bytes = self.marker.prepare(NIQRMARK).to_vec();
        self.transport_mut()?.send(&bytes).await?;

        while !self.is_reset {
            self.recv_packet().await?;
        }
        self.snd_data.reset();
        self.is_break = false;
        self.is_reset = false;
        Ok(())
    }

    /// Error number from an in-band notification, or zero when none is
    /// pending. Never blocks on the socket.
    pub fn in_band_notification(&mut self) -> Result<u32> {
        if let Some(notification) = &self.pending_control {
            return Ok(notification.errno);
        }
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed {
                reason: "session is not connected".into(),
            });
        }
        let transport = self.transport_mut()?;
        if !transport.has_pending()? {
            return Ok(0);
        }
        // peek at the queued packet without losing it
        let packet = match self.transport.as_mut() {
            Some(t) => match t.receive_queued() {
                Some(p) => p,
                None => return Ok(0),
            },
            None => return Ok(0),
        };
        if packet.ty == PacketType::Control {
            let notification = ControlNotification::parse(&packet)?;
            let errno = notification.errno;
            self.pending_control = Some(notification);
            Ok(errno)
        } else {
            self.transport_mut()?.requeue(packet);
            Ok(0)
        }
    }

    /// Close the session, sending the EOF Data packet unless immediate
    pub async fn disconnect(&mut self, mode: DisconnectMode) {
        if self.state != SessionState::Connected {
            return;
        }
        self.state = SessionState::Disconnecting;
        if mode != DisconnectMode::Immediate {
            self.snd_data.prepare_to_send(NSPDAFEOF);
            let bytes = self.snd_data.as_bytes().to_vec();
            if let Ok(transport) = self.transport_mut() {
                let _ = transport.send(&bytes).await;
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect(mode).await;
        }
        self.transport = None;
        self.state = SessionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapSource(Vec<(String, String)>);

    impl AliasSource for MapSource {
        fn lookup(&self, alias: &str) -> Option<String> {
            self.0
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(alias))
                .map(|(_, value)| value.clone())
        }
    }

    #[tokio::test]
    async fn descriptor_text_passes_through() {
        let text = "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=db1)(PORT=1521)))";
        assert_eq!(resolve_connect_string(text, None).await.unwrap(), text);
    }

    #[tokio::test]
    async fn url_goes_through_easy_connect() {
        let resolved = resolve_connect_string("127.0.0.1:1525/orclpdb1", None)
            .await
            .unwrap();
        assert!(resolved.contains("(HOST=127.0.0.1)"));
        assert!(resolved.contains("(PORT=1525)"));
        assert!(resolved.contains("(SERVICE_NAME=orclpdb1)"));
    }

    #[tokio::test]
    async fn alias_resolves_through_source() {
        let source = MapSource(vec![(
            "prod".into(),
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=db1)(PORT=1521)))".into(),
        )]);
        let resolved = resolve_connect_string("PROD", Some(&source)).await.unwrap();
        assert!(resolved.contains("(HOST=db1)"));
    }

    #[tokio::test]
    async fn unknown_alias_is_rejected() {
        assert!(matches!(
            resolve_connect_string("nosuchalias", None).await,
            Err(Error::InvalidConnectString(_))
        ));
    }

    #[test]
    fn break_is_posted_before_connect() {
        let mut session = NetworkSession::new(Arc::new(DownHostsCache::default()));
        let posted = futures_block_on(session.send_break());
        assert!(posted.is_ok());
        assert!(session.is_break);
        assert!(session.break_posted);
    }

    fn futures_block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
