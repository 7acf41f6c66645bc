//! User-facing configuration and per-attempt session attributes

use std::path::PathBuf;
use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use rand::RngCore;

use crate::error::Result;
use crate::navigator::DescriptionParams;
use crate::negotiation;

/// File name looked up inside a wallet directory
pub const PEM_WALLET_FILE_NAME: &str = "ewallet.pem";

/// Applied when neither a connect nor a transport-connect timeout is set
const DEFAULT_TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_SDU: u32 = 8192;
const DEFAULT_TDU: u32 = 2_097_152;

/// Settings supplied by the application, before any descriptor parameters
/// are applied on top
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    /// long-form descriptor, easy-connect URL, or bare alias
    pub connect_string: String,
    pub connect_timeout: Option<Duration>,
    pub transport_connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub sdu: Option<u32>,
    /// keepalive probe interval, minutes
    pub expire_time: Option<u32>,
    pub tcp_no_delay: Option<bool>,
    pub connection_id_prefix: Option<String>,
    /// directory holding `ewallet.pem`
    pub wallet_location: Option<PathBuf>,
    /// PEM text used directly instead of reading the wallet file
    pub wallet_content: Option<String>,
    pub ssl_server_dn_match: Option<bool>,
    pub ssl_allow_weak_dn_match: bool,
    pub ssl_server_cert_dn: Option<String>,
    pub use_sni: bool,
    /// certificate-based external authentication over a secure transport
    pub external_auth: bool,
    pub https_proxy: Option<String>,
    pub https_proxy_port: Option<u16>,
}

/// Transport-level knobs carried alongside the session attributes
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub tcp_no_delay: bool,
    /// keepalive probe interval; derived from EXPIRE_TIME minutes
    pub expire_time: Option<Duration>,
    /// dead-connection detection requested via `(ENABLE=BROKEN)`
    pub enable_dcd: bool,
    pub wallet_file: Option<PathBuf>,
    pub wallet: Option<String>,
    pub ssl_server_dn_match: bool,
    pub ssl_allow_weak_dn_match: bool,
    pub ssl_server_cert_dn: Option<String>,
    pub use_sni: bool,
    pub https_proxy: Option<String>,
    pub https_proxy_port: Option<u16>,
    pub connection_id: Option<String>,
    /// host the client originally dialed, kept across a redirect for
    /// certificate identity checks
    pub origin_host: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            tcp_no_delay: true,
            expire_time: None,
            enable_dcd: false,
            wallet_file: None,
            wallet: None,
            ssl_server_dn_match: true,
            ssl_allow_weak_dn_match: false,
            ssl_server_cert_dn: None,
            use_sni: false,
            https_proxy: None,
            https_proxy_port: None,
            connection_id: None,
            origin_host: None,
        }
    }
}

/// Negotiable attributes of one session, rebuilt per connect attempt.
///
/// Holds the values sent in the Connect packet and overwritten by the
/// Accept packet, plus the transport settings resolved from configuration
/// and descriptor parameters.
#[derive(Debug, Clone)]
pub struct SessionAttributes {
    pub version: u16,
    pub options: u16,
    pub sdu: u32,
    pub tdu: u32,
    pub large_sdu: bool,
    /// negotiation flags copied into the Connect packet
    pub na_flags: u8,
    /// server declined security negotiation
    pub no_na: bool,
    pub accept_flags: u32,
    pub connect_timeout: Option<Duration>,
    pub transport_connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    /// random identity preserved across redirects of one logical connect
    pub uuid: Option<String>,
    pub connection_id_prefix: Option<String>,
    pub connection_id: Option<String>,
    pub nt: TransportSettings,
}

impl Default for SessionAttributes {
    fn default() -> Self {
        Self {
            version: 0,
            options: 0,
            sdu: DEFAULT_SDU,
            tdu: DEFAULT_TDU,
            large_sdu: false,
            na_flags: 0,
            no_na: false,
            accept_flags: 0,
            connect_timeout: None,
            transport_connect_timeout: None,
            recv_timeout: None,
            send_timeout: None,
            uuid: None,
            connection_id_prefix: None,
            connection_id: None,
            nt: TransportSettings::default(),
        }
    }
}

impl SessionAttributes {
    /// Apply application-level configuration
    pub fn set_from_config(&mut self, config: &ConnectConfig) {
        if let Some(sdu) = config.sdu {
            if sdu > 0 {
                self.sdu = sdu;
            }
        }
        self.connect_timeout = config.connect_timeout.or(self.connect_timeout);
        self.transport_connect_timeout = config
            .transport_connect_timeout
            .or(self.transport_connect_timeout);
        self.recv_timeout = config.recv_timeout.or(self.recv_timeout);
        self.send_timeout = config.send_timeout.or(self.send_timeout);
        if let Some(prefix) = &config.connection_id_prefix {
            self.connection_id_prefix = Some(prefix.clone());
        }
        if let Some(dir) = &config.wallet_location {
            self.nt.wallet_file = Some(dir.join(PEM_WALLET_FILE_NAME));
        }
        if let Some(content) = &config.wallet_content {
            self.nt.wallet = Some(content.clone());
        }
        if let Some(minutes) = config.expire_time {
            if minutes > 0 {
                self.nt.expire_time = Some(Duration::from_secs(u64::from(minutes) * 60));
            }
        }
        if let Some(nodelay) = config.tcp_no_delay {
            self.nt.tcp_no_delay = nodelay;
        }
        if let Some(dn_match) = config.ssl_server_dn_match {
            self.nt.ssl_server_dn_match = dn_match;
        }
        self.nt.ssl_allow_weak_dn_match = config.ssl_allow_weak_dn_match;
        if let Some(dn) = &config.ssl_server_cert_dn {
            self.nt.ssl_server_cert_dn = Some(dn.clone());
        }
        self.nt.use_sni = config.use_sni;
        if let Some(proxy) = &config.https_proxy {
            self.nt.https_proxy = Some(proxy.clone());
        }
        if let Some(port) = config.https_proxy_port {
            self.nt.https_proxy_port = Some(port);
        }
    }

    /// Apply per-description parameters on top of the configuration
    pub fn set_from_params(&mut self, params: &DescriptionParams) {
        if let Some(sdu) = params.sdu {
            if sdu > 0 {
                self.sdu = sdu;
            }
        }
        self.connect_timeout = params.connect_timeout.or(self.connect_timeout);
        self.transport_connect_timeout = params
            .transport_connect_timeout
            .or(self.transport_connect_timeout);
        self.recv_timeout = params.recv_timeout.or(self.recv_timeout);
        if let Some(prefix) = &params.connection_id_prefix {
            self.connection_id_prefix = Some(prefix.clone());
        }
        if let Some(minutes) = params.expire_time {
            self.nt.expire_time = Some(Duration::from_secs(u64::from(minutes) * 60));
        }
        if params
            .enable
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("broken"))
        {
            self.nt.enable_dcd = true;
        }
        if let Some(dn_match) = params.ssl_server_dn_match {
            self.nt.ssl_server_dn_match = dn_match;
        }
        if let Some(dn) = &params.ssl_server_cert_dn {
            self.nt.ssl_server_cert_dn = Some(dn.clone());
        }
        if let Some(dir) = &params.wallet_location {
            self.nt.wallet_file = Some(PathBuf::from(dir).join(PEM_WALLET_FILE_NAME));
        }
    }

    /// Finish the attributes for a connect attempt: mint the connection id,
    /// load the wallet for secure transports, and resolve defaults
    pub fn prepare(&mut self, protocol: &str, external_auth: bool) -> Result<()> {
        if self.uuid.is_none() {
            let mut bytes = [0u8; 16];
            rand::rng().fill_bytes(&mut bytes);
            self.uuid = Some(BASE64_STANDARD.encode(bytes));
        }
        let uuid = self.uuid.clone().unwrap_or_default();
        self.connection_id = Some(match &self.connection_id_prefix {
            Some(prefix) => format!("{prefix}{uuid}"),
            None => uuid,
        });
        self.nt.connection_id = self.connection_id.clone();

        if protocol.eq_ignore_ascii_case("tcps") && self.nt.wallet.is_none() {
            if let Some(path) = &self.nt.wallet_file {
                let pem = std::fs::read_to_string(path).map_err(|source| {
                    crate::error::Error::TransportConnectFailed {
                        host: path.display().to_string(),
                        port: 0,
                        source,
                    }
                })?;
                self.nt.wallet = Some(pem);
            }
        }

        if self.connect_timeout.is_none() && self.transport_connect_timeout.is_none() {
            self.transport_connect_timeout = Some(DEFAULT_TRANSPORT_CONNECT_TIMEOUT);
        }

        self.na_flags = negotiation::negotiation_flags(protocol, external_auth);
        Ok(())
    }
}
