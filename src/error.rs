use std::{fmt, io};

use thiserror::Error;

/// Which of the layered timeouts expired.
///
/// The transport-connect timeout bounds raw socket establishment (and is
/// re-entered for every redirect), the connect timeout bounds the whole
/// handshake across retries, and the receive timeout bounds a single
/// packet-receive wait on an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `TRANSPORT_CONNECT_TIMEOUT` expired
    TransportConnect,
    /// `CONNECT_TIMEOUT` expired
    Connect,
    /// `RECV_TIMEOUT` expired
    Recv,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransportConnect => "transport connect",
            Self::Connect => "connect",
            Self::Recv => "receive",
        })
    }
}

/// Why the listener refused the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    /// The requested service name is not registered with the listener (ORA-12514)
    ServiceNotRegistered(String),
    /// The requested SID is not registered with the listener (ORA-12505)
    SidNotRegistered(String),
    /// Refused with some other in-band error code
    Code(u32),
    /// Refused without an embedded error code
    Unknown,
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceNotRegistered(svc) => {
                write!(f, "service \"{svc}\" is not registered with the listener")
            }
            Self::SidNotRegistered(sid) => {
                write!(f, "SID \"{sid}\" is not registered with the listener")
            }
            Self::Code(code) => write!(f, "ORA-{code:05}"),
            Self::Unknown => f.write_str("refused"),
        }
    }
}

/// Errors raised while establishing or using a network session
#[derive(Debug, Error)]
pub enum Error {
    /// The connect descriptor or alias text could not be parsed
    #[error("malformed connect descriptor")]
    MalformedDescriptor,
    /// The easy-connect URL or descriptor parameters are not usable
    #[error("invalid connect string: {0}")]
    InvalidConnectString(String),
    /// A host name present in the connect string does not resolve
    #[error("cannot resolve host \"{0}\"")]
    UnresolvableHost(String),
    /// Every description × option × retry combination has been tried
    #[error("all connection options exhausted")]
    OptionsExhausted,
    /// The raw socket (or proxy tunnel) could not be established
    #[error("transport connect to {host}:{port} failed: {source}")]
    TransportConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// TLS could not be layered over the established socket
    #[error("TLS handshake with {host} failed: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },
    /// The server sent a Refuse packet
    #[error("connection refused by {host}:{port}: {reason}")]
    ProtocolRefused {
        host: String,
        port: u16,
        reason: RefuseReason,
    },
    /// The peer sent a packet whose type or content is not legal here
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// A security sub-service reported a nonzero error during negotiation
    #[error("security negotiation failed in {service} service")]
    SecurityNegotiationFailed { service: &'static str, code: u32 },
    /// One of the layered timeouts fired
    #[error("{kind} timeout ({} s) expired for {host}:{port}", millis / 1000)]
    OperationTimedOut {
        kind: TimeoutKind,
        millis: u64,
        host: String,
        port: u16,
    },
    /// The transport dropped underneath an established session
    #[error("connection was closed: {reason}")]
    ConnectionClosed { reason: String },
}

impl Error {
    /// Whether the failure is a client-side configuration defect that must
    /// propagate immediately instead of being retried on another candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedDescriptor | Self::InvalidConnectString(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
