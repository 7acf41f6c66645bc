//! Security options negotiation carried in Data packets after Accept
//!
//! Four sub-services are advertised in one request: Supervisor (the
//! coordinator), Authentication, Encryption, and Data Integrity. Transport
//! security is provided by TLS underneath, so Encryption and Data Integrity
//! always advertise zero drivers; Authentication offers the one
//! certificate-based method and only matters for external authentication
//! over a secure transport.

use base64::prelude::{Engine, BASE64_STANDARD};
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::{NSINANOSERVICES, NSINAWANTED};

const MAGIC: u32 = 0xdead_beef;
/* version 23.7.0.0.0 */
const VERSION: u32 = 0x1770_0000;

const AUTHENTICATION: u16 = 1;
const ENCRYPTION: u16 = 2;
const DATA_INTEGRITY: u16 = 3;
const SUPERVISOR: u16 = 4;

const SUPERVISOR_OK: u16 = 0x1f;
const AUTHENTICATION_OK: u16 = 0xfaff;
const AUTHENTICATION_DONT_USE_AUTH: u16 = 0xfbff;
const AUTH_NOT_REQUIRED: u16 = 0xfcff;
/* client/server connection */
const CLIENT_SERVER: u16 = 0xe0e1;
const AUTH_TCPS_ID: u8 = 2;
const AUTH_TCPS_NAME: &str = "tcps";

const STRING_TYPE: u16 = 0;
const RAW_TYPE: u16 = 1;
const UB1_TYPE: u16 = 2;
const UB2_TYPE: u16 = 3;
const VERSION_TYPE: u16 = 5;
const STATUS_TYPE: u16 = 6;

/// Offset of the negotiation payload inside a received Data packet
/// (8-byte header plus the 2-byte data flags)
const DATA_OFFSET: usize = 10;

fn service_name(id: u16) -> &'static str {
    match id {
        AUTHENTICATION => "authentication",
        ENCRYPTION => "encryption",
        DATA_INTEGRITY => "data integrity",
        SUPERVISOR => "supervisor",
        _ => "unknown",
    }
}

/// Connect-header flags announcing whether negotiation is wanted at all
pub fn negotiation_flags(protocol: &str, external_auth: bool) -> u8 {
    if protocol.eq_ignore_ascii_case("tcps") && external_auth {
        NSINAWANTED
    } else {
        NSINANOSERVICES
    }
}

/// Builds the negotiation request and digests the server's answer
pub struct Negotiator {
    /// first 8 bytes of the session uuid, sent as the client id
    client_id: [u8; 8],
    auth_activated: bool,
}

impl Negotiator {
    pub fn new(uuid_base64: &str) -> Self {
        let mut client_id = [0u8; 8];
        if let Ok(decoded) = BASE64_STANDARD.decode(uuid_base64) {
            let n = decoded.len().min(8);
            client_id[..n].copy_from_slice(&decoded[..n]);
        }
        Self {
            client_id,
            auth_activated: false,
        }
    }

    /// The certificate-based method was accepted by the server
    pub fn auth_activated(&self) -> bool {
        self.auth_activated
    }

    /// Serialize the full negotiation request
    pub fn build_packet(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(MAGIC);
        w.u16(0); // total length, patched below
        w.u32(VERSION);
        w.u16(4); // service count
        w.u8(0); // error flag

        self.write_supervisor(&mut w);
        self.write_authentication(&mut w);
        self.write_zero_driver_service(&mut w, ENCRYPTION);
        self.write_zero_driver_service(&mut w, DATA_INTEGRITY);

        let len = w.buf.len() as u16;
        w.buf[4..6].copy_from_slice(&len.to_be_bytes());
        w.buf
    }

    fn write_supervisor(&self, w: &mut Writer) {
        w.service_header(SUPERVISOR, 3);
        w.version_sub();
        w.raw_sub(&self.client_id);
        w.array_sub(&[AUTHENTICATION, ENCRYPTION, DATA_INTEGRITY, SUPERVISOR]);
    }

    fn write_authentication(&self, w: &mut Writer) {
        // version, pairing, status, then id+name per offered method
        w.service_header(AUTHENTICATION, 5);
        w.version_sub();
        w.ub2_sub(CLIENT_SERVER);
        w.status_sub(AUTH_NOT_REQUIRED);
        w.ub1_sub(AUTH_TCPS_ID);
        w.string_sub(AUTH_TCPS_NAME);
    }

    fn write_zero_driver_service(&self, w: &mut Writer, service: u16) {
        w.service_header(service, 2);
        w.version_sub();
        w.raw_sub(&[0x00]);
    }

    /// Digest the server's negotiation answer out of a received Data packet
    pub fn process_packet(&mut self, packet_buf: &[u8]) -> Result<()> {
        let mut r = Reader::new(packet_buf, DATA_OFFSET);
        if r.u32()? != MAGIC {
            return Err(Error::ProtocolViolation("bad negotiation magic"));
        }
        let _total_len = r.u16()?;
        let _version = r.u32()?;
        let services = r.u16()?;
        let _error_flag = r.u8()?;

        for _ in 0..services {
            let service = r.u16()?;
            let sub_packets = r.u16()?;
            let error = r.u32()?;
            if error != 0 {
                return Err(Error::SecurityNegotiationFailed {
                    service: service_name(service),
                    code: error,
                });
            }
            match service {
                SUPERVISOR => self.read_supervisor(&mut r)?,
                AUTHENTICATION => self.read_authentication(&mut r, sub_packets)?,
                ENCRYPTION | DATA_INTEGRITY => {
                    // version sub-packet plus the single zero driver echoed
                    r.expect_sub(VERSION_TYPE)?;
                    r.u32()?;
                    r.expect_sub(RAW_TYPE)?;
                    r.u8()?;
                }
                _ => return Err(Error::ProtocolViolation("unknown negotiation service")),
            }
        }
        debug!(auth_activated = self.auth_activated, "security negotiation complete");
        Ok(())
    }

    fn read_supervisor(&mut self, r: &mut Reader<'_>) -> Result<()> {
        r.expect_sub(VERSION_TYPE)?;
        let _server_version = r.u32()?;
        r.expect_sub(STATUS_TYPE)?;
        let status = r.u16()?;
        if status != SUPERVISOR_OK {
            return Err(Error::SecurityNegotiationFailed {
                service: service_name(SUPERVISOR),
                code: u32::from(status),
            });
        }
        // array of services the server kept active
        r.expect_sub(RAW_TYPE)?;
        if r.u32()? != MAGIC {
            return Err(Error::ProtocolViolation("bad negotiation array header"));
        }
        if r.u16()? != UB2_TYPE {
            return Err(Error::ProtocolViolation("bad negotiation array type"));
        }
        let count = r.u32()?;
        for _ in 0..count {
            r.u16()?;
        }
        Ok(())
    }

    fn read_authentication(&mut self, r: &mut Reader<'_>, sub_packets: u16) -> Result<()> {
        r.expect_sub(VERSION_TYPE)?;
        let _server_version = r.u32()?;
        r.expect_sub(STATUS_TYPE)?;
        let status = r.u16()?;
        if status == AUTHENTICATION_OK && sub_packets > 2 {
            // ub1 service id sub-packet precedes the chosen method name
            r.skip(5)?;
            let len = r.expect_sub(STRING_TYPE)?;
            let name = r.bytes(len as usize)?;
            debug!(method = %String::from_utf8_lossy(name), "authentication service active");
            self.auth_activated = true;
        } else if status == AUTHENTICATION_DONT_USE_AUTH {
            self.auth_activated = false;
        } else {
            return Err(Error::SecurityNegotiationFailed {
                service: service_name(AUTHENTICATION),
                code: u32::from(status),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn service_header(&mut self, service: u16, sub_packets: u16) {
        self.u16(service);
        self.u16(sub_packets);
        self.u32(0); // no error
    }

    fn version_sub(&mut self) {
        self.u16(4);
        self.u16(VERSION_TYPE);
        self.u32(VERSION);
    }

    fn raw_sub(&mut self, data: &[u8]) {
        self.u16(data.len() as u16);
        self.u16(RAW_TYPE);
        self.buf.extend_from_slice(data);
    }

    /// Length-prefixed ub2 array wrapped in a raw sub-packet
    fn array_sub(&mut self, values: &[u16]) {
        self.u16((4 + 2 + 4 + values.len() * 2) as u16);
        self.u16(RAW_TYPE);
        self.u32(MAGIC);
        self.u16(UB2_TYPE);
        self.u32(values.len() as u32);
        for v in values {
            self.u16(*v);
        }
    }

    fn status_sub(&mut self, status: u16) {
        self.u16(2);
        self.u16(STATUS_TYPE);
        self.u16(status);
    }

    fn string_sub(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.u16(STRING_TYPE);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn ub1_sub(&mut self, v: u8) {
        self.u16(1);
        self.u16(UB1_TYPE);
        self.u8(v);
    }

    fn ub2_sub(&mut self, v: u16) {
        self.u16(2);
        self.u16(UB2_TYPE);
        self.u16(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn u8(&mut self) -> Result<u8> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or(Error::ProtocolViolation("truncated negotiation packet"))?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(Error::ProtocolViolation("truncated negotiation packet"))?;
        self.pos += 2;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or(Error::ProtocolViolation("truncated negotiation packet"))?;
        self.pos += 4;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let b = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(Error::ProtocolViolation("truncated negotiation packet"))?;
        self.pos += n;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Read a sub-packet header, insisting its declared type matches
    fn expect_sub(&mut self, expected: u16) -> Result<u16> {
        let len = self.u16()?;
        let ty = self.u16()?;
        if ty != expected {
            return Err(Error::ProtocolViolation("unexpected negotiation sub-packet"));
        }
        Ok(len)
    }
}
