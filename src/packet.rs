//! Wire packet layout: fixed-offset builders and parsers
//!
//! Every packet starts with the same 8-byte header: a 2-byte length (4-byte
//! once large SDU is negotiated, overlapping the checksum field), a packet
//! type, a flags byte, and a header checksum placeholder. All integers are
//! big-endian.

use bytes::Bytes;

use crate::config::SessionAttributes;
use crate::error::{Error, Result};

// header
pub const NSPHDLEN: usize = 0;
pub const NSPHDTYP: usize = 4;
pub const NSPHDFLGS: usize = 5;
pub const NSPSIZHD: usize = 8;

// header flags
pub const NSPFRDS: u8 = 0x02;
pub const NSPFRDR: u8 = 0x04;
pub const NSPFSRN: u8 = 0x08;

// connect packet
const NSPCNVSN: usize = 8;
const NSPCNLOV: usize = 10;
const NSPCNOPT: usize = 12;
const NSPCNSDU: usize = 14;
const NSPCNTDU: usize = 16;
const NSPCNNTC: usize = 18;
const NSPCNONE: usize = 22;
const NSPCNLEN: usize = 24;
const NSPCNOFF: usize = 26;
const NSPCNFL0: usize = 32;
const NSPCNFL1: usize = 33;
const NSPCNLSD: usize = 58;
const NSPCNLTD: usize = 62;
const NSPCNCFL: usize = 66;
const NSPCNCFL2: usize = 70;
pub const NSPCNDAT: usize = 74;
/// connect data beyond this length moves to a trailing Data packet
pub const NSPMXCDATA: usize = 230;

// connect flags
pub const NSINAWANTED: u8 = 0x01;
pub const NSINADISABLEDFORCONNECTION: u8 = 0x04;
pub const NSINANOSERVICES: u8 = 0x08;

// connect options
const NSGDONTCARE: u16 = 0x0001;

pub const TNS_VERSION_DESIRED: u16 = 319;
pub const TNS_VERSION_MINIMUM: u16 = 300;
/// negotiated version at which the large SDU fields are authoritative
pub const TNS_VERSION_MIN_LARGE_SDU: u16 = 315;
/// negotiated version at which the accept packet carries a flags word
pub const TNS_VERSION_MIN_DATA_FLAGS: u16 = 314;

// accept packet
const NSPACVSN: usize = 8;
const NSPACOPT: usize = 10;
const NSPACSDU: usize = 12;
const NSPACTDU: usize = 14;
const NSPACFL0: usize = 22;
const NSPACFL1: usize = 23;
const NSPACLSD: usize = 32;
const NSPACLTD: usize = 36;
const NSPACCFL: usize = 40;
const NSPACFL2: usize = 41;
const NSPACCFON: u8 = 0x80;

// refuse packet
const NSPRFURS: usize = 8;
const NSPRFSRS: usize = 9;
const NSPRFLEN: usize = 10;
const NSPRFDAT: usize = 12;

// redirect packet
const NSPRDLEN: usize = 8;
const NSPRDDAT: usize = 10;

// data packet
const NSPDAFLG: usize = 8;
pub const NSPDADAT: usize = 10;
pub const NSPDAFEOF: u16 = 0x40;

// marker packet
const NSPMKTYP: usize = 8;
const NSPMKDAT: usize = 10;
const NSPMKTD0: u8 = 0;
const NSPMKTD1: u8 = 1;
pub const NIQBMARK: u8 = 1;
pub const NIQRMARK: u8 = 2;
pub const NIQIMARK: u8 = 3;

// control packet
const NSPCTLCMD: usize = 8;
const NSPCTLDAT: usize = 10;
const NSPCTL_SERR: u16 = 8;
/// connection manager shut down
pub const NSECMANSHUT: u32 = 12572;
/// in-band message follows
pub const NSESENDMESG: u32 = 12573;

// SDU/TDU bounds
pub const NSPDFSDULN: u32 = 8192;
pub const NSPABSSDULN: u32 = 2_097_152;
pub const NSPMXSDULN: u32 = 65_535;
pub const NSPMNSDULN: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    Accept = 2,
    Ack = 3,
    Refuse = 4,
    Redirect = 5,
    Data = 6,
    Null = 7,
    Abort = 9,
    Resend = 11,
    Marker = 12,
    Attention = 13,
    Control = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Connect,
            2 => Self::Accept,
            3 => Self::Ack,
            4 => Self::Refuse,
            5 => Self::Redirect,
            6 => Self::Data,
            7 => Self::Null,
            9 => Self::Abort,
            11 => Self::Resend,
            12 => Self::Marker,
            13 => Self::Attention,
            14 => Self::Control,
            _ => return None,
        })
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(Error::ProtocolViolation("truncated packet"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(Error::ProtocolViolation("truncated packet"))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn get_u8(buf: &[u8], offset: usize) -> Result<u8> {
    buf.get(offset)
        .copied()
        .ok_or(Error::ProtocolViolation("truncated packet"))
}

/// One fully-framed packet as received from the transport
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Bytes,
    pub ty: PacketType,
    pub flags: u8,
}

impl Packet {
    pub fn parse(buf: Bytes) -> Result<Self> {
        if buf.len() < NSPSIZHD {
            return Err(Error::ProtocolViolation("short packet header"));
        }
        let ty = PacketType::from_u8(buf[NSPHDTYP])
            .ok_or(Error::ProtocolViolation("unknown packet type"))?;
        let flags = buf[NSPHDFLGS];
        Ok(Self { buf, ty, flags })
    }
}

/// Connect request carrying the descriptor text, or announcing a trailing
/// Data packet when the text exceeds the inline threshold
#[derive(Debug)]
pub struct ConnectPacket {
    pub buf: Bytes,
    pub overflow: bool,
}

impl ConnectPacket {
    pub fn build(connect_data: &[u8], atts: &SessionAttributes, flags: u8) -> Self {
        let data_len = connect_data.len();
        let overflow = data_len > NSPMXCDATA;
        let size = if overflow { NSPCNDAT } else { NSPCNDAT + data_len };

        let mut buf = vec![0u8; size];
        put_u16(&mut buf, NSPHDLEN, size as u16);
        buf[NSPHDTYP] = PacketType::Connect as u8;
        buf[NSPHDFLGS] = flags;

        put_u16(&mut buf, NSPCNVSN, TNS_VERSION_DESIRED);
        put_u16(&mut buf, NSPCNLOV, TNS_VERSION_MINIMUM);
        put_u16(&mut buf, NSPCNOPT, NSGDONTCARE);
        put_u16(&mut buf, NSPCNSDU, atts.sdu.min(NSPMXSDULN) as u16);
        put_u16(&mut buf, NSPCNTDU, atts.tdu.min(NSPMXSDULN) as u16);
        put_u16(&mut buf, NSPCNNTC, 0);
        put_u16(&mut buf, NSPCNONE, 1);
        put_u16(&mut buf, NSPCNLEN, data_len as u16);
        put_u16(&mut buf, NSPCNOFF, NSPCNDAT as u16);
        buf[NSPCNFL0] = atts.na_flags;
        buf[NSPCNFL1] = atts.na_flags;
        put_u32(&mut buf, NSPCNLSD, atts.sdu);
        put_u32(&mut buf, NSPCNLTD, atts.tdu);
        put_u16(&mut buf, NSPCNCFL, 0);
        put_u32(&mut buf, NSPCNCFL2, 0);

        if !overflow && data_len > 0 {
            buf[NSPCNDAT..NSPCNDAT + data_len].copy_from_slice(connect_data);
        }
        Self {
            buf: Bytes::from(buf),
            overflow,
        }
    }
}

/// Accept response; applies the negotiated values onto the attributes
#[derive(Debug)]
pub struct AcceptPacket {
    pub compression_enabled: bool,
}

impl AcceptPacket {
    pub fn parse(packet: &Packet, atts: &mut SessionAttributes) -> Result<Self> {
        let buf = &packet.buf;
        atts.version = get_u16(buf, NSPACVSN)?;
        atts.options = get_u16(buf, NSPACOPT)?;
        atts.sdu = u32::from(get_u16(buf, NSPACSDU)?);
        atts.tdu = u32::from(get_u16(buf, NSPACTDU)?);

        let mut compression_enabled = false;
        if atts.version >= TNS_VERSION_MIN_LARGE_SDU {
            atts.sdu = get_u32(buf, NSPACLSD)?;
            atts.tdu = get_u32(buf, NSPACLTD)?;
            atts.large_sdu = true;
            let cflag = get_u8(buf, NSPACCFL)?;
            compression_enabled = cflag & NSPACCFON != 0;
        }

        let flag0 = get_u8(buf, NSPACFL0)?;
        let flag1 = get_u8(buf, NSPACFL1)?;
        atts.no_na = flag1 & NSINANOSERVICES != 0 || flag0 & NSINADISABLEDFORCONNECTION != 0;

        if atts.version >= TNS_VERSION_MIN_DATA_FLAGS && buf.len() >= NSPACFL2 + 4 {
            atts.accept_flags = get_u32(buf, NSPACFL2)?;
        }
        Ok(Self { compression_enabled })
    }
}

/// Refuse response with its in-band reason codes and error text
#[derive(Debug)]
pub struct RefusePacket {
    pub user_reason: u8,
    pub system_reason: u8,
    pub data: String,
    /// refuse text did not fit inline; a Data packet follows
    pub overflow: bool,
}

impl RefusePacket {
    pub fn parse(packet: &Packet) -> Result<Self> {
        let buf = &packet.buf;
        let user_reason = get_u8(buf, NSPRFURS)?;
        let system_reason = get_u8(buf, NSPRFSRS)?;
        let _declared_len = get_u16(buf, NSPRFLEN)?;
        let overflow = buf.len() <= NSPRFDAT;
        let data = if overflow {
            String::new()
        } else {
            String::from_utf8_lossy(&buf[NSPRFDAT..]).into_owned()
        };
        Ok(Self {
            user_reason,
            system_reason,
            data,
            overflow,
        })
    }
}

/// Redirect response pointing at a replacement address
#[derive(Debug)]
pub struct RedirectPacket {
    pub flags: u8,
    pub data_len: u16,
    pub data: Bytes,
    pub overflow: bool,
}

impl RedirectPacket {
    pub fn parse(packet: &Packet) -> Result<Self> {
        let buf = &packet.buf;
        let data_len = get_u16(buf, NSPRDLEN)?;
        let overflow = buf.len() <= NSPRDDAT;
        let data = if overflow {
            Bytes::new()
        } else {
            packet.buf.slice(NSPRDDAT..)
        };
        Ok(Self {
            flags: packet.flags,
            data_len,
            data,
            overflow,
        })
    }
}

/// Reusable Data packet buffer with fill cursors for partial writes
#[derive(Debug)]
pub struct DataPacket {
    buf: Vec<u8>,
    large_sdu: bool,
    /// start of payload in `buf`
    pub data_ptr: usize,
    /// end of payload written so far
    pub data_len: usize,
    /// read cursor for received packets
    pub offset: usize,
    /// read limit for received packets
    pub len: usize,
}

impl DataPacket {
    pub fn new(large_sdu: bool) -> Self {
        Self {
            buf: Vec::new(),
            large_sdu,
            data_ptr: 0,
            data_len: 0,
            offset: 0,
            len: 0,
        }
    }

    /// Allocate the send buffer; `capacity` covers header and payload
    pub fn create(&mut self, capacity: usize) {
        self.buf = vec![0u8; capacity.max(NSPDADAT)];
        self.buf[NSPHDTYP] = PacketType::Data as u8;
        self.data_ptr = NSPDADAT;
        self.data_len = NSPDADAT;
    }

    /// Copy as much of `src` as fits, stamp the header, and return the
    /// number of bytes consumed
    pub fn fill(&mut self, src: &[u8], flags: u16) -> usize {
        if self.buf.is_empty() {
            self.create(src.len() + NSPDADAT);
        }
        let room = self.buf.len() - self.data_len;
        let take = src.len().min(room);
        self.buf[self.data_len..self.data_len + take].copy_from_slice(&src[..take]);
        self.data_len += take;
        self.prepare_to_send(flags);
        take
    }

    /// Stamp length and flags for the bytes written so far
    pub fn prepare_to_send(&mut self, flags: u16) {
        if self.large_sdu {
            put_u32(&mut self.buf, NSPHDLEN, self.data_len as u32);
        } else {
            put_u16(&mut self.buf, NSPHDLEN, self.data_len as u16);
        }
        put_u16(&mut self.buf, NSPDAFLG, flags);
    }

    /// The framed bytes to hand to the transport
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.data_len]
    }

    /// Reset the payload cursor so the buffer can be refilled
    pub fn reset(&mut self) {
        self.data_len = NSPDADAT;
    }

    /// Adopt a received packet for cursor-based reads
    pub fn from_packet(&mut self, packet: &Packet) -> Result<u16> {
        let flags = get_u16(&packet.buf, NSPDAFLG)?;
        self.buf = packet.buf.to_vec();
        self.data_ptr = NSPDADAT;
        self.data_len = self.buf.len();
        self.offset = self.data_ptr;
        self.len = self.data_len;
        Ok(flags)
    }

    /// Bytes remaining behind the read cursor
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset.min(self.len)..self.len]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.len);
    }
}

/// Marker packet: break, reset, or attention signaling outside the data
/// stream
#[derive(Debug)]
pub struct MarkerPacket {
    buf: [u8; NSPMKDAT + 1],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerEvent {
    Break,
    Reset,
}

impl MarkerPacket {
    pub fn new(large_sdu: bool) -> Self {
        let mut buf = [0u8; NSPMKDAT + 1];
        let len = buf.len();
        if large_sdu {
            put_u32(&mut buf, NSPHDLEN, len as u32);
        } else {
            put_u16(&mut buf, NSPHDLEN, len as u16);
        }
        buf[NSPHDTYP] = PacketType::Marker as u8;
        Self { buf }
    }

    /// Stamp a one-byte data marker and return the framed bytes
    pub fn prepare(&mut self, data: u8) -> &[u8] {
        self.buf[NSPMKTYP] = NSPMKTD1;
        self.buf[NSPMKDAT] = data;
        &self.buf
    }

    pub fn parse(packet: &Packet) -> Result<MarkerEvent> {
        match get_u8(&packet.buf, NSPMKTYP)? {
            NSPMKTD0 => Ok(MarkerEvent::Break),
            NSPMKTD1 => {
                if get_u8(&packet.buf, NSPMKDAT)? == NIQRMARK {
                    Ok(MarkerEvent::Reset)
                } else {
                    Ok(MarkerEvent::Break)
                }
            }
            _ => Err(Error::ProtocolViolation("unknown marker type")),
        }
    }
}

/// In-band notification delivered through a Control packet
#[derive(Debug, Default, Clone)]
pub struct ControlNotification {
    pub errno: u32,
    pub message: Option<Bytes>,
}

impl ControlNotification {
    pub fn parse(packet: &Packet) -> Result<Self> {
        let cmd = get_u16(&packet.buf, NSPCTLCMD)?;
        if cmd != NSPCTL_SERR {
            return Err(Error::ProtocolViolation("unknown control command"));
        }
        let _emfi = get_u32(&packet.buf, NSPCTLDAT)?;
        let errno = get_u32(&packet.buf, NSPCTLDAT + 4)?;
        let aux = get_u32(&packet.buf, NSPCTLDAT + 8)?;
        let message = if errno == NSESENDMESG {
            let start = NSPCTLDAT + 12;
            let end = (start + aux as usize).min(packet.buf.len());
            if start <= end {
                Some(packet.buf.slice(start..end))
            } else {
                None
            }
        } else {
            None
        };
        Ok(Self { errno, message })
    }
}
