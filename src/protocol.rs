//! SOCKS5 wire codec (RFC 1928, RFC 1929).
//!
//! Pure encode/decode helpers; nothing in here touches a socket.

use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const USER_PASS_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

/// Longest value that fits a one-byte length prefix.
pub const MAX_FIELD_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    #[error("too many colons in address {0:?}")]
    TooManyColons(String),
    #[error("missing ']' in address {0:?}")]
    MissingBracket(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("empty host")]
    EmptyHost,
    #[error("invalid domain length: {0}")]
    DomainLength(usize),
    #[error("username/password too long (max 255 bytes each)")]
    CredentialTooLong,
    #[error("unexpected version 0x{0:02x}")]
    UnexpectedVersion(u8),
    #[error("unknown reply ATYP: 0x{0:02x}")]
    UnknownAddressType(u8),
    #[error("invalid domain length in reply")]
    EmptyBoundDomain,
    #[error("message too short")]
    TooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProtocolError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            other => Err(ProtocolError::UnknownAddressType(other)),
        }
    }
}

/// Destination address of a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// `0.0.0.0:0`, the placeholder a client sends with UDP ASSOCIATE when it
    /// does not know its own relay source yet.
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::Socket(SocketAddr::V4(_)) => AddressType::Ipv4,
            Address::Socket(SocketAddr::V6(_)) => AddressType::Ipv6,
            Address::Domain(..) => AddressType::Domain,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.address_type() == AddressType::Ipv6
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Length of ATYP + ADDR + PORT.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    /// Writes ATYP, ADDR and PORT (big-endian).
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.address_type() as u8);
        match self {
            Address::Socket(SocketAddr::V4(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::Socket(SocketAddr::V6(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::Domain(host, _) => {
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
            }
        }
        buf.put_u16(self.port());
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    /// Strict `host:port`. IPv6 literals must be bracketed, the port must be
    /// numeric and within 1-65535.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        let port = match port.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => p as u16,
            _ => return Err(ProtocolError::InvalidPort(port.to_string())),
        };
        if host.trim().is_empty() {
            return Err(ProtocolError::EmptyHost);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            // IPv4-mapped IPv6 literals travel as plain IPv4.
            let ip = match ip {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
                v4 => v4,
            };
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }

        if host.len() > MAX_FIELD_LEN {
            return Err(ProtocolError::DomainLength(host.len()));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

fn split_host_port(s: &str) -> Result<(&str, &str), ProtocolError> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ProtocolError::MissingBracket(s.to_string()))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| ProtocolError::MissingPort(s.to_string()))?;
        return Ok((host, port));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::MissingPort(s.to_string()))?;
    if host.contains(':') {
        return Err(ProtocolError::TooManyColons(s.to_string()));
    }
    if host.contains('[') || host.contains(']') {
        return Err(ProtocolError::MissingBracket(s.to_string()));
    }
    Ok((host, port))
}

/// REP field of a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl From<u8> for Reply {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Reply::Succeeded,
            0x01 => Reply::GeneralFailure,
            0x02 => Reply::ConnectionNotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            other => Reply::Unknown(other),
        }
    }
}

impl Reply {
    pub fn code(&self) -> u8 {
        match *self {
            Reply::Succeeded => 0x00,
            Reply::GeneralFailure => 0x01,
            Reply::ConnectionNotAllowed => 0x02,
            Reply::NetworkUnreachable => 0x03,
            Reply::HostUnreachable => 0x04,
            Reply::ConnectionRefused => 0x05,
            Reply::TtlExpired => 0x06,
            Reply::CommandNotSupported => 0x07,
            Reply::AddressTypeNotSupported => 0x08,
            Reply::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Succeeded => f.write_str("succeeded"),
            Reply::GeneralFailure => f.write_str("general SOCKS server failure"),
            Reply::ConnectionNotAllowed => f.write_str("connection not allowed by ruleset"),
            Reply::NetworkUnreachable => f.write_str("network unreachable"),
            Reply::HostUnreachable => f.write_str("host unreachable"),
            Reply::ConnectionRefused => f.write_str("connection refused by destination host"),
            Reply::TtlExpired => f.write_str("TTL expired"),
            Reply::CommandNotSupported => f.write_str("command not supported"),
            Reply::AddressTypeNotSupported => f.write_str("address type not supported"),
            Reply::Unknown(code) => write!(f, "unknown reply code 0x{:02x}", code),
        }
    }
}

/// VER, NMETHODS, METHODS...
///
/// "no auth" is always offered; "user/pass" only when credentials exist.
pub fn encode_greeting(offer_user_pass: bool, buf: &mut impl BufMut) {
    let methods: &[u8] = if offer_user_pass {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(methods.len() as u8);
    buf.put_slice(methods);
}

/// Returns the method chosen by the server.
pub fn decode_method_selection(buf: &mut impl Buf) -> Result<u8, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::TooShort);
    }
    let version = buf.get_u8();
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnexpectedVersion(version));
    }
    Ok(buf.get_u8())
}

/// RFC 1929 request: VER=0x01, ULEN, UNAME, PLEN, PASSWD.
pub fn encode_user_pass(
    username: &str,
    password: &str,
    buf: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    check_credentials(username, password)?;
    buf.put_u8(USER_PASS_VERSION);
    buf.put_u8(username.len() as u8);
    buf.put_slice(username.as_bytes());
    buf.put_u8(password.len() as u8);
    buf.put_slice(password.as_bytes());
    Ok(())
}

pub fn check_credentials(username: &str, password: &str) -> Result<(), ProtocolError> {
    if username.len() > MAX_FIELD_LEN || password.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::CredentialTooLong);
    }
    Ok(())
}

/// Returns true when the server accepted the credentials.
pub fn decode_user_pass_reply(buf: &mut impl Buf) -> Result<bool, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::TooShort);
    }
    let version = buf.get_u8();
    if version != USER_PASS_VERSION {
        return Err(ProtocolError::UnexpectedVersion(version));
    }
    Ok(buf.get_u8() == 0x00)
}

/// VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT
pub fn encode_request(command: Command, address: &Address, buf: &mut impl BufMut) {
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(command as u8);
    buf.put_u8(0x00);
    address.encode(buf);
}

/// Fixed part of a CONNECT / UDP ASSOCIATE reply: VER, REP, RSV, ATYP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub reply: Reply,
    pub atyp: u8,
}

impl ReplyHeader {
    pub const SIZE: usize = 4;

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < Self::SIZE {
            return Err(ProtocolError::TooShort);
        }
        let version = buf.get_u8();
        if version != SOCKS5_VERSION {
            return Err(ProtocolError::UnexpectedVersion(version));
        }
        let reply = Reply::from(buf.get_u8());
        let _reserved = buf.get_u8();
        let atyp = buf.get_u8();
        Ok(Self { reply, atyp })
    }
}

/// How many bytes of BND.ADDR/BND.PORT follow a reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundAddress {
    /// Address and port have a fixed width.
    Fixed(usize),
    /// A one-byte length prefix must be read first; see [`domain_bound_len`].
    LengthPrefixed,
}

impl BoundAddress {
    pub fn for_atyp(atyp: u8) -> Result<Self, ProtocolError> {
        match AddressType::try_from(atyp)? {
            AddressType::Ipv4 => Ok(BoundAddress::Fixed(4 + 2)),
            AddressType::Ipv6 => Ok(BoundAddress::Fixed(16 + 2)),
            AddressType::Domain => Ok(BoundAddress::LengthPrefixed),
        }
    }
}

/// Bytes remaining after the length prefix of a domain bound address.
pub fn domain_bound_len(prefix: u8) -> Result<usize, ProtocolError> {
    if prefix == 0 {
        return Err(ProtocolError::EmptyBoundDomain);
    }
    Ok(prefix as usize + 2)
}
