//! SOCKS4 / SOCKS5 handshake state machine
//!
//! ```text
//! VersionRead ──4──▶ request · username ──▶ reply(0x5A | 0x5B)
//!      │
//!      └─────5──▶ methods ──▶ request · address · port ──▶ reply(status)
//! ```
//!
//! Every rejection path sends its failure reply before returning.

use super::ProxyError;
use crate::transport::HostAddress;
use crate::{Error, Result};
use std::fmt;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use tracing::{debug, info};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

/// Longest SOCKS4 user id accepted before the request is considered garbage
const MAX_USERNAME_LEN: usize = 255;

/// SOCKS4 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Socks4Reply {
    Granted = 0x5A,
    Rejected = 0x5B,
}

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// Commands shared by both protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
}

/// SOCKS5 address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Protocol version a client spoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

impl fmt::Display for SocksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksVersion::V4 => write!(f, "SOCKSv4"),
            SocksVersion::V5 => write!(f, "SOCKSv5"),
        }
    }
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct Handshake<T> {
    pub version: SocksVersion,
    pub target: HostAddress,
    /// Whatever `connect` produced for `target`, normally the server socket
    pub server: T,
}

/// Run the handshake on `client`, calling `connect` for the requested target.
///
/// The success reply is only sent once `connect` has succeeded.
pub fn accept<S, T, F>(client: &mut S, connect: F) -> Result<Handshake<T>>
where
    S: Read + Write,
    F: FnOnce(&HostAddress) -> Result<T>,
{
    match read_u8(client)? {
        SOCKS4_VERSION => socks4(client, connect),
        SOCKS5_VERSION => socks5(client, connect),
        version => Err(ProxyError::InvalidSocksVersion(version).into()),
    }
}

fn socks4<S, T, F>(client: &mut S, connect: F) -> Result<Handshake<T>>
where
    S: Read + Write,
    F: FnOnce(&HostAddress) -> Result<T>,
{
    let mut request = [0u8; 7];
    read_exact(client, &mut request)?;
    let command = request[0];
    let port = u16::from_be_bytes([request[1], request[2]]);
    let ip = Ipv4Addr::new(request[3], request[4], request[5], request[6]);

    let username = read_string_z(client)?;
    if !username.is_empty() {
        info!("SOCKSv4: client sent username: {}", username);
    }

    let target = HostAddress::new(ip.to_string(), port);
    if command != Command::Connect as u8 {
        write_socks4_reply(client, Socks4Reply::Rejected)?;
        return Err(ProxyError::UnsupportedCommand {
            version: 4,
            command,
        }
        .into());
    }

    debug!("SOCKSv4 CONNECT to {}", target);
    match connect(&target) {
        Ok(server) => {
            write_socks4_reply(client, Socks4Reply::Granted)?;
            Ok(Handshake {
                version: SocksVersion::V4,
                target,
                server,
            })
        }
        Err(e) => {
            let _ = write_socks4_reply(client, Socks4Reply::Rejected);
            Err(ProxyError::TargetUnreachable {
                version: 4,
                target: target.to_string(),
                reason: e.to_string(),
            }
            .into())
        }
    }
}

fn socks5<S, T, F>(client: &mut S, connect: F) -> Result<Handshake<T>>
where
    S: Read + Write,
    F: FnOnce(&HostAddress) -> Result<T>,
{
    // Method negotiation
    let nmethods = read_u8(client)? as usize;
    let mut methods = vec![0u8; nmethods];
    read_exact(client, &mut methods)?;
    debug!("SOCKSv5: authentication methods: {:?}", methods);

    let method = if methods.contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    write_all(client, &[SOCKS5_VERSION, method as u8])?;
    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::NoAcceptableMethod.into());
    }

    // Request
    let mut head = [0u8; 4];
    read_exact(client, &mut head)?;
    let [version, command, _reserved, address_type] = head;
    if version != SOCKS5_VERSION {
        write_socks5_reply(client, Reply::GeneralFailure, 0)?;
        return Err(ProxyError::InvalidSocksVersion(version).into());
    }

    let host = if address_type == AddressType::Ipv4 as u8 {
        let mut octets = [0u8; 4];
        read_exact(client, &mut octets)?;
        Ipv4Addr::from(octets).to_string()
    } else if address_type == AddressType::Domain as u8 {
        let len = read_u8(client)? as usize;
        let mut name = vec![0u8; len];
        read_exact(client, &mut name)?;
        match String::from_utf8(name) {
            Ok(name) if !name.is_empty() => name,
            _ => {
                let port = read_port(client)?;
                write_socks5_reply(client, Reply::HostUnreachable, port)?;
                return Err(ProxyError::InvalidAddress {
                    version: 5,
                    reason: "malformed domain name".to_string(),
                }
                .into());
            }
        }
    } else {
        write_socks5_reply(client, Reply::AddressTypeNotSupported, 0)?;
        return Err(ProxyError::UnsupportedAddressType(address_type).into());
    };
    let port = read_port(client)?;
    let target = HostAddress::new(host, port);

    if command != Command::Connect as u8 {
        write_socks5_reply(client, Reply::CommandNotSupported, port)?;
        return Err(ProxyError::UnsupportedCommand {
            version: 5,
            command,
        }
        .into());
    }

    debug!("SOCKSv5 CONNECT to {}", target);
    match connect(&target) {
        Ok(server) => {
            write_socks5_reply(client, Reply::Succeeded, port)?;
            Ok(Handshake {
                version: SocksVersion::V5,
                target,
                server,
            })
        }
        Err(e) => {
            let status = match &e {
                Error::Transport { source, .. }
                    if source.kind() == std::io::ErrorKind::ConnectionRefused =>
                {
                    Reply::ConnectionRefused
                }
                _ => Reply::HostUnreachable,
            };
            let _ = write_socks5_reply(client, status, port);
            Err(ProxyError::TargetUnreachable {
                version: 5,
                target: target.to_string(),
                reason: e.to_string(),
            }
            .into())
        }
    }
}

/// SOCKS4 reply: null byte, status, six reserved zero bytes
fn write_socks4_reply<S: Write>(client: &mut S, status: Socks4Reply) -> Result<()> {
    let mut reply = [0u8; 8];
    reply[1] = status as u8;
    write_all(client, &reply)
}

/// SOCKS5 reply; the bound address is always 127.0.0.1 and the port echoes
/// the request since clients only look at the status.
fn write_socks5_reply<S: Write>(client: &mut S, status: Reply, port: u16) -> Result<()> {
    let mut reply = Vec::with_capacity(10);
    reply.extend_from_slice(&[SOCKS5_VERSION, status as u8, 0x00, AddressType::Ipv4 as u8]);
    reply.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
    reply.extend_from_slice(&port.to_be_bytes());
    write_all(client, &reply)
}

fn read_exact<S: Read>(client: &mut S, buf: &mut [u8]) -> Result<()> {
    client
        .read_exact(buf)
        .map_err(Error::transport("reading SOCKS request"))
}

fn read_u8<S: Read>(client: &mut S) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(client, &mut buf)?;
    Ok(buf[0])
}

fn read_port<S: Read>(client: &mut S) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(client, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Read a NUL-terminated string
fn read_string_z<S: Read>(client: &mut S) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        match read_u8(client)? {
            0 => break,
            _ if bytes.len() >= MAX_USERNAME_LEN => {
                return Err(ProxyError::InvalidAddress {
                    version: 4,
                    reason: "user id is not terminated".to_string(),
                }
                .into())
            }
            byte => bytes.push(byte),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_all<S: Write>(client: &mut S, data: &[u8]) -> Result<()> {
    client
        .write_all(data)
        .map_err(Error::transport("writing SOCKS reply"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Scripted client: reads come from `input`, writes land in `output`
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Script {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn recording_connect(seen: &mut Option<HostAddress>) -> impl FnOnce(&HostAddress) -> Result<()> + '_ {
        move |target| {
            *seen = Some(target.clone());
            Ok(())
        }
    }

    fn refusing_connect(target: &HostAddress) -> Result<()> {
        Err(Error::HostUnreachable(target.to_string()))
    }

    #[test]
    fn test_socks4_connect() {
        let mut client = Script::new(&[0x04, 0x01, 0x1F, 0x90, 0x7F, 0x00, 0x00, 0x01, 0x00]);
        let mut seen = None;

        let handshake = accept(&mut client, recording_connect(&mut seen)).unwrap();

        assert_eq!(handshake.version, SocksVersion::V4);
        assert_eq!(seen, Some(HostAddress::new("127.0.0.1", 8080)));
        assert_eq!(client.output, [0x00, 0x5A, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_socks4_username_is_discarded() {
        let mut request = vec![0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1];
        request.extend_from_slice(b"alice\0");
        let mut client = Script::new(&request);
        let mut seen = None;

        let handshake = accept(&mut client, recording_connect(&mut seen)).unwrap();
        assert_eq!(handshake.target, HostAddress::new("10.0.0.1", 80));
    }

    #[test]
    fn test_socks4_bind_is_rejected() {
        let mut client = Script::new(&[0x04, 0x02, 0x00, 0x50, 10, 0, 0, 1, 0x00]);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();

        assert!(matches!(
            err,
            Error::ProtocolMismatch(ProxyError::UnsupportedCommand { version: 4, command: 2 })
        ));
        assert_eq!(seen, None);
        assert_eq!(client.output, [0x00, 0x5B, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_socks4_unreachable_target() {
        let mut client = Script::new(&[0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1, 0x00]);
        let err = accept(&mut client, refusing_connect).unwrap_err();

        assert!(matches!(err, Error::ProtocolMismatch(ProxyError::TargetUnreachable { .. })));
        assert_eq!(client.output[1], 0x5B);
    }

    #[test]
    fn test_socks5_domain_connect() {
        let mut request = vec![0x05, 0x02, 0x02, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        let mut client = Script::new(&request);
        let mut seen = None;

        let handshake = accept(&mut client, recording_connect(&mut seen)).unwrap();

        assert_eq!(handshake.version, SocksVersion::V5);
        assert_eq!(seen, Some(HostAddress::new("example.com", 443)));
        assert_eq!(
            client.output,
            [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x01, 0xBB]
        );
    }

    #[test]
    fn test_socks5_ipv4_connect() {
        let request = [0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 192, 168, 1, 2, 0x00, 0x16];
        let mut client = Script::new(&request);
        let mut seen = None;

        accept(&mut client, recording_connect(&mut seen)).unwrap();
        assert_eq!(seen, Some(HostAddress::new("192.168.1.2", 22)));
    }

    #[test]
    fn test_socks5_requires_no_auth_method() {
        let mut client = Script::new(&[0x05, 0x01, 0x02]);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();

        assert!(matches!(err, Error::ProtocolMismatch(ProxyError::NoAcceptableMethod)));
        assert_eq!(client.output, [0x05, 0xFF]);
    }

    #[test]
    fn test_socks5_ipv6_address_rejected() {
        let mut client = Script::new(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04]);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();

        assert!(matches!(
            err,
            Error::ProtocolMismatch(ProxyError::UnsupportedAddressType(4))
        ));
        assert_eq!(&client.output[2..4], [0x05, 0x08]);
        assert_eq!(seen, None);
    }

    #[test]
    fn test_socks5_udp_associate_rejected() {
        let request = [0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let mut client = Script::new(&request);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();

        assert!(matches!(
            err,
            Error::ProtocolMismatch(ProxyError::UnsupportedCommand { version: 5, command: 3 })
        ));
        assert_eq!(&client.output[2..4], [0x05, 0x07]);
    }

    #[test]
    fn test_socks5_unreachable_target() {
        let request = [0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80];
        let mut client = Script::new(&request);

        let err = accept(&mut client, refusing_connect).unwrap_err();

        assert!(matches!(err, Error::ProtocolMismatch(ProxyError::TargetUnreachable { .. })));
        assert_eq!(&client.output[2..4], [0x05, 0x04]);
    }

    #[test]
    fn test_unknown_version() {
        let mut client = Script::new(&[0x47, 0x45, 0x54]);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(ProxyError::InvalidSocksVersion(0x47))));
        assert!(client.output.is_empty());
    }

    #[test]
    fn test_truncated_request_is_transport_error() {
        let mut client = Script::new(&[0x04, 0x01, 0x00]);
        let mut seen = None;

        let err = accept(&mut client, recording_connect(&mut seen)).unwrap_err();
        assert!(matches!(err, Error::Transport { stage: "reading SOCKS request", .. }));
    }
}
