//! SOCKS5 handshake (RFC 1928, no-authentication only) expressed as four compiled schemas.
//!
//! The proxy binary drives a connection with [`accept_handshake`] and [`send_reply`];
//! [`connect_through`] is the matching client side. Every message goes through
//! [`Schema::parse`] or [`Schema::to_bytes`]; replies are buffered and written whole.

use crate::codec::CodecError;
use crate::field::{Encoding, Endianness, StringWidth, Width};
use crate::schema::{Case, Config, Kind, Schema, SchemaBuilder, SchemaError};
use crate::value::{value_map, Value, ValueMap};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::debug;

pub const VERSION: u64 = 5;

pub const METHOD_NO_AUTHENTICATION: u64 = 0;
pub const METHOD_USERNAME_PASSWORD: u64 = 2;
pub const METHOD_NO_ACCEPTABLE: u64 = 0xff;

pub const COMMAND_CONNECT: u64 = 1;

pub const ATYP_IPV4: u64 = 1;
pub const ATYP_DOMAIN: u64 = 3;
pub const ATYP_IPV6: u64 = 4;

pub const REPLY_SUCCEEDED: u64 = 0;
pub const REPLY_GENERAL_FAILURE: u64 = 1;
pub const REPLY_HOST_UNREACHABLE: u64 = 4;
pub const REPLY_COMMAND_NOT_SUPPORTED: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported SOCKS version {0}")]
    UnsupportedVersion(u64),
    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported command {0}")]
    UnsupportedCommand(u64),
    #[error("server refused the request with reply code {0}")]
    Refused(u64),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

/// The four message layouts, compiled once and shared by every connection.
#[derive(Debug, Clone)]
pub struct Socks5Schemas {
    /// `version, methods_length, methods[methods_length]`
    pub client_handshake: Arc<Schema>,
    /// `version, method`
    pub server_handshake: Arc<Schema>,
    /// `version, command, reserved, address_type, address(union), port(be16)`
    pub client_request: Arc<Schema>,
    /// `version, reply, reserved, address_type, address[4], port(be16)`
    pub server_response: Arc<Schema>,
}

impl Socks5Schemas {
    pub fn new() -> Result<Self, SchemaError> {
        let client_handshake = SchemaBuilder::new()
            .integer("version", 1)
            .integer("methods_length", 1)
            .array("methods", "methods_length", Kind::Integer, Config::Width(Width::Fixed(1)))
            .build()?;
        let server_handshake = SchemaBuilder::new()
            .integer("version", 1)
            .integer("method", 1)
            .build()?;
        let address_cases = vec![
            Case::new(ATYP_IPV4, Kind::Bytes, Config::Width(Width::Fixed(4))).with_transform(|v| {
                let octets = v.as_bytes().and_then(|b| <[u8; 4]>::try_from(b).ok());
                match octets {
                    Some(octets) => Value::Text(Ipv4Addr::from(octets).to_string()),
                    None => v,
                }
            }),
            Case::new(
                ATYP_DOMAIN,
                Kind::String,
                Config::Text(StringWidth::LengthPrefixed, Encoding::Ascii),
            ),
            Case::new(ATYP_IPV6, Kind::Bytes, Config::Width(Width::Fixed(16))).with_transform(|v| {
                let octets = v.as_bytes().and_then(|b| <[u8; 16]>::try_from(b).ok());
                match octets {
                    Some(octets) => Value::Text(Ipv6Addr::from(octets).to_string()),
                    None => v,
                }
            }),
        ];
        let client_request = SchemaBuilder::new()
            .integer("version", 1)
            .integer("command", 1)
            .integer("reserved", 1)
            .integer("address_type", 1)
            .union("address", "address_type", address_cases)
            .integer_endian("port", Endianness::Network, 2)
            .build()?;
        let server_response = SchemaBuilder::new()
            .integer("version", 1)
            .integer("reply", 1)
            .integer("reserved", 1)
            .integer("address_type", 1)
            .bytes("address", 4)
            .integer_endian("port", Endianness::Network, 2)
            .build()?;
        Ok(Socks5Schemas {
            client_handshake: Arc::new(client_handshake),
            server_handshake: Arc::new(server_handshake),
            client_request: Arc::new(client_request),
            server_response: Arc::new(server_response),
        })
    }
}

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u64,
    /// Dotted IPv4, IPv6 text, or a domain name.
    pub host: String,
    pub port: u16,
}

/// Server side: negotiate the method and read the request. On an unsupported command the
/// matching failure reply is sent before the error is returned.
pub fn accept_handshake<S: Read + Write>(
    schemas: &Socks5Schemas,
    stream: &mut S,
) -> Result<Request, HandshakeError> {
    let hello = schemas.client_handshake.parse(stream)?;
    check_version(&hello)?;
    let offered = hello
        .get("methods")
        .and_then(Value::as_array)
        .ok_or(HandshakeError::Malformed("methods"))?;
    let acceptable = offered
        .iter()
        .any(|m| m.as_u64() == Some(METHOD_NO_AUTHENTICATION));
    let method = if acceptable {
        METHOD_NO_AUTHENTICATION
    } else {
        METHOD_NO_ACCEPTABLE
    };
    let choice = value_map([("version", Value::Int(VERSION)), ("method", Value::Int(method))]);
    stream.write_all(&schemas.server_handshake.to_bytes(&choice)?)?;
    if !acceptable {
        return Err(HandshakeError::NoAcceptableMethod);
    }

    let request = schemas.client_request.parse(stream)?;
    check_version(&request)?;
    let command = int_field(&request, "command")?;
    if command != COMMAND_CONNECT {
        send_reply(
            schemas,
            stream,
            REPLY_COMMAND_NOT_SUPPORTED,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        )?;
        return Err(HandshakeError::UnsupportedCommand(command));
    }
    let host = request
        .get("address")
        .and_then(Value::as_str)
        .ok_or(HandshakeError::Malformed("address"))?
        .to_string();
    let port = u16::try_from(int_field(&request, "port")?).map_err(|_| HandshakeError::Malformed("port"))?;
    debug!(%host, port, "SOCKS5 request");
    Ok(Request { command, host, port })
}

/// Send the final server response carrying the bound IPv4 address.
pub fn send_reply<W: Write>(
    schemas: &Socks5Schemas,
    stream: &mut W,
    reply: u64,
    bound: SocketAddrV4,
) -> Result<(), HandshakeError> {
    let response = value_map([
        ("version", Value::Int(VERSION)),
        ("reply", Value::Int(reply)),
        ("reserved", Value::Int(0)),
        ("address_type", Value::Int(ATYP_IPV4)),
        ("address", Value::Bytes(bound.ip().octets().to_vec())),
        ("port", Value::Int(bound.port() as u64)),
    ]);
    stream.write_all(&schemas.server_response.to_bytes(&response)?)?;
    Ok(())
}

/// Client side: offer no-authentication, request a CONNECT to `host:port` and return the
/// server's response on success.
pub fn connect_through<S: Read + Write>(
    schemas: &Socks5Schemas,
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<ValueMap, HandshakeError> {
    let hello = value_map([
        ("version", Value::Int(VERSION)),
        ("methods_length", Value::Int(1)),
        ("methods", Value::Array(vec![Value::Int(METHOD_NO_AUTHENTICATION)])),
    ]);
    stream.write_all(&schemas.client_handshake.to_bytes(&hello)?)?;
    let choice = schemas.server_handshake.parse(stream)?;
    check_version(&choice)?;
    if int_field(&choice, "method")? != METHOD_NO_AUTHENTICATION {
        return Err(HandshakeError::NoAcceptableMethod);
    }

    let (address_type, address) = if let Ok(ip) = host.parse::<Ipv4Addr>() {
        (ATYP_IPV4, Value::Bytes(ip.octets().to_vec()))
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        (ATYP_IPV6, Value::Bytes(ip.octets().to_vec()))
    } else {
        (ATYP_DOMAIN, Value::Text(host.to_string()))
    };
    let request = value_map([
        ("version", Value::Int(VERSION)),
        ("command", Value::Int(COMMAND_CONNECT)),
        ("reserved", Value::Int(0)),
        ("address_type", Value::Int(address_type)),
        ("address", address),
        ("port", Value::Int(port as u64)),
    ]);
    stream.write_all(&schemas.client_request.to_bytes(&request)?)?;

    let response = schemas.server_response.parse(stream)?;
    check_version(&response)?;
    match int_field(&response, "reply")? {
        REPLY_SUCCEEDED => Ok(response),
        code => Err(HandshakeError::Refused(code)),
    }
}

fn int_field(values: &ValueMap, name: &'static str) -> Result<u64, HandshakeError> {
    values
        .get(name)
        .and_then(Value::as_u64)
        .ok_or(HandshakeError::Malformed(name))
}

fn check_version(values: &ValueMap) -> Result<(), HandshakeError> {
    match int_field(values, "version")? {
        VERSION => Ok(()),
        v => Err(HandshakeError::UnsupportedVersion(v)),
    }
}
