//! HTTP addresses and correlation URLs.
//!
//! Binary form: options (u32 BE) + url bytes + NUL.
//! Text form: `<proto>.<options>.<url without scheme>`, e.g. `http.0.10.0.0.1:8080/`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

/// Address of a peer's HTTP endpoint. `url` always carries its scheme and ends with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HttpAddress {
    pub options: u32,
    url: String,
}

impl HttpAddress {
    /// Build from a full URL (`http://host:port/path`). A trailing `/` is added if missing.
    pub fn from_url(url: &str, options: u32) -> Result<Self, AddressError> {
        let (scheme, rest) = url.split_once("://").ok_or(AddressError::MissingScheme)?;
        Protocol::from_str(scheme).ok_or_else(|| AddressError::UnknownProtocol(scheme.into()))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(AddressError::MissingHost);
        }
        let mut url = url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        Ok(Self { options, url })
    }

    /// Address of an inbound connection's remote end.
    pub fn from_socket(protocol: Protocol, addr: SocketAddr) -> Self {
        Self {
            options: 0,
            url: format!("{}://{}/", protocol.as_str(), addr),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        if self.url.starts_with("https://") {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    /// `host[:port]` part.
    pub fn authority(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(&self.url);
        rest.split('/').next().unwrap_or(rest)
    }

    /// Socket address when the host part is an IP literal; `None` for host names.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let authority = self.authority();
        if let Ok(sa) = authority.parse::<SocketAddr>() {
            return Some(sa);
        }
        let host = authority.trim_start_matches('[').trim_end_matches(']');
        host.parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.protocol().default_port()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.url.len() + 1);
        out.extend_from_slice(&self.options.to_be_bytes());
        out.extend_from_slice(self.url.as_bytes());
        out.push(0);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() < 5 {
            return Err(AddressError::Truncated);
        }
        let options = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let (last, body) = bytes[4..].split_last().ok_or(AddressError::Truncated)?;
        if *last != 0 {
            return Err(AddressError::MissingTerminator);
        }
        let url = std::str::from_utf8(body).map_err(|_| AddressError::NotUtf8)?;
        Self::from_url(url, options)
    }

    /// Parse the text form produced by `Display`.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let (proto, rest) = text.split_once('.').ok_or(AddressError::Malformed)?;
        let protocol =
            Protocol::from_str(proto).ok_or_else(|| AddressError::UnknownProtocol(proto.into()))?;
        let (options, url) = rest.split_once('.').ok_or(AddressError::Malformed)?;
        let options: u32 = options.parse().map_err(|_| AddressError::Malformed)?;
        Self::from_url(&format!("{}://{}", protocol.as_str(), url), options)
    }
}

impl fmt::Display for HttpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rest = self.url.split_once("://").map(|(_, r)| r).unwrap_or("");
        write!(f, "{}.{}.{}", self.protocol().as_str(), self.options, rest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("url has no scheme")]
    MissingScheme,
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("url has no host")]
    MissingHost,
    #[error("address buffer truncated")]
    Truncated,
    #[error("address buffer not NUL-terminated")]
    MissingTerminator,
    #[error("address url is not UTF-8")]
    NotUtf8,
    #[error("malformed address string")]
    Malformed,
}

/// URL the originating side opens for a session: `{base}{own peer};{tag}`.
pub fn correlation_url(base: &HttpAddress, own: &PeerId, tag: u32) -> String {
    format!("{}{};{}", base.url(), own, tag)
}

/// Extract `(peer, tag)` from an inbound request URL of the form `[prefix/]peer;tag`.
pub fn parse_correlation(url: &str) -> Result<(PeerId, u32), CorrelationError> {
    let sep = url.rfind(';').ok_or(CorrelationError::MissingSeparator)?;
    let tag_str = &url[sep + 1..];
    if tag_str.is_empty() {
        return Err(CorrelationError::MissingTag);
    }
    if !tag_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CorrelationError::InvalidTag);
    }
    let digits = tag_str.trim_start_matches('0');
    if digits.is_empty() {
        return Err(CorrelationError::ZeroTag);
    }
    // All digits, so the only parse failure left is overflow.
    let tag: u32 = digits.parse().map_err(|_| CorrelationError::TagOutOfRange)?;
    let head = &url[..sep];
    let start = head.rfind('/').map(|i| i + 1).unwrap_or(0);
    let peer = head[start..].parse::<PeerId>()?;
    Ok((peer, tag))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("no `;` separator")]
    MissingSeparator,
    #[error("no tag after separator")]
    MissingTag,
    #[error("tag is not a decimal number")]
    InvalidTag,
    #[error("tag must be non-zero")]
    ZeroTag,
    #[error("tag does not fit in 32 bits")]
    TagOutOfRange,
    #[error("bad peer id: {0}")]
    Peer(#[from] PeerIdParseError),
}
