//! Network classification of session addresses.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::address::HttpAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Unspecified,
    Loopback,
    Lan,
    Wan,
    Wlan,
    Bt,
}

/// Default classifier. Host names (no IP literal) are assumed to be external.
pub fn classify(address: &HttpAddress) -> NetworkType {
    match address.socket_addr() {
        Some(sa) => classify_ip(sa.ip()),
        None => NetworkType::Wan,
    }
}

pub fn classify_ip(ip: IpAddr) -> NetworkType {
    if ip.is_unspecified() {
        return NetworkType::Unspecified;
    }
    if ip.is_loopback() {
        return NetworkType::Loopback;
    }
    let lan = match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique-local, fe80::/10 link-local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    };
    if lan {
        NetworkType::Lan
    } else {
        NetworkType::Wan
    }
}
