//! Canonical peer priority (BEP 40).
//!
//! Candidate peers are ranked by a CRC32C over the masked pair of client and
//! peer addresses. The mask keeps the shared prefix of the two addresses and
//! dampens the rest with `0x55`, so that peers close to us rank consistently
//! on both sides of the connection.

use std::net::{SocketAddrV4, SocketAddrV6};

/// The priority of a connection between two IPv4 endpoints.
pub(crate) fn priority4(client: &SocketAddrV4, peer: &SocketAddrV4) -> u32 {
    if client.ip() == peer.ip() {
        return crc32c::crc32c(&port_bytes(client.port(), peer.port()));
    }

    let a = client.ip().octets();
    let b = peer.ip().octets();

    // keep the longest shared prefix (at least the /16) unmasked
    let mut size = 2;
    for i in (2..=4).rev() {
        if a[..i] == b[..i] {
            size = i + 1;
            break;
        }
    }

    let ma = mask(a, size);
    let mb = mask(b, size);

    let mut bytes = [0u8; 8];
    if ma <= mb {
        bytes[..4].copy_from_slice(&ma);
        bytes[4..].copy_from_slice(&mb);
    } else {
        bytes[..4].copy_from_slice(&mb);
        bytes[4..].copy_from_slice(&ma);
    }
    crc32c::crc32c(&bytes)
}

/// The priority of a connection between two IPv6 endpoints. Masking works at
/// byte pair granularity.
pub(crate) fn priority6(client: &SocketAddrV6, peer: &SocketAddrV6) -> u32 {
    if client.ip() == peer.ip() {
        return crc32c::crc32c(&port_bytes(client.port(), peer.port()));
    }

    let a = client.ip().octets();
    let b = peer.ip().octets();

    let mut size = 6;
    for i in (6..=14).rev().step_by(2) {
        if a[..i] == b[..i] {
            size = i + 2;
            break;
        }
    }

    let ma = mask(a, size);
    let mb = mask(b, size);

    let mut bytes = [0u8; 32];
    if ma <= mb {
        bytes[..16].copy_from_slice(&ma);
        bytes[16..].copy_from_slice(&mb);
    } else {
        bytes[..16].copy_from_slice(&mb);
        bytes[16..].copy_from_slice(&ma);
    }
    crc32c::crc32c(&bytes)
}

/// The fallback used when the local address is not known: a keyed checksum
/// of the peer address alone. The key is random per engine start, so the
/// ranking is still stable within a session.
pub(crate) fn simple_priority(key: &[u8], addr: &str) -> u32 {
    let mut bytes = Vec::with_capacity(key.len() + addr.len());
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(addr.as_bytes());
    crc32c::crc32c(&bytes)
}

fn mask<const N: usize>(mut addr: [u8; N], from: usize) -> [u8; N] {
    for b in addr.iter_mut().skip(from) {
        *b &= 0x55;
    }
    addr
}

fn port_bytes(a: u16, b: u16) -> [u8; 4] {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let mut bytes = [0u8; 4];
    bytes[..2].copy_from_slice(&lo.to_be_bytes());
    bytes[2..].copy_from_slice(&hi.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn v6(ip: &str) -> SocketAddrV6 {
        SocketAddrV6::new(ip.parse().unwrap(), 0, 0, 0)
    }

    #[test]
    fn test_crc32c_fixtures() {
        assert_eq!(
            crc32c::crc32c(&hex::decode("624C14007BD50000").unwrap()),
            0xec2d7224
        );
        assert_eq!(
            crc32c::crc32c(&hex::decode("7BD5200A7BD520EA").unwrap()),
            0x99568189
        );
    }

    #[test]
    fn test_priority4_fixtures() {
        assert_eq!(
            priority4(&v4("123.213.32.10:0"), &v4("98.76.54.32:0")),
            0xec2d7224
        );
        assert_eq!(
            priority4(&v4("123.213.32.10:0"), &v4("123.213.32.234:0")),
            0x99568189
        );
        assert_eq!(
            priority4(&v4("206.248.98.111:0"), &v4("142.147.89.224:0")),
            0x2b41d456
        );
    }

    #[test]
    fn test_priority4_is_symmetric() {
        let a = v4("123.213.32.10:0");
        let b = v4("98.76.54.32:0");
        assert_eq!(priority4(&a, &b), priority4(&b, &a));

        let c = v4("123.213.32.234:0");
        assert_eq!(priority4(&a, &c), priority4(&c, &a));
    }

    #[test]
    fn test_priority4_same_addr_uses_ports() {
        let a = v4("1.2.3.4:1000");
        let b = v4("1.2.3.4:2000");
        let expected = crc32c::crc32c(&[0x03, 0xe8, 0x07, 0xd0]);
        assert_eq!(priority4(&a, &b), expected);
        assert_eq!(priority4(&b, &a), expected);
    }

    #[test]
    fn test_priority6_fixture() {
        assert_eq!(
            priority6(
                &v6("2015:7693:6cd9:a56a:e47f:7101:483e:800a"),
                &v6("b1fa:9ff2:fbdc:23b9:3618:332c:216c:5b4a"),
            ),
            0xfbd26e29
        );
    }

    #[test]
    fn test_priority6_is_symmetric() {
        let a = v6("2015:7693:6cd9:a56a:e47f:7101:483e:800a");
        let b = v6("b1fa:9ff2:fbdc:23b9:3618:332c:216c:5b4a");
        assert_eq!(priority6(&a, &b), priority6(&b, &a));
    }

    #[test]
    fn test_simple_priority_is_keyed() {
        let addr = "1.2.3.4:5000";
        assert_eq!(
            simple_priority(b"key", addr),
            simple_priority(b"key", addr)
        );
        assert_ne!(
            simple_priority(b"key", addr),
            simple_priority(b"other", addr)
        );
    }
}
