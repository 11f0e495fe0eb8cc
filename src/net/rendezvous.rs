//! Direct rendezvous entry points
//!
//! Three ways to reach a peer without a shared room: typing an access code,
//! scanning a QR payload, and entering a LAN IPv4 address. Each validates
//! its input and, on success, registers a synthesized connection keyed by
//! the channel prefix (`TOKEN-`, `QR-`, `LAN-`). Invalid input registers
//! nothing and surfaces a typed error.
//!
//! QR payloads are recognized in precedence order: a URL carrying
//! `?t=<token>&p=<peer>`, then a JSON object, then a bare 12-character
//! token. A JSON payload with a token routes through the token path even
//! when it also names a peer; `QR-{peer}` is synthesized only for JSON that
//! identifies a peer without a token.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{info, instrument};

use crate::net::connection::{ChannelKind, Connection, ConnectionRegistry, DiscoveredPeer};
use crate::net::identity::{normalize_token, PeerIdentity};

/// Display name for a QR-scanned peer that did not send one.
const QR_FALLBACK_NAME: &str = "QR scanned device";

/// Rendezvous input errors. Validation failures leave the registry alone.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RendezvousError {
    /// Input did not normalize to a valid access code.
    #[error("access code must be 12 letters or digits")]
    InvalidToken,

    /// Scanned text is neither a rendezvous URL, a JSON payload, nor a
    /// bare access code.
    #[error("scanned data is not a recognized payload")]
    UnrecognizedPayload,

    /// Not a dotted-quad IPv4 address with octets 0 through 255.
    #[error("not a valid lan ip address")]
    InvalidAddress,
}

/// What a QR scan decoded to.
#[derive(Debug, Clone, PartialEq)]
pub enum QrPayload {
    /// A normalized access code (URL, JSON, or bare form).
    Token(String),
    /// Peer identity without a token (JSON form only).
    Peer(DiscoveredPeer),
}

/// Connects by access code. Formatted (`ABCD-EFGH-2345`) and bare inputs
/// synthesize the same `TOKEN-` connection id.
#[instrument(skip(identity, registry))]
pub fn connect_with_token(
    identity: &PeerIdentity,
    registry: &ConnectionRegistry,
    raw: &str,
) -> Result<Connection, RendezvousError> {
    let token = normalize_token(raw).map_err(|_| RendezvousError::InvalidToken)?;
    let connection = Connection::for_token(&token, &identity.as_peer());
    registry.insert(connection.clone());
    info!(connection = %connection.id, "Connected by access code");
    Ok(connection)
}

/// Decodes scanned QR text into a [`QrPayload`].
pub fn parse_qr(text: &str) -> Result<QrPayload, RendezvousError> {
    let trimmed = text.trim();

    if trimmed.contains("?t=") {
        return parse_rendezvous_url(trimmed);
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return parse_qr_json(value);
    }

    // Bare token form.
    normalize_token(trimmed)
        .map(QrPayload::Token)
        .map_err(|_| RendezvousError::UnrecognizedPayload)
}

fn parse_rendezvous_url(text: &str) -> Result<QrPayload, RendezvousError> {
    let uri: http::Uri = text
        .parse()
        .map_err(|_| RendezvousError::UnrecognizedPayload)?;
    if uri.scheme().is_none() {
        return Err(RendezvousError::UnrecognizedPayload);
    }

    let query = uri.query().unwrap_or("");
    let mut token = None;
    let mut peer = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("t", value)) if !value.is_empty() => token = Some(value),
            Some(("p", value)) if !value.is_empty() => peer = Some(value),
            _ => {}
        }
    }

    // The URL form must name both ends.
    match (token, peer) {
        (Some(t), Some(_)) => normalize_token(t)
            .map(QrPayload::Token)
            .map_err(|_| RendezvousError::InvalidToken),
        _ => Err(RendezvousError::UnrecognizedPayload),
    }
}

fn parse_qr_json(value: serde_json::Value) -> Result<QrPayload, RendezvousError> {
    if let Some(token) = value.get("token").and_then(|t| t.as_str()) {
        if !token.trim().is_empty() {
            return normalize_token(token)
                .map(QrPayload::Token)
                .map_err(|_| RendezvousError::InvalidToken);
        }
    }

    match serde_json::from_value::<DiscoveredPeer>(value) {
        Ok(peer) if !peer.peer_id.trim().is_empty() => Ok(QrPayload::Peer(peer)),
        _ => Err(RendezvousError::UnrecognizedPayload),
    }
}

/// Connects from scanned QR text. Token-bearing forms reuse the access-code
/// path; a peer-only JSON payload synthesizes `QR-{peer}` directly.
#[instrument(skip(identity, registry, text))]
pub fn connect_with_qr(
    identity: &PeerIdentity,
    registry: &ConnectionRegistry,
    text: &str,
) -> Result<Connection, RendezvousError> {
    match parse_qr(text)? {
        QrPayload::Token(token) => connect_with_token(identity, registry, &token),
        QrPayload::Peer(mut peer) => {
            if peer.name.trim().is_empty() {
                peer.name = QR_FALLBACK_NAME.to_string();
            }
            let connection = Connection::from_peer(ChannelKind::Qr, &peer);
            registry.insert(connection.clone());
            info!(connection = %connection.id, "Connected from QR payload");
            Ok(connection)
        }
    }
}

/// Validates a dotted-quad IPv4 address the way a user types one: exactly
/// four numeric segments of one to three digits, each 0 through 255.
/// Leading zeros are tolerated and canonicalized.
pub fn parse_lan_ip(raw: &str) -> Result<Ipv4Addr, RendezvousError> {
    let parts: Vec<&str> = raw.trim().split('.').collect();
    if parts.len() != 4 {
        return Err(RendezvousError::InvalidAddress);
    }

    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RendezvousError::InvalidAddress);
        }
        let value: u16 = part.parse().map_err(|_| RendezvousError::InvalidAddress)?;
        if value > 255 {
            return Err(RendezvousError::InvalidAddress);
        }
        *slot = value as u8;
    }
    Ok(Ipv4Addr::from(octets))
}

/// Connects to a typed LAN address, registering `LAN-{a-b-c-d}` named by
/// the address itself.
#[instrument(skip(identity, registry))]
pub fn connect_with_lan_ip(
    identity: &PeerIdentity,
    registry: &ConnectionRegistry,
    raw: &str,
) -> Result<Connection, RendezvousError> {
    let addr = parse_lan_ip(raw)?;
    let connection = Connection::for_lan(addr, &identity.as_peer());
    registry.insert(connection.clone());
    info!(connection = %connection.id, "Connected by lan address");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::DeviceClass;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            id: "localpeer0001".to_string(),
            token: "ZZZZYYYYXXXX".to_string(),
            name: "Local Box".to_string(),
            device_class: DeviceClass::Desktop,
            browser_name: "PeerDrop".to_string(),
            os_name: "Linux".to_string(),
        }
    }

    mod token_tests {
        use super::*;

        #[test]
        fn formatted_and_bare_inputs_share_an_id() {
            let me = identity();
            let registry = ConnectionRegistry::new();

            let formatted = connect_with_token(&me, &registry, "ABCD-EFGH-2345").unwrap();
            let bare = connect_with_token(&me, &registry, "abcdefgh2345").unwrap();

            assert_eq!(formatted.id, "TOKEN-ABCDEFGH2345");
            assert_eq!(formatted.id, bare.id);
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn invalid_code_registers_nothing() {
            let me = identity();
            let registry = ConnectionRegistry::new();

            assert_eq!(
                connect_with_token(&me, &registry, "TOO-SHORT").unwrap_err(),
                RendezvousError::InvalidToken
            );
            assert!(registry.is_empty());
        }

        #[test]
        fn token_connection_shape() {
            let me = identity();
            let registry = ConnectionRegistry::new();
            let conn = connect_with_token(&me, &registry, "ABCDEFGH2345").unwrap();

            assert_eq!(conn.channel, ChannelKind::Token);
            assert_eq!(&*conn.name, "Access code peer");
            assert!(conn.encrypted);
        }
    }

    mod qr_parse_tests {
        use super::*;

        #[test]
        fn url_form_requires_both_params() {
            let payload =
                parse_qr("https://drop.example/join?t=ABCD-EFGH-2345&p=peer123").unwrap();
            assert_eq!(payload, QrPayload::Token("ABCDEFGH2345".to_string()));

            assert_eq!(
                parse_qr("https://drop.example/join?t=ABCDEFGH2345").unwrap_err(),
                RendezvousError::UnrecognizedPayload
            );
        }

        #[test]
        fn url_form_needs_a_scheme() {
            assert_eq!(
                parse_qr("join?t=ABCDEFGH2345&p=x").unwrap_err(),
                RendezvousError::UnrecognizedPayload
            );
        }

        #[test]
        fn json_with_token_wins_over_peer_id() {
            let payload =
                parse_qr(r#"{"token":"ABCDEFGH2345","peerId":"peer123"}"#).unwrap();
            assert_eq!(payload, QrPayload::Token("ABCDEFGH2345".to_string()));
        }

        #[test]
        fn json_with_peer_only_yields_peer_payload() {
            let payload = parse_qr(
                r#"{"peerId":"peer123","name":"Scanner","deviceType":"mobile","browser":"B","os":"O"}"#,
            )
            .unwrap();
            match payload {
                QrPayload::Peer(peer) => {
                    assert_eq!(peer.peer_id, "peer123");
                    assert_eq!(peer.device_class, DeviceClass::Mobile);
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        #[test]
        fn json_with_neither_is_unrecognized() {
            assert_eq!(
                parse_qr(r#"{"name":"nobody"}"#).unwrap_err(),
                RendezvousError::UnrecognizedPayload
            );
        }

        #[test]
        fn bare_token_accepts_loose_formatting() {
            assert_eq!(
                parse_qr(" abcd-efgh-2345 ").unwrap(),
                QrPayload::Token("ABCDEFGH2345".to_string())
            );
        }

        #[test]
        fn garbage_is_unrecognized() {
            assert_eq!(
                parse_qr("hello world").unwrap_err(),
                RendezvousError::UnrecognizedPayload
            );
        }

        #[test]
        fn bad_token_inside_a_valid_form_is_invalid_token() {
            assert_eq!(
                parse_qr(r#"{"token":"SHORT"}"#).unwrap_err(),
                RendezvousError::InvalidToken
            );
            assert_eq!(
                parse_qr("https://x.example/j?t=IL0O&p=peer").unwrap_err(),
                RendezvousError::InvalidToken
            );
        }
    }

    mod qr_connect_tests {
        use super::*;

        #[test]
        fn token_bearing_payload_routes_to_the_token_path() {
            let me = identity();
            let registry = ConnectionRegistry::new();
            let conn = connect_with_qr(
                &me,
                &registry,
                r#"{"token":"ABCDEFGH2345","peerId":"peer123"}"#,
            )
            .unwrap();
            assert_eq!(conn.id, "TOKEN-ABCDEFGH2345");
        }

        #[test]
        fn peer_payload_synthesizes_qr_id() {
            let me = identity();
            let registry = ConnectionRegistry::new();
            let conn = connect_with_qr(
                &me,
                &registry,
                r#"{"peerId":"peer123","name":"Scanner"}"#,
            )
            .unwrap();
            assert_eq!(conn.id, "QR-peer123");
            assert_eq!(&*conn.name, "Scanner");
            assert_eq!(conn.channel, ChannelKind::Qr);
        }

        #[test]
        fn nameless_peer_gets_the_fallback_label() {
            let me = identity();
            let registry = ConnectionRegistry::new();
            let conn =
                connect_with_qr(&me, &registry, r#"{"peerId":"peer123"}"#).unwrap();
            assert_eq!(&*conn.name, "QR scanned device");
        }
    }

    mod lan_tests {
        use super::*;

        #[test]
        fn valid_addresses_connect() {
            let me = identity();
            let registry = ConnectionRegistry::new();

            let conn = connect_with_lan_ip(&me, &registry, "192.168.1.10").unwrap();
            assert_eq!(conn.id, "LAN-192-168-1-10");
            assert_eq!(&*conn.name, "192.168.1.10");
            assert_eq!(conn.channel, ChannelKind::Lan);
        }

        #[test]
        fn boundary_octets_are_accepted() {
            assert_eq!(parse_lan_ip("0.0.0.0").unwrap(), Ipv4Addr::new(0, 0, 0, 0));
            assert_eq!(
                parse_lan_ip("255.255.255.255").unwrap(),
                Ipv4Addr::new(255, 255, 255, 255)
            );
            assert_eq!(parse_lan_ip(" 10.0.0.7 ").unwrap(), Ipv4Addr::new(10, 0, 0, 7));
        }

        #[test]
        fn leading_zeros_are_canonicalized() {
            let me = identity();
            let registry = ConnectionRegistry::new();
            let conn = connect_with_lan_ip(&me, &registry, "10.0.00.1").unwrap();
            assert_eq!(conn.id, "LAN-10-0-0-1");
        }

        #[test]
        fn out_of_range_or_non_numeric_segments_are_rejected() {
            let me = identity();
            let registry = ConnectionRegistry::new();

            for bad in [
                "256.1.1.1",
                "1.2.3",
                "1.2.3.4.5",
                "a.b.c.d",
                "192.168.1.",
                "1234.1.1.1",
                "",
                "1.2.3.-4",
            ] {
                assert_eq!(
                    connect_with_lan_ip(&me, &registry, bad).unwrap_err(),
                    RendezvousError::InvalidAddress,
                    "should reject {bad:?}"
                );
            }
            assert!(registry.is_empty());
        }
    }
}
