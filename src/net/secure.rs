//! Session security primitives
//!
//! Chunk traffic between paired devices is sealed end to end. The building
//! blocks here are deliberately small:
//!
//! - [`TokenHandshake`]: a symmetric password-authenticated key exchange
//!   (SPAKE2) over the shared rendezvous token. Both sides already know the
//!   token out of band (QR, copy/paste), so it serves as the low-entropy
//!   shared secret; the exchange never puts token material on the wire.
//! - [`SessionCipher`]: per-session ChaCha20-Poly1305 keyed via HKDF-SHA256
//!   from the handshake secret. Nonces are an 8-byte counter prepended to
//!   each sealed frame, so frames are self-describing and reordering is
//!   detected by the AEAD tag.
//! - [`password`]: salted HMAC storage for the local connection password
//!   with constant-time verification.
//!
//! A mismatched token does not fail the handshake itself; it yields a
//! different secret on each side. The confirmation tags exchanged before the
//! first sealed frame are what surface the mismatch.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Shared SPAKE2 identity for the symmetric exchange.
const EXCHANGE_IDENTITY: &[u8] = b"peerdrop-token-exchange";

/// HKDF salt binding derived keys to this protocol version.
const SESSION_SALT: &[u8] = b"peerdrop-handshake-v1";

/// HKDF info string for the chunk-sealing key.
const SESSION_KEY_INFO: &[u8] = b"peerdrop-session-key";

/// Confirmation labels. Distinct per side so a reflected tag never verifies.
const CREATOR_CONFIRM_LABEL: &[u8] = b"peerdrop-confirm-creator";
const JOINER_CONFIRM_LABEL: &[u8] = b"peerdrop-confirm-joiner";

/// Errors from handshake, key derivation, or sealing.
#[derive(Error, Debug)]
pub enum SecureError {
    /// The inbound handshake message was malformed.
    #[error("handshake message corrupted or truncated")]
    Handshake,

    /// Key derivation failed.
    #[error("session key derivation failed")]
    KeyDerivation,

    /// The nonce counter ran out; the session must be re-keyed.
    #[error("nonce counter exhausted, session must be rekeyed")]
    NonceExhausted,

    /// A sealed frame was shorter than the nonce header.
    #[error("sealed frame too short")]
    FrameTooShort,

    /// Authentication failed on open (tampered or cross-keyed frame).
    #[error("frame authentication failed")]
    Aead,
}

/// Which role a device plays in a token exchange.
///
/// The creator is the side that advertised the token; the joiner entered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    Creator,
    Joiner,
}

impl HandshakeSide {
    #[inline]
    fn label(&self) -> &'static [u8] {
        match self {
            Self::Creator => CREATOR_CONFIRM_LABEL,
            Self::Joiner => JOINER_CONFIRM_LABEL,
        }
    }
}

/// In-flight symmetric SPAKE2 exchange.
///
/// `start` produces the outbound message to hand the peer; `finish` consumes
/// theirs and yields the shared secret.
pub struct TokenHandshake {
    state: Spake2<Ed25519Group>,
}

impl TokenHandshake {
    /// Begins an exchange over the shared rendezvous token.
    ///
    /// Returns the handshake state and the message to deliver to the peer.
    #[must_use]
    pub fn start(token: &str) -> (Self, Vec<u8>) {
        let (state, outbound) = Spake2::<Ed25519Group>::start_symmetric(
            &Password::new(token.as_bytes()),
            &Identity::new(EXCHANGE_IDENTITY),
        );
        (Self { state }, outbound)
    }

    /// Consumes the peer's message and derives the shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`SecureError::Handshake`] if the message is malformed. A
    /// token mismatch does NOT error here; verify confirmation tags before
    /// trusting the session.
    pub fn finish(self, inbound: &[u8]) -> Result<SessionSecret, SecureError> {
        let secret = self
            .state
            .finish(inbound)
            .map_err(|_| SecureError::Handshake)?;
        Ok(SessionSecret { secret })
    }
}

impl std::fmt::Debug for TokenHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHandshake").finish_non_exhaustive()
    }
}

/// The shared secret produced by a completed handshake.
pub struct SessionSecret {
    secret: Vec<u8>,
}

impl SessionSecret {
    /// Derives the chunk-sealing cipher for this session.
    pub fn cipher(&self) -> Result<SessionCipher, SecureError> {
        SessionCipher::from_secret(&self.secret)
    }

    /// Computes this side's confirmation tag (hex) to send to the peer.
    #[must_use]
    pub fn confirm_tag(&self, side: HandshakeSide) -> String {
        hex_encode(&tag_bytes(&self.secret, side.label()))
    }

    /// Verifies the PEER's confirmation tag in constant time.
    ///
    /// `peer_side` is the role the remote device played, not ours.
    #[must_use]
    pub fn verify_confirm(&self, peer_side: HandshakeSide, tag_hex: &str) -> bool {
        let Some(claimed) = hex_decode(tag_hex) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(peer_side.label());
        mac.verify_slice(&claimed).is_ok()
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecret").finish_non_exhaustive()
    }
}

fn tag_bytes(secret: &[u8], label: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(label);
    mac.finalize().into_bytes().to_vec()
}

/// Per-session AEAD cipher for chunk traffic.
///
/// Sealed frame layout: `[8-byte LE counter][ciphertext + tag]`.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    send_counter: u64,
}

impl SessionCipher {
    /// Derives the session key from a handshake secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self, SecureError> {
        let hk = Hkdf::<Sha256>::new(Some(SESSION_SALT), secret);
        let mut key = [0u8; 32];
        hk.expand(SESSION_KEY_INFO, &mut key)
            .map_err(|_| SecureError::KeyDerivation)?;

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| SecureError::KeyDerivation)?;

        Ok(Self {
            cipher,
            send_counter: 0,
        })
    }

    /// Seals a chunk for sending, advancing the nonce counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecureError> {
        let counter = self.send_counter;
        self.send_counter = counter.checked_add(1).ok_or(SecureError::NonceExhausted)?;

        let nonce = counter_nonce(counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SecureError::Aead)?;

        let mut frame = Vec::with_capacity(8 + ciphertext.len());
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Opens a received frame using the counter it carries.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, SecureError> {
        if frame.len() < 8 {
            return Err(SecureError::FrameTooShort);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&frame[..8]);
        let nonce = counter_nonce(u64::from_le_bytes(counter_bytes));

        self.cipher
            .decrypt(&nonce, &frame[8..])
            .map_err(|_| SecureError::Aead)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("send_counter", &self.send_counter)
            .finish_non_exhaustive()
    }
}

// ChaCha20-Poly1305 nonces are 12 bytes; 8 counter bytes, 4 zero bytes.
fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..8].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Local connection-password storage.
///
/// The password gates inbound connection consent. It is stored as a salted
/// HMAC-SHA256 tag, never in recoverable form, and verified in constant
/// time.
pub mod password {
    use hmac::Mac;
    use rand::RngCore;
    use serde::{Deserialize, Serialize};

    use super::{hex_decode, hex_encode, HmacSha256};

    /// Persisted form of the connection password.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StoredPassword {
        pub salt_hex: String,
        pub tag_hex: String,
    }

    /// Hashes a password under a fresh random salt.
    #[must_use]
    pub fn store(password: &str) -> StoredPassword {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&salt).expect("HMAC accepts any key length");
        mac.update(password.as_bytes());
        let tag = mac.finalize().into_bytes().to_vec();

        StoredPassword {
            salt_hex: hex_encode(&salt),
            tag_hex: hex_encode(&tag),
        }
    }

    /// Verifies an attempt against the stored tag in constant time.
    #[must_use]
    pub fn verify(stored: &StoredPassword, attempt: &str) -> bool {
        let Some(salt) = hex_decode(&stored.salt_hex) else {
            return false;
        };
        let Some(expected) = hex_decode(&stored.tag_hex) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&salt) else {
            return false;
        };
        mac.update(attempt.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "ABCDEFGH2345";

    fn complete_exchange(token_a: &str, token_b: &str) -> (SessionSecret, SessionSecret) {
        let (hs_a, msg_a) = TokenHandshake::start(token_a);
        let (hs_b, msg_b) = TokenHandshake::start(token_b);
        let secret_a = hs_a.finish(&msg_b).unwrap();
        let secret_b = hs_b.finish(&msg_a).unwrap();
        (secret_a, secret_b)
    }

    mod handshake_tests {
        use super::*;

        #[test]
        fn matching_tokens_agree() {
            let (a, b) = complete_exchange(TOKEN, TOKEN);

            // A's sealed frame opens on B's side and vice versa.
            let mut cipher_a = a.cipher().unwrap();
            let cipher_b = b.cipher().unwrap();
            let frame = cipher_a.seal(b"chunk payload").unwrap();
            assert_eq!(cipher_b.open(&frame).unwrap(), b"chunk payload");
        }

        #[test]
        fn confirmation_tags_verify_across_sides() {
            let (creator, joiner) = complete_exchange(TOKEN, TOKEN);

            let creator_tag = creator.confirm_tag(HandshakeSide::Creator);
            let joiner_tag = joiner.confirm_tag(HandshakeSide::Joiner);

            assert!(joiner.verify_confirm(HandshakeSide::Creator, &creator_tag));
            assert!(creator.verify_confirm(HandshakeSide::Joiner, &joiner_tag));
        }

        #[test]
        fn reflected_tag_does_not_verify() {
            let (creator, _) = complete_exchange(TOKEN, TOKEN);
            let own_tag = creator.confirm_tag(HandshakeSide::Creator);
            // Replaying our own tag as if it came from the joiner fails.
            assert!(!creator.verify_confirm(HandshakeSide::Joiner, &own_tag));
        }

        #[test]
        fn mismatched_tokens_fail_confirmation() {
            let (a, b) = complete_exchange(TOKEN, "ZZZZYYYY9876");

            let tag = a.confirm_tag(HandshakeSide::Creator);
            assert!(!b.verify_confirm(HandshakeSide::Creator, &tag));

            // Cross-keyed frames fail to open.
            let mut cipher_a = a.cipher().unwrap();
            let cipher_b = b.cipher().unwrap();
            let frame = cipher_a.seal(b"data").unwrap();
            assert!(matches!(cipher_b.open(&frame), Err(SecureError::Aead)));
        }

        #[test]
        fn truncated_handshake_message_errors() {
            let (hs, msg) = TokenHandshake::start(TOKEN);
            assert!(matches!(
                hs.finish(&msg[..msg.len() / 2]),
                Err(SecureError::Handshake)
            ));
        }
    }

    mod cipher_tests {
        use super::*;

        fn cipher_pair() -> (SessionCipher, SessionCipher) {
            let (a, b) = complete_exchange(TOKEN, TOKEN);
            (a.cipher().unwrap(), b.cipher().unwrap())
        }

        #[test]
        fn seal_open_round_trip() {
            let (mut tx, rx) = cipher_pair();
            for payload in [&b""[..], b"x", b"a longer chunk of data"] {
                let frame = tx.seal(payload).unwrap();
                assert_eq!(rx.open(&frame).unwrap(), payload);
            }
        }

        #[test]
        fn counter_makes_frames_distinct() {
            let (mut tx, _) = cipher_pair();
            let one = tx.seal(b"same").unwrap();
            let two = tx.seal(b"same").unwrap();
            assert_ne!(one, two);
            assert_eq!(&one[..8], 0u64.to_le_bytes());
            assert_eq!(&two[..8], 1u64.to_le_bytes());
        }

        #[test]
        fn tampered_frame_is_rejected() {
            let (mut tx, rx) = cipher_pair();
            let mut frame = tx.seal(b"payload").unwrap();
            let last = frame.len() - 1;
            frame[last] ^= 0x01;
            assert!(matches!(rx.open(&frame), Err(SecureError::Aead)));
        }

        #[test]
        fn short_frame_is_rejected() {
            let (_, rx) = cipher_pair();
            assert!(matches!(rx.open(&[1, 2, 3]), Err(SecureError::FrameTooShort)));
        }
    }

    mod password_tests {
        use super::super::password::{store, verify, StoredPassword};

        #[test]
        fn store_and_verify() {
            let stored = store("Correct-Horse-7");
            assert!(verify(&stored, "Correct-Horse-7"));
            assert!(!verify(&stored, "correct-horse-7"));
            assert!(!verify(&stored, ""));
        }

        #[test]
        fn salts_are_unique() {
            let one = store("same password");
            let two = store("same password");
            assert_ne!(one.salt_hex, two.salt_hex);
            assert_ne!(one.tag_hex, two.tag_hex);
            assert!(verify(&one, "same password"));
            assert!(verify(&two, "same password"));
        }

        #[test]
        fn corrupted_store_never_verifies() {
            let stored = StoredPassword {
                salt_hex: "not hex".to_string(),
                tag_hex: "abcd".to_string(),
            };
            assert!(!verify(&stored, "anything"));
        }

        #[test]
        fn survives_serde_round_trip() {
            let stored = store("persist me");
            let json = serde_json::to_string(&stored).unwrap();
            let back: StoredPassword = serde_json::from_str(&json).unwrap();
            assert!(verify(&back, "persist me"));
        }
    }

    mod hex_tests {
        use super::*;

        #[test]
        fn encode_decode() {
            assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "00ff1a");
            assert_eq!(hex_decode("00ff1a").unwrap(), vec![0x00, 0xff, 0x1a]);
            assert_eq!(hex_decode("").unwrap(), Vec::<u8>::new());
            assert!(hex_decode("abc").is_none());
            assert!(hex_decode("zz").is_none());
        }
    }
}
