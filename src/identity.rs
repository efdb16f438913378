//! # Node Identity
//!
//! Identity types shared by the QUIC endpoint and the reachability test:
//!
//! - [`Keypair`]: Ed25519 signing keypair; the TLS identity key material
//! - [`Identity`]: 32-byte public key identifying a peer
//! - [`PeerAddress`]: an identity pinned to a socket address (what we dial)
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key**. A node's self-signed certificate carries
//! the public key, and outbound connections pin the expected key through SNI,
//! so no CA is involved. See `crypto` for the certificate side.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - `Identity::from_hex(id.to_hex()) == Ok(id)`
//! - `PeerAddress` text form is `IP:PORT/HEX_PUBKEY` and round-trips

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    ///
    /// Used for ephemeral identities (test tools, short-lived clients); a
    /// service node loads its persistent key with [`Keypair::from_secret_key_bytes`].
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that the identity is a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF keys are rejected up front; everything else must
    /// decode as a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer we can dial: its public key plus the UDP address it listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub identity: Identity,
    pub addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(identity: Identity, addr: SocketAddr) -> Self {
        Self { identity, addr }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("peer must include its pubkey (format: IP:PORT/PUBKEY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        let identity = Identity::from_hex(id_part)
            .map_err(|_| anyhow::anyhow!("pubkey must be 64 hex characters (32 bytes)"))?;

        Ok(Self { identity, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_roundtrip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        let parsed = Identity::from_hex(&identity.to_hex()).expect("valid hex");
        assert_eq!(parsed, identity);
        assert_eq!(identity.to_string().len(), 64);
    }

    #[test]
    fn identity_rejects_wrong_length_hex() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn keypair_restores_from_secret() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.identity(), keypair.identity());
    }

    #[test]
    fn generated_identities_are_valid() {
        for _ in 0..20 {
            assert!(Keypair::generate().identity().is_valid());
        }
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn peer_address_parses_and_displays() {
        let identity = Keypair::generate().identity();
        let text = format!("127.0.0.1:22021/{}", identity);

        let peer: PeerAddress = text.parse().expect("valid peer address");
        assert_eq!(peer.identity, identity);
        assert_eq!(peer.addr, "127.0.0.1:22021".parse().unwrap());
        assert_eq!(peer.to_string(), text);
    }

    #[test]
    fn peer_address_rejects_malformed_input() {
        assert!("127.0.0.1:22021".parse::<PeerAddress>().is_err());
        assert!("not-an-addr/00".parse::<PeerAddress>().is_err());
        assert!(format!("127.0.0.1:1/{}", "ab".repeat(31))
            .parse::<PeerAddress>()
            .is_err());
    }
}
