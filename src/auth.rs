use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;

use crate::protocol::AdbError;

/// Modulus size of every identity this client generates or enrols.
pub const KEY_BITS: usize = 2048;

const MODULUS_WORDS: usize = KEY_BITS / 32;
const MODULUS_BYTES: usize = KEY_BITS / 8;

/// ADB key pair for authentication
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair
    pub fn generate() -> Result<Self, AdbError> {
        use rsa::rand_core::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AdbError::Key(format!("failed to generate key: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load from a PEM-encoded private key string
    pub fn from_pem(pem: &str) -> Result<Self, AdbError> {
        // Try PKCS#1 first, then PKCS#8
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::Key(format!("failed to parse PEM: {e}")))?
        };

        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Sign an AUTH token from the daemon.
    ///
    /// The 20-byte token is used directly as the SHA-1 digest inside the
    /// PKCS#1 v1.5 envelope; adbd never hashes the token itself.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::Key(format!("failed to sign token: {e}")))
    }

    /// The 524-byte adbd public key structure, little-endian throughout:
    /// word count, `n0inv = -1/n mod 2^32`, the modulus, the Montgomery
    /// parameter `rr = 2^4096 mod n`, and the exponent.
    pub fn public_key_blob(&self) -> Vec<u8> {
        let n = self.public_key.n();

        let mut blob = Vec::with_capacity(8 + MODULUS_BYTES * 2 + 4);
        blob.extend_from_slice(&(MODULUS_WORDS as u32).to_le_bytes());
        blob.extend_from_slice(&n0inv(n).to_le_bytes());
        blob.extend_from_slice(&le_padded(n));

        let rr = (BigUint::from(1u32) << (KEY_BITS * 2)) % n;
        blob.extend_from_slice(&le_padded(&rr));

        let mut exponent = [0u8; 4];
        let e = self.public_key.e().to_bytes_le();
        exponent[..e.len()].copy_from_slice(&e);
        blob.extend_from_slice(&exponent);

        blob
    }

    /// Public key in the AUTH(RSAPUBLICKEY) wire form: base64 of the adbd
    /// blob, a space, the user label, and a trailing NUL.
    pub fn encoded_public(&self, label: &str) -> Vec<u8> {
        let encoded = general_purpose::STANDARD.encode(self.public_key_blob());
        let mut out = encoded.into_bytes();
        out.push(b' ');
        out.extend_from_slice(label.as_bytes());
        out.push(0);
        out
    }

    /// Get private key as PEM
    pub fn private_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AdbError::Key(format!("failed to encode private key: {e}")))?;
        Ok(pem.to_string())
    }

    /// Get public key as PEM
    pub fn public_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .public_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AdbError::Key(format!("failed to encode public key: {e}")))?;
        Ok(pem)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// `-1 / n mod 2^32` for the least significant word of the modulus.
fn n0inv(n: &BigUint) -> u32 {
    let bytes = n.to_bytes_le();
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    n0inv_word(u32::from_le_bytes(word))
}

/// Newton iteration doubles the number of correct low bits each round, so
/// five rounds from the 3-bit seed cover all 32 bits.
fn n0inv_word(n0: u32) -> u32 {
    let mut inv = n0;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    inv.wrapping_neg()
}

/// Little-endian bytes padded to the full modulus width. Word order and
/// byte order coincide, so this is also the LE word array adbd expects.
fn le_padded(value: &BigUint) -> [u8; MODULUS_BYTES] {
    let mut out = [0u8; MODULUS_BYTES];
    let bytes = value.to_bytes_le();
    out[..bytes.len()].copy_from_slice(&bytes);
    out
}

/// Ordered set of identities offered to the daemon during the handshake.
#[derive(Default)]
pub struct KeyStore {
    identities: Vec<Arc<AdbKeyPair>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an identity; earlier identities are tried first.
    pub fn push(&mut self, key: AdbKeyPair) {
        self.identities.push(Arc::new(key));
    }

    /// Append a shared identity.
    pub fn add(&mut self, key: Arc<AdbKeyPair>) {
        self.identities.push(key);
    }

    /// Identities in trial order.
    pub fn identities(&self) -> &[Arc<AdbKeyPair>] {
        &self.identities
    }

    /// The identity whose public key is offered for enrolment.
    pub fn primary(&self) -> Option<&Arc<AdbKeyPair>> {
        self.identities.first()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
