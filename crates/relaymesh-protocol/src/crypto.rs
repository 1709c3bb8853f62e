//! Envelope cryptography for relaymesh.
//!
//! Primitives: X25519 for boxes and key exchange, Ed25519 for signatures,
//! XChaCha20-Poly1305 for every AEAD and HKDF-SHA256 to turn shared secrets
//! into cipher keys. Keys are fixed-size byte buffers carrying a phantom tag,
//! so a [`PublicKey`] can never be passed where a [`PublicSignature`] is
//! expected even though both are 32 bytes.
//!
//! Contracts:
//! - anonymous: [`encrypt_anonymously`] / [`decrypt_anonymously`] with the
//!   deployment-wide [`SymmetricKey`]
//! - sealed: [`seal`] / [`open_sealed`], sender unauthenticated
//! - authenticated box: [`encrypt_and_authenticate`] / [`decrypt_and_authenticate`]
//! - signatures: [`sign_message`] / [`verify_message`]
//! - key exchange: [`client_session_keys`] / [`server_session_keys`], then
//!   [`encrypt_session`] / [`decrypt_session`]
//!
//! Every decrypt or verify either returns the full plaintext or fails with
//! [`ProtocolError::Integrity`].

use std::fmt;
use std::marker::PhantomData;

use chacha20poly1305::{
    aead::{
        rand_core::{OsRng, RngCore},
        Aead, KeyInit,
    },
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::ProtocolError;

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 64;

const SEAL_INFO: &[u8] = b"relaymesh-sealed-xchacha20poly1305-v1";
const BOX_INFO: &[u8] = b"relaymesh-box-xchacha20poly1305-v1";

// ── Tagged keys ─────────────────────────────────────────────────────

/// Marker describing one kind of key.
pub trait KeyKind {
    const NAME: &'static str;
    const SECRET: bool;
}

macro_rules! key_kind {
    ($tag:ident, $alias:ident, $name:literal, $secret:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $tag {}

        impl KeyKind for $tag {
            const NAME: &'static str = $name;
            const SECRET: bool = $secret;
        }

        pub type $alias = Key<KEY_SIZE, $tag>;
    };
}

key_kind!(PublicKeyKind, PublicKey, "PublicKey", false);
key_kind!(PrivateKeyKind, PrivateKey, "PrivateKey", true);
key_kind!(PublicSignatureKind, PublicSignature, "PublicSignature", false);
key_kind!(PrivateSignatureKind, PrivateSignature, "PrivateSignature", true);
key_kind!(SymmetricKeyKind, SymmetricKey, "SymmetricKey", true);
key_kind!(ExchangePublicKind, ExchangePublicKey, "ExchangePublicKey", false);
key_kind!(ExchangePrivateKind, ExchangePrivateKey, "ExchangePrivateKey", true);
key_kind!(SessionRxKind, SessionRxKey, "SessionRxKey", true);
key_kind!(SessionTxKind, SessionTxKey, "SessionTxKey", true);

/// Fixed-size key tagged with its kind.
pub struct Key<const N: usize, K: KeyKind> {
    bytes: [u8; N],
    _kind: PhantomData<fn() -> K>,
}

impl<const N: usize, K: KeyKind> Key<N, K> {
    pub const SIZE: usize = N;

    pub const fn from_bytes(bytes: [u8; N]) -> Self {
        Self {
            bytes,
            _kind: PhantomData,
        }
    }

    /// Fails with a parse error when `bytes` has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let array: [u8; N] = bytes.try_into().map_err(|_| {
            ProtocolError::Parse(format!(
                "{} must be {N} bytes, got {}",
                K::NAME,
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(array))
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ProtocolError::Parse(format!("{} is not hex: {e}", K::NAME)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn random() -> Self {
        let mut bytes = [0u8; N];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

impl<const N: usize, K: KeyKind> Clone for Key<N, K> {
    fn clone(&self) -> Self {
        Self::from_bytes(self.bytes)
    }
}

impl<const N: usize, K: KeyKind> PartialEq for Key<N, K> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<const N: usize, K: KeyKind> Eq for Key<N, K> {}

impl<const N: usize, K: KeyKind> fmt::Debug for Key<N, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if K::SECRET {
            write!(f, "{}(<redacted>)", K::NAME)
        } else {
            write!(f, "{}({})", K::NAME, self.to_hex())
        }
    }
}

// ── Key generation and conversion ───────────────────────────────────

pub fn generate_symmetric_key() -> SymmetricKey {
    SymmetricKey::random()
}

pub fn generate_encryption_keys() -> (PrivateKey, PublicKey) {
    let secret = X25519Secret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    (
        PrivateKey::from_bytes(secret.to_bytes()),
        PublicKey::from_bytes(public.to_bytes()),
    )
}

pub fn generate_signature_keys() -> (PrivateSignature, PublicSignature) {
    let private = PrivateSignature::random();
    let public = private.public_signature();
    (private, public)
}

pub fn generate_exchange_keys() -> (ExchangePrivateKey, ExchangePublicKey) {
    let secret = X25519Secret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    (
        ExchangePrivateKey::from_bytes(secret.to_bytes()),
        ExchangePublicKey::from_bytes(public.to_bytes()),
    )
}

impl PrivateKey {
    pub fn public_key(&self) -> PublicKey {
        let secret = X25519Secret::from(self.bytes);
        PublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes())
    }
}

impl PrivateSignature {
    pub fn public_signature(&self) -> PublicSignature {
        let signing = SigningKey::from_bytes(&self.bytes);
        PublicSignature::from_bytes(signing.verifying_key().to_bytes())
    }

    /// X25519 secret matching [`PublicSignature::to_encryption_key`].
    ///
    /// SHA-512 of the seed, first half, clamped.
    pub fn to_encryption_key(&self) -> PrivateKey {
        let hash = Sha512::digest(self.bytes);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&hash[..32]);
        secret[0] &= 248;
        secret[31] &= 127;
        secret[31] |= 64;
        PrivateKey::from_bytes(secret)
    }
}

impl PublicSignature {
    /// Edwards → Montgomery map of the verifying key.
    pub fn to_encryption_key(&self) -> Result<PublicKey, ProtocolError> {
        let edwards = CompressedEdwardsY(self.bytes).decompress().ok_or_else(|| {
            ProtocolError::Integrity("invalid Ed25519 public key: decompression failed".into())
        })?;
        Ok(PublicKey::from_bytes(edwards.to_montgomery().to_bytes()))
    }
}

// ── AEAD helpers ────────────────────────────────────────────────────

fn derive_key(shared_secret: &[u8; 32], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// nonce ∥ ciphertext ∥ tag
fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ProtocolError::Integrity(format!("encryption failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &[u8; 32], message: &[u8], what: &str) -> Result<Vec<u8>, ProtocolError> {
    if message.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ProtocolError::Integrity(format!(
            "{what}: ciphertext too short ({} bytes)",
            message.len()
        )));
    }
    let (nonce, ciphertext) = message.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::Integrity(format!("{what}: authentication failed")))
}

fn diffie_hellman(private: &[u8; 32], public: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    let secret = X25519Secret::from(*private);
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(ProtocolError::Integrity("low-order public key".into()));
    }
    Ok(shared.to_bytes())
}

// ── Anonymous (broadcast key) ───────────────────────────────────────

pub fn encrypt_anonymously(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
    aead_encrypt(key.as_bytes(), plaintext)
}

pub fn decrypt_anonymously(message: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
    aead_decrypt(key.as_bytes(), message, "anonymous decrypt")
}

// ── Sealed to a public key ──────────────────────────────────────────

/// ephemeral public key ∥ nonce ∥ ciphertext ∥ tag
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, ProtocolError> {
    let (eph_private, eph_public) = generate_encryption_keys();
    let shared = diffie_hellman(eph_private.as_bytes(), recipient.as_bytes())?;
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_public.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let key = derive_key(&shared, &salt, SEAL_INFO);

    let body = aead_encrypt(&key, plaintext)?;
    let mut out = Vec::with_capacity(KEY_SIZE + body.len());
    out.extend_from_slice(eph_public.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn open_sealed(
    message: &[u8],
    own_public: &PublicKey,
    own_private: &PrivateKey,
) -> Result<Vec<u8>, ProtocolError> {
    if message.len() < KEY_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(ProtocolError::Integrity(format!(
            "sealed box too short ({} bytes)",
            message.len()
        )));
    }
    let (eph_public, body) = message.split_at(KEY_SIZE);
    let eph_public: [u8; 32] = eph_public
        .try_into()
        .map_err(|_| ProtocolError::Integrity("sealed box header".into()))?;
    let shared = diffie_hellman(own_private.as_bytes(), &eph_public)?;
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(&eph_public);
    salt[32..].copy_from_slice(own_public.as_bytes());
    let key = derive_key(&shared, &salt, SEAL_INFO);
    aead_decrypt(&key, body, "sealed box")
}

// ── Authenticated box ───────────────────────────────────────────────

fn box_key(
    sender: &PublicKey,
    recipient: &PublicKey,
    shared: &[u8; 32],
) -> [u8; 32] {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(sender.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    derive_key(shared, &salt, BOX_INFO)
}

/// Encrypt from `sender_private` to `recipient`; both identities are bound.
pub fn encrypt_and_authenticate(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender_private: &PrivateKey,
) -> Result<Vec<u8>, ProtocolError> {
    let shared = diffie_hellman(sender_private.as_bytes(), recipient.as_bytes())?;
    let key = box_key(&sender_private.public_key(), recipient, &shared);
    aead_encrypt(&key, plaintext)
}

pub fn decrypt_and_authenticate(
    message: &[u8],
    sender: &PublicKey,
    recipient_private: &PrivateKey,
) -> Result<Vec<u8>, ProtocolError> {
    let shared = diffie_hellman(recipient_private.as_bytes(), sender.as_bytes())?;
    let key = box_key(sender, &recipient_private.public_key(), &shared);
    aead_decrypt(&key, message, "authenticated box")
}

// ── Signatures ──────────────────────────────────────────────────────

/// signature(64) ∥ message
pub fn sign_message(message: &[u8], key: &PrivateSignature) -> Vec<u8> {
    let signing = SigningKey::from_bytes(key.as_bytes());
    let signature = signing.sign(message);
    let mut out = Vec::with_capacity(SIGNATURE_SIZE + message.len());
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(message);
    out
}

/// Check the prepended signature and return the message without it.
pub fn verify_message(signed: &[u8], key: &PublicSignature) -> Result<Vec<u8>, ProtocolError> {
    if signed.len() < SIGNATURE_SIZE {
        return Err(ProtocolError::Integrity(format!(
            "signed message too short ({} bytes)",
            signed.len()
        )));
    }
    let (signature, message) = signed.split_at(SIGNATURE_SIZE);
    let signature = Signature::from_slice(signature)
        .map_err(|e| ProtocolError::Integrity(format!("malformed signature: {e}")))?;
    let verifying = VerifyingKey::from_bytes(key.as_bytes())
        .map_err(|e| ProtocolError::Integrity(format!("invalid public signature: {e}")))?;
    verifying
        .verify(message, &signature)
        .map_err(|_| ProtocolError::Integrity("signature verification failed".into()))?;
    Ok(message.to_vec())
}

// ── Key exchange and session encryption ─────────────────────────────

/// Directional keys of one operator-bridge session.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub rx: SessionRxKey,
    pub tx: SessionTxKey,
}

fn session_material(
    own_private: &ExchangePrivateKey,
    peer_public: &ExchangePublicKey,
    client_public: &ExchangePublicKey,
    server_public: &ExchangePublicKey,
) -> Result<[u8; 64], ProtocolError> {
    let shared = diffie_hellman(own_private.as_bytes(), peer_public.as_bytes())?;
    let mut hasher = Sha512::new();
    hasher.update(shared);
    hasher.update(client_public.as_bytes());
    hasher.update(server_public.as_bytes());
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

fn split_material(material: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&material[..32]);
    second.copy_from_slice(&material[32..]);
    (first, second)
}

pub fn client_session_keys(
    client_private: &ExchangePrivateKey,
    client_public: &ExchangePublicKey,
    server_public: &ExchangePublicKey,
) -> Result<SessionKeys, ProtocolError> {
    let material = session_material(client_private, server_public, client_public, server_public)?;
    let (first, second) = split_material(&material);
    Ok(SessionKeys {
        rx: SessionRxKey::from_bytes(first),
        tx: SessionTxKey::from_bytes(second),
    })
}

pub fn server_session_keys(
    server_private: &ExchangePrivateKey,
    server_public: &ExchangePublicKey,
    client_public: &ExchangePublicKey,
) -> Result<SessionKeys, ProtocolError> {
    let material = session_material(server_private, client_public, client_public, server_public)?;
    let (first, second) = split_material(&material);
    Ok(SessionKeys {
        rx: SessionRxKey::from_bytes(second),
        tx: SessionTxKey::from_bytes(first),
    })
}

pub fn encrypt_session(plaintext: &[u8], key: &SessionTxKey) -> Result<Vec<u8>, ProtocolError> {
    aead_encrypt(key.as_bytes(), plaintext)
}

pub fn decrypt_session(message: &[u8], key: &SessionRxKey) -> Result<Vec<u8>, ProtocolError> {
    aead_decrypt(key.as_bytes(), message, "session decrypt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_roundtrip_and_wrong_key() {
        let key = generate_symmetric_key();
        let ct = encrypt_anonymously(b"tagged body", &key).unwrap();
        assert_eq!(ct.len(), NONCE_SIZE + 11 + TAG_SIZE);
        assert_eq!(decrypt_anonymously(&ct, &key).unwrap(), b"tagged body");

        let other = generate_symmetric_key();
        assert!(matches!(
            decrypt_anonymously(&ct, &other),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn undersized_input_is_integrity_error() {
        let key = generate_symmetric_key();
        assert!(matches!(
            decrypt_anonymously(&[0u8; 10], &key),
            Err(ProtocolError::Integrity(_))
        ));
        let (private, public) = generate_encryption_keys();
        assert!(open_sealed(&[0u8; 40], &public, &private).is_err());
        let (_, sig) = generate_signature_keys();
        assert!(verify_message(&[0u8; 63], &sig).is_err());
    }

    #[test]
    fn sealed_only_opens_for_recipient() {
        let (private, public) = generate_encryption_keys();
        let sealed = seal(b"for the gateway", &public).unwrap();
        assert_eq!(
            open_sealed(&sealed, &public, &private).unwrap(),
            b"for the gateway"
        );

        let (other_private, other_public) = generate_encryption_keys();
        assert!(open_sealed(&sealed, &other_public, &other_private).is_err());
    }

    #[test]
    fn sealed_blob_resists_broadcast_key() {
        let (_, public) = generate_encryption_keys();
        let broadcast = generate_symmetric_key();
        let sealed = seal(b"inner", &public).unwrap();
        assert!(decrypt_anonymously(&sealed, &broadcast).is_err());
    }

    #[test]
    fn authenticated_box_binds_both_sides() {
        let (a_private, a_public) = generate_encryption_keys();
        let (b_private, b_public) = generate_encryption_keys();
        let (_, c_public) = generate_encryption_keys();

        let ct = encrypt_and_authenticate(b"command", &b_public, &a_private).unwrap();
        assert_eq!(
            decrypt_and_authenticate(&ct, &a_public, &b_private).unwrap(),
            b"command"
        );
        // wrong claimed sender
        assert!(decrypt_and_authenticate(&ct, &c_public, &b_private).is_err());
    }

    #[test]
    fn signature_roundtrip_and_tamper() {
        let (private, public) = generate_signature_keys();
        let mut signed = sign_message(b"route update", &private);
        assert_eq!(verify_message(&signed, &public).unwrap(), b"route update");

        let last = signed.len() - 1;
        signed[last] ^= 1;
        assert!(matches!(
            verify_message(&signed, &public),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn signature_keys_convert_to_box_keys() {
        let (private_sig, public_sig) = generate_signature_keys();
        let private = private_sig.to_encryption_key();
        let public = public_sig.to_encryption_key().unwrap();
        assert_eq!(private.public_key(), public);

        let sealed = seal(b"join", &public).unwrap();
        assert_eq!(open_sealed(&sealed, &public, &private).unwrap(), b"join");
    }

    #[test]
    fn session_keys_are_complementary() {
        let (c_private, c_public) = generate_exchange_keys();
        let (s_private, s_public) = generate_exchange_keys();
        let client = client_session_keys(&c_private, &c_public, &s_public).unwrap();
        let server = server_session_keys(&s_private, &s_public, &c_public).unwrap();

        assert_eq!(client.tx.as_bytes(), server.rx.as_bytes());
        assert_eq!(client.rx.as_bytes(), server.tx.as_bytes());
        assert_ne!(client.rx.as_bytes(), client.tx.as_bytes());

        let ct = encrypt_session(b"{\"MessageType\":\"GetCapability\"}", &client.tx).unwrap();
        assert_eq!(
            decrypt_session(&ct, &server.rx).unwrap(),
            b"{\"MessageType\":\"GetCapability\"}"
        );
    }

    #[test]
    fn low_order_exchange_key_is_rejected() {
        let (c_private, c_public) = generate_exchange_keys();
        let zero = ExchangePublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            client_session_keys(&c_private, &c_public, &zero),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn key_parsing_checks_length() {
        assert!(PublicKey::from_slice(&[0u8; 31]).is_err());
        let key = generate_symmetric_key();
        assert_eq!(SymmetricKey::from_hex(&key.to_hex()).unwrap(), key);
        assert_eq!(format!("{key:?}"), "SymmetricKey(<redacted>)");
    }
}
