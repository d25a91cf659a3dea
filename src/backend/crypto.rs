//! Key material and the encryption helpers the chat services build on.
//!
//! Every user owns a [`KeyPair`]: an ed25519 signing key (`pub`) that guards
//! writes into the user's graph space, and an x25519 key (`epub`) used to
//! agree on per-friend symmetric secrets. A second x25519 [`BoxKeyPair`] lets
//! anyone seal data for a user without a prior exchange.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ChatError, Result};

const SEA_PREFIX: &str = "SEA";
const BOX_PREFIX: &str = "BOX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Base64,
    Hex,
    Utf8,
}

#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    encryption: StaticSecret,
}

/// Serializable form of a [`KeyPair`]. Holds private keys in the clear, so it
/// must only ever be stored encrypted or in a local session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    #[serde(rename = "pub")]
    pub pub_key: String,
    #[serde(rename = "priv")]
    pub priv_key: String,
    pub epub: String,
    pub epriv: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("pub", &self.pub_key())
            .field("epub", &self.epub())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn pub_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing.verifying_key().to_bytes())
    }

    pub fn epub(&self) -> String {
        URL_SAFE_NO_PAD.encode(PublicKey::from(&self.encryption).as_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing.sign(msg).to_bytes())
    }

    pub fn to_record(&self) -> PairRecord {
        PairRecord {
            pub_key: self.pub_key(),
            priv_key: URL_SAFE_NO_PAD.encode(self.signing.to_bytes()),
            epub: self.epub(),
            epriv: URL_SAFE_NO_PAD.encode(self.encryption.to_bytes()),
        }
    }

    pub fn from_record(record: &PairRecord) -> Result<Self> {
        let signing = SigningKey::from_bytes(&decode_key32(&record.priv_key)?);
        let encryption = StaticSecret::from(decode_key32(&record.epriv)?);
        let pair = Self {
            signing,
            encryption,
        };
        if pair.pub_key() != record.pub_key || pair.epub() != record.epub {
            return Err(ChatError::InvalidKey("public keys do not match private keys".into()));
        }
        Ok(pair)
    }
}

/// Checks an ed25519 signature produced by [`KeyPair::sign`].
pub fn verify(pub_key: &str, msg: &[u8], sig: &str) -> bool {
    let Ok(key_bytes) = decode_key32(pub_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(sig) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    key.verify(msg, &Signature::from_bytes(&sig_array)).is_ok()
}

/// Shared symmetric key between `pair` and the owner of `epub`. Both sides
/// derive the same key.
pub fn secret(epub: &str, pair: &KeyPair) -> Result<[u8; 32]> {
    let theirs = PublicKey::from(decode_key32(epub)?);
    let shared = pair.encryption.diffie_hellman(&theirs);
    if !shared.was_contributory() {
        return Err(ChatError::NoSecret);
    }
    derive_key(b"peerchat.secret.v1", shared.as_bytes(), b"aes-256-gcm")
}

/// Key for data only the pair's owner should read back.
pub fn self_key(pair: &KeyPair) -> Result<[u8; 32]> {
    derive_key(b"peerchat.self.v1", &pair.encryption.to_bytes(), b"aes-256-gcm")
}

/// PBKDF2-HMAC-SHA256 rounds for new accounts.
pub const WORK_ROUNDS: u32 = 100_000;

/// Stretches a password into the key that protects a stored [`PairRecord`].
pub fn work(password: &str, salt: &str, rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut key);
    key
}

pub fn random_salt() -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    URL_SAFE_NO_PAD.encode(salt)
}

#[derive(Serialize, Deserialize)]
struct SeaEnvelope {
    ct: String,
    iv: String,
}

#[derive(Serialize, Deserialize)]
struct BoxEnvelope {
    ct: String,
    iv: String,
    epk: String,
}

pub fn encrypt(raw: &str, key: &[u8; 32]) -> Result<String> {
    if raw.is_empty() {
        return Err(ChatError::NoEncryptionData);
    }
    let (ct, iv) = aes_seal(key, raw.as_bytes())?;
    let envelope = SeaEnvelope {
        ct: URL_SAFE_NO_PAD.encode(ct),
        iv: URL_SAFE_NO_PAD.encode(iv),
    };
    Ok(format!("{}{}", SEA_PREFIX, serde_json::to_string(&envelope)?))
}

pub fn decrypt(cipher: &str, key: &[u8; 32]) -> Result<String> {
    if cipher.is_empty() {
        return Err(ChatError::NoEncryptionData);
    }
    let body = cipher.strip_prefix(SEA_PREFIX).ok_or(ChatError::InvalidCipher)?;
    let envelope: SeaEnvelope =
        serde_json::from_str(body).map_err(|_| ChatError::InvalidCipher)?;
    let ct = decode_b64(&envelope.ct)?;
    let iv = decode_b64(&envelope.iv)?;
    aes_open(key, &ct, &iv)
}

#[derive(Clone)]
pub struct BoxKeyPair {
    secret: StaticSecret,
}

impl std::fmt::Debug for BoxKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl BoxKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(PublicKey::from(&self.secret).as_bytes())
    }

    /// Returns `(public, private)`.
    pub fn export(&self) -> (String, String) {
        (
            self.public_key(),
            URL_SAFE_NO_PAD.encode(self.secret.to_bytes()),
        )
    }

    pub fn import(private_key: &str) -> Result<Self> {
        Ok(Self {
            secret: StaticSecret::from(decode_key32(private_key)?),
        })
    }
}

/// Encrypts `raw` so only the holder of the box pair behind `receiver_pub`
/// can open it.
pub fn seal(receiver_pub: &str, raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(ChatError::NoEncryptionData);
    }
    let receiver = PublicKey::from(decode_key32(receiver_pub)?);
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let shared = ephemeral.diffie_hellman(&receiver);
    if !shared.was_contributory() {
        return Err(ChatError::NoSecret);
    }
    let key = derive_key(b"peerchat.box.v1", shared.as_bytes(), b"aes-256-gcm")?;
    let (ct, iv) = aes_seal(&key, raw.as_bytes())?;
    let envelope = BoxEnvelope {
        ct: URL_SAFE_NO_PAD.encode(ct),
        iv: URL_SAFE_NO_PAD.encode(iv),
        epk: URL_SAFE_NO_PAD.encode(PublicKey::from(&ephemeral).as_bytes()),
    };
    Ok(format!("{}{}", BOX_PREFIX, serde_json::to_string(&envelope)?))
}

pub fn open(pair: &BoxKeyPair, cipher: &str) -> Result<String> {
    let body = cipher.strip_prefix(BOX_PREFIX).ok_or(ChatError::InvalidCipher)?;
    let envelope: BoxEnvelope =
        serde_json::from_str(body).map_err(|_| ChatError::InvalidCipher)?;
    let ephemeral = PublicKey::from(decode_key32(&envelope.epk)?);
    let shared = pair.secret.diffie_hellman(&ephemeral);
    let key = derive_key(b"peerchat.box.v1", shared.as_bytes(), b"aes-256-gcm")?;
    aes_open(&key, &decode_b64(&envelope.ct)?, &decode_b64(&envelope.iv)?)
}

pub fn hash(input: &str, encoding: HashEncoding) -> String {
    encode_digest(&Sha256::digest(input.as_bytes()), encoding)
}

/// HMAC-SHA256 of `input` keyed by `secret`.
pub fn hash_secret(input: &str, secret: &str, encoding: HashEncoding) -> String {
    // HKDF-Extract is HMAC(salt, ikm)
    let (prk, _) = Hkdf::<Sha256>::extract(Some(secret.as_bytes()), input.as_bytes());
    encode_digest(&prk, encoding)
}

fn encode_digest(bytes: &[u8], encoding: HashEncoding) -> String {
    match encoding {
        HashEncoding::Base64 => URL_SAFE_NO_PAD.encode(bytes),
        HashEncoding::Hex => hex::encode(bytes),
        HashEncoding::Utf8 => String::from_utf8_lossy(bytes).to_string(),
    }
}

fn derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).map_err(|_| ChatError::NoSecret)?;
    Ok(okm)
}

fn aes_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ChatError::EncryptFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ChatError::EncryptFailed)?;
    Ok((ct, nonce.to_vec()))
}

fn aes_open(key: &[u8; 32], ct: &[u8], iv: &[u8]) -> Result<String> {
    if iv.len() != 12 {
        return Err(ChatError::InvalidCipher);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ChatError::DecryptFailed)?;
    let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(iv);
    let plaintext = cipher
        .decrypt(nonce, ct)
        .map_err(|_| ChatError::DecryptFailed)?;
    String::from_utf8(plaintext).map_err(|_| ChatError::DecryptFailed)
}

fn decode_b64(value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| ChatError::InvalidCipher)
}

fn decode_key32(value: &str) -> Result<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| ChatError::InvalidKey(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ChatError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}
