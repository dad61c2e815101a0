use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid account address: {0}")]
    InvalidAddress(String),
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("seed decryption failed: incorrect password or corrupted data")]
    DecryptionFailed,
}

//------------------------------------         Entropy seed          ------------------------------------------------//

/// 32 bytes of secret entropy from which every account keypair is derived.
/// Zeroized on drop; never serialized except inside a [`SealedSeed`].
#[derive(Clone)]
pub struct KeySeed(Zeroizing<[u8; 32]>);

impl KeySeed {
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(bytes.as_mut());
        KeySeed(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        KeySeed(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives the account keypair at `index`. Index 0 is the agent's primary account;
    /// each channel consumes three consecutive indices.
    pub fn derive_account(&self, index: u32) -> Keypair {
        let mut hasher = Blake2b512::new();
        hasher.update(b"starlight-account");
        hasher.update(self.as_bytes());
        hasher.update(index.to_le_bytes());
        let wide: [u8; 64] = hasher.finalize().into();
        let secret = Scalar::from_bytes_mod_order_wide(&wide);
        Keypair::from_scalar(secret)
    }
}

impl Debug for KeySeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySeed")
    }
}

//------------------------------------        Accounts and keys       ----------------------------------------------//

/// An ed25519 public key identifying an account on the ledger.
/// Displayed in address form: `G` followed by the hex-encoded compressed point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId([u8; 32]);

impl AccountId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn address(&self) -> String {
        format!("G{}", hex::encode_upper(self.0))
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Some(point) = CompressedEdwardsY(self.0).decompress() else {
            return false;
        };
        let Some(big_r) = CompressedEdwardsY(signature.big_r).decompress() else {
            return false;
        };
        let Some(s) = Scalar::from_canonical_bytes(signature.s).into_option() else {
            return false;
        };
        let c = challenge_scalar(&signature.big_r, &self.0, message);
        // R == s*B - c*A
        EdwardsPoint::vartime_double_scalar_mul_basepoint(&-c, &point, &s) == big_r
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl Debug for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl FromStr for AccountId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, KeyError> {
        let hex_part = s.strip_prefix('G').ok_or_else(|| KeyError::InvalidAddress(s.to_string()))?;
        if hex_part.len() != 64 {
            return Err(KeyError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes)?;
        Ok(AccountId(bytes))
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.address())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccountId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A Schnorr signature over ed25519.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    big_r: [u8; 32],
    s: [u8; 32],
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", &hex::encode(self.big_r)[..8])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.big_r);
        bytes[32..].copy_from_slice(&self.s);
        serializer.serialize_str(&hex::encode(bytes))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        let mut big_r = [0u8; 32];
        let mut s_bytes = [0u8; 32];
        big_r.copy_from_slice(&bytes[..32]);
        s_bytes.copy_from_slice(&bytes[32..]);
        Ok(Signature { big_r, s: s_bytes })
    }
}

fn challenge_scalar(big_r: &[u8; 32], public: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hasher = Blake2b512::new();
    hasher.update(big_r);
    hasher.update(public);
    hasher.update(message);
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// A signing keypair for one derived account.
#[derive(Clone)]
pub struct Keypair {
    secret: Zeroizing<Scalar>,
    public: AccountId,
}

impl Keypair {
    pub fn from_scalar(secret: Scalar) -> Self {
        let public = AccountId(EdwardsPoint::mul_base(&secret).compress().to_bytes());
        Keypair { secret: Zeroizing::new(secret), public }
    }

    pub fn account_id(&self) -> AccountId {
        self.public
    }

    /// Produces a deterministic Schnorr signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let mut hasher = Blake2b512::new();
        hasher.update(b"starlight-nonce");
        hasher.update(self.secret.to_bytes());
        hasher.update(message);
        let wide: [u8; 64] = hasher.finalize().into();
        let r = Scalar::from_bytes_mod_order_wide(&wide);
        let big_r = EdwardsPoint::mul_base(&r).compress().to_bytes();
        let c = challenge_scalar(&big_r, self.public.as_bytes(), message);
        let s = r + c * *self.secret;
        Signature { big_r, s: s.to_bytes() }
    }
}

impl Debug for Keypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.public)
    }
}

//------------------------------------         Sealed seed           ------------------------------------------------//

/// The entropy seed sealed with ChaCha20-Poly1305 under an Argon2id-derived key.
/// This is what lands in the store; the plaintext seed only ever lives in memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedSeed {
    /// Argon2 salt (PHC string format)
    salt: String,
    /// ChaCha20-Poly1305 nonce (12 bytes)
    nonce: [u8; 12],
    /// Encrypted seed + auth tag
    ciphertext: Vec<u8>,
}

impl SealedSeed {
    pub fn seal(seed: &KeySeed, password: &str) -> Result<Self, KeyError> {
        let salt = SaltString::generate(&mut OsRng);
        let key = derive_box_key(password, &salt)?;
        let cipher =
            ChaCha20Poly1305::new_from_slice(key.as_slice()).map_err(|e| KeyError::Kdf(format!("key creation failed: {e}")))?;
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt((&nonce).into(), seed.as_bytes().as_slice())
            .map_err(|e| KeyError::Kdf(format!("encrypt failed: {e}")))?;
        Ok(SealedSeed { salt: salt.to_string(), nonce, ciphertext })
    }

    pub fn open(&self, password: &str) -> Result<KeySeed, KeyError> {
        let salt = SaltString::from_b64(&self.salt).map_err(|e| KeyError::Kdf(format!("invalid salt: {e}")))?;
        let key = derive_box_key(password, &salt)?;
        let cipher =
            ChaCha20Poly1305::new_from_slice(key.as_slice()).map_err(|e| KeyError::Kdf(format!("key creation failed: {e}")))?;
        let plaintext =
            cipher.decrypt((&self.nonce).into(), self.ciphertext.as_slice()).map_err(|_| KeyError::DecryptionFailed)?;
        let bytes: [u8; 32] = plaintext.try_into().map_err(|_| KeyError::DecryptionFailed)?;
        Ok(KeySeed::from_bytes(bytes))
    }
}

fn derive_box_key(password: &str, salt: &SaltString) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), salt).map_err(|e| KeyError::Kdf(e.to_string()))?;
    let output = hash.hash.ok_or_else(|| KeyError::Kdf("no hash output from Argon2".to_string()))?;
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&output.as_bytes()[..32]);
    Ok(key)
}

//------------------------------------        Password hashing        ----------------------------------------------//

/// Hashes a login password into a PHC string for storage.
pub fn hash_password(password: &str) -> Result<String, KeyError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| KeyError::Kdf(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verifies a login password against a stored PHC string.
pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let seed = KeySeed::from_bytes([7u8; 32]);
        let a = seed.derive_account(0);
        let b = seed.derive_account(0);
        let c = seed.derive_account(1);
        assert_eq!(a.account_id(), b.account_id());
        assert_ne!(a.account_id(), c.account_id());
    }

    #[test]
    fn address_roundtrip() {
        let seed = KeySeed::generate(&mut OsRng);
        let id = seed.derive_account(3).account_id();
        let parsed: AccountId = id.address().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-an-address".parse::<AccountId>().is_err());
    }

    #[test]
    fn sign_and_verify() {
        let seed = KeySeed::generate(&mut OsRng);
        let pair = seed.derive_account(1);
        let sig = pair.sign(b"payload");
        assert!(pair.account_id().verify(b"payload", &sig));
        assert!(!pair.account_id().verify(b"other payload", &sig));
        let other = seed.derive_account(2);
        assert!(!other.account_id().verify(b"payload", &sig));
    }

    #[test]
    fn seal_open_roundtrip() {
        let seed = KeySeed::generate(&mut OsRng);
        let sealed = SealedSeed::seal(&seed, "hunter2").unwrap();
        let opened = sealed.open("hunter2").unwrap();
        assert_eq!(opened.as_bytes(), seed.as_bytes());
        assert!(matches!(sealed.open("wrong"), Err(KeyError::DecryptionFailed)));
    }

    #[test]
    fn password_hash_roundtrip() {
        let phc = hash_password("pw").unwrap();
        assert!(verify_password("pw", &phc));
        assert!(!verify_password("not pw", &phc));
        assert!(!verify_password("pw", "not a phc string"));
    }
}
