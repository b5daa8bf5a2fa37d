//! Secret keys in the format of
//! `nix-store --generate-binary-cache-key name path.secret path.pub`.
//!
//! [parse_keypair] produces `ed25519_dalek` keys, but [SigningKey] works
//! with any [ed25519::signature::Signer].

use data_encoding::BASE64;
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};

use super::{verifying_keys::validate_key_name, Signature, VerifyingKey};

pub struct SigningKey<S> {
    name: String,
    signing_key: S,
}

impl<S> SigningKey<S>
where
    S: ed25519::signature::Signer<ed25519::Signature>,
{
    pub fn new(name: String, signing_key: S) -> Self {
        Self { name, signing_key }
    }

    /// Signs a fingerprint, returning a [Signature] carrying this key's name.
    pub fn sign(&self, fp: &[u8]) -> Signature {
        Signature::new(self.name.clone(), self.signing_key.sign(fp).to_bytes())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Parses a `name:base64(secret || public)` secret key file.
pub fn parse_keypair(
    input: &str,
) -> Result<(SigningKey<ed25519_dalek::SigningKey>, VerifyingKey), Error> {
    let (name, bytes64) = input.split_once(':').ok_or(Error::MissingSeparator)?;

    if !validate_key_name(name) {
        return Err(Error::InvalidName(name.to_string()));
    }

    const DECODED_BYTES_LEN: usize = SECRET_KEY_LENGTH + PUBLIC_KEY_LENGTH;
    if bytes64.len() != BASE64.encode_len(DECODED_BYTES_LEN) {
        return Err(Error::InvalidSigningKeyLen(bytes64.len()));
    }

    let mut buf = [0; DECODED_BYTES_LEN + 2];
    let mut bytes = [0; DECODED_BYTES_LEN];
    match BASE64.decode_mut(bytes64.as_bytes(), &mut buf) {
        Ok(DECODED_BYTES_LEN) => {
            bytes.copy_from_slice(&buf[..DECODED_BYTES_LEN]);
        }
        Ok(n) => return Err(Error::InvalidSigningKeyLen(n)),
        Err(_) => return Err(Error::DecodeError(input.to_string())),
    }

    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(&bytes[..SECRET_KEY_LENGTH]);
    let mut public = [0u8; PUBLIC_KEY_LENGTH];
    public.copy_from_slice(&bytes[SECRET_KEY_LENGTH..]);

    let signing_key = SigningKey::new(
        name.to_string(),
        ed25519_dalek::SigningKey::from_bytes(&secret),
    );

    let verifying_key = VerifyingKey::new(
        name.to_string(),
        ed25519_dalek::VerifyingKey::from_bytes(&public).map_err(Error::InvalidVerifyingKey)?,
    );

    Ok((signing_key, verifying_key))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Missing separator")]
    MissingSeparator,
    #[error("Invalid signing key len: {0}")]
    InvalidSigningKeyLen(usize),
    #[error("Unable to base64-decode signing key: {0}")]
    DecodeError(String),
    #[error("VerifyingKey error: {0}")]
    InvalidVerifyingKey(ed25519_dalek::SignatureError),
}

#[cfg(test)]
mod test {
    use crate::narinfo::{DUMMY_KEYPAIR, DUMMY_VERIFYING_KEY};

    #[test]
    fn parse_and_sign() {
        let (signing_key, verifying_key) =
            super::parse_keypair(DUMMY_KEYPAIR).expect("must succeed");
        assert_eq!("do.not.use", signing_key.name());
        assert_eq!(DUMMY_VERIFYING_KEY, verifying_key.to_string());

        let sig = signing_key.sign(b"hello");
        assert!(verifying_key.verify("hello", &sig));
        assert!(!verifying_key.verify("goodbye", &sig));
    }

    #[test]
    fn parse_fail() {
        assert!(super::parse_keypair("cache.example.com-1:cCta2MEsRNuYCgWYyeRXLyfoFpKhQJKn8gLMeXWAb7vIpRKKo/3JoxJ24OYa3DxT2JVV38KjK/1ywHWuMe2JE").is_err());
        assert!(super::parse_keypair("cache.example.com-1cCta2MEsRNuYCgWYyeRXLyfoFpKhQJKn8gLMeXWAb7vIpRKKo/3JoxJ24OYa3DxT2JVV38KjK/1ywHWuMe2JE").is_err());
    }
}
