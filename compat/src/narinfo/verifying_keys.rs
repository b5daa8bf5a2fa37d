//! Public keys as used in `trusted-public-keys`, verifying signatures on
//! narinfo files.

use std::fmt::Display;

use data_encoding::BASE64;
use ed25519_dalek::PUBLIC_KEY_LENGTH;

use super::Signature;

/// An ed25519 public key and its name, written as `name:base64`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    name: String,
    verifying_key: ed25519_dalek::VerifyingKey,
}

/// Key names are alphanumeric, plus `-` and `.`.
pub(super) fn validate_key_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| char::is_alphanumeric(c) || c == '-' || c == '.')
}

impl VerifyingKey {
    pub fn new(name: String, verifying_key: ed25519_dalek::VerifyingKey) -> Self {
        Self {
            name,
            verifying_key,
        }
    }

    pub fn parse(input: &str) -> Result<Self, Error> {
        let (name, bytes64) = input.split_once(':').ok_or(Error::MissingSeparator)?;

        if !validate_key_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        if bytes64.len() != BASE64.encode_len(PUBLIC_KEY_LENGTH) {
            return Err(Error::InvalidVerifyingKeyLen(bytes64.len()));
        }

        let mut buf = [0; PUBLIC_KEY_LENGTH + 1];
        let mut bytes = [0; PUBLIC_KEY_LENGTH];
        match BASE64.decode_mut(bytes64.as_bytes(), &mut buf) {
            Ok(PUBLIC_KEY_LENGTH) => {
                bytes.copy_from_slice(&buf[..PUBLIC_KEY_LENGTH]);
            }
            Ok(n) => return Err(Error::InvalidVerifyingKeyLen(n)),
            Err(_) => return Err(Error::DecodeError(input.to_string())),
        }

        let verifying_key =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(Error::InvalidVerifyingKey)?;

        Ok(Self {
            name: name.to_string(),
            verifying_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `signature` was made over `fingerprint` by the key behind
    /// [Self]. The signature name has to match the key name.
    pub fn verify(&self, fingerprint: &str, signature: &Signature) -> bool {
        if self.name() != signature.name() {
            return false;
        }

        signature.verify(fingerprint.as_bytes(), &self.verifying_key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Missing separator")]
    MissingSeparator,
    #[error("Invalid pubkey len: {0}")]
    InvalidVerifyingKeyLen(usize),
    #[error("VerifyingKey error: {0}")]
    InvalidVerifyingKey(ed25519_dalek::SignatureError),
    #[error("Unable to base64-decode pubkey: {0}")]
    DecodeError(String),
}

impl Display for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.name,
            BASE64.encode(self.verifying_key.as_bytes())
        )
    }
}

#[cfg(test)]
mod test {
    use data_encoding::BASE64;
    use rstest::rstest;

    use super::VerifyingKey;
    use crate::narinfo::Signature;

    const FINGERPRINT: &str = "1;/nix/store/syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin;sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0;196040;/nix/store/0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0,/nix/store/6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115,/nix/store/j5jxw3iy7bbz4a57fh9g2xm2gxmyal8h-zlib-1.2.12,/nix/store/yxvjs9drzsphm9pcf42a4byzj1kb9m7k-openssl-1.1.1n";

    #[rstest]
    #[case::cache_nixos_org("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=", "cache.nixos.org-1")]
    #[case::other_name("cheesecake:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=", "cheesecake")]
    fn parse(#[case] input: &str, #[case] exp_name: &str) {
        let pubkey = VerifyingKey::parse(input).expect("must parse");
        assert_eq!(exp_name, pubkey.name());
        assert_eq!(
            BASE64
                .decode(b"6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")
                .unwrap(),
            pubkey.verifying_key.as_bytes()
        );
        assert_eq!(input, pubkey.to_string());
    }

    #[rstest]
    #[case::empty_name(":6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")]
    #[case::no_separator("6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")]
    #[case::missing_padding("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY")]
    #[case::wrong_length("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDS")]
    fn parse_fail(#[case] input: &str) {
        VerifyingKey::parse(input).expect_err("must fail");
    }

    #[rstest]
    #[case::correct("cache.nixos.org-1:TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==", true)]
    #[case::name_mismatch("cache.nixos.org:TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==", false)]
    fn verify(#[case] signature: &str, #[case] expected: bool) {
        let pubkey =
            VerifyingKey::parse("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")
                .expect("must parse");
        let signature = Signature::parse(signature).expect("must parse");

        assert_eq!(expected, pubkey.verify(FINGERPRINT, &signature));
    }
}
