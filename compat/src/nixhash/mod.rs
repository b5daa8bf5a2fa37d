use crate::nixbase32;
use data_encoding::{BASE64, BASE64_NOPAD, HEXLOWER, HEXLOWER_PERMISSIVE};
use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

mod algos;
mod ca_hash;

pub use algos::HashAlgo;
pub use ca_hash::{CAHash, CAMethod};

/// NixHash represents hashes known by Nix.
///
/// The digest length always matches the algorithm, it's part of the type.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum NixHash {
    Md5([u8; 16]),
    Sha1([u8; 20]),
    Sha256([u8; 32]),
    Sha512(Box<[u8; 64]>),
}

/// The textual encodings a digest can be printed in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashEncoding {
    Base16,
    Nixbase32,
    Base64,
    /// `$algo-$base64`, the algo is always included.
    Sri,
}

/// convenience Result type for all nixhash parsing Results.
pub type Result<V> = std::result::Result<V, Error>;

impl NixHash {
    /// returns the algo as [HashAlgo].
    pub fn algo(&self) -> HashAlgo {
        match self {
            NixHash::Md5(_) => HashAlgo::Md5,
            NixHash::Sha1(_) => HashAlgo::Sha1,
            NixHash::Sha256(_) => HashAlgo::Sha256,
            NixHash::Sha512(_) => HashAlgo::Sha512,
        }
    }

    /// returns the digest as variable-length byte slice.
    pub fn digest_as_bytes(&self) -> &[u8] {
        match self {
            NixHash::Md5(digest) => digest,
            NixHash::Sha1(digest) => digest,
            NixHash::Sha256(digest) => digest,
            NixHash::Sha512(digest) => digest.as_ref(),
        }
    }

    /// Prints the digest in the requested encoding, optionally prefixed by
    /// `$algo:`. [HashEncoding::Sri] always carries the algo.
    pub fn encode(&self, encoding: HashEncoding, include_algo: bool) -> String {
        let digest = self.digest_as_bytes();
        let encoded = match encoding {
            HashEncoding::Base16 => HEXLOWER.encode(digest),
            HashEncoding::Nixbase32 => nixbase32::encode(digest),
            HashEncoding::Base64 => BASE64.encode(digest),
            HashEncoding::Sri => return format!("{}-{}", self.algo(), BASE64.encode(digest)),
        };

        if include_algo {
            format!("{}:{}", self.algo(), encoded)
        } else {
            encoded
        }
    }

    /// Formats a [NixHash] as `$algo:$lowerhex`, the form used in store path
    /// fingerprints and derivation ATerms.
    pub fn to_nix_hex_string(&self) -> String {
        self.encode(HashEncoding::Base16, true)
    }

    /// Formats a [NixHash] as `$algo:$nixbase32`, the form used inside
    /// [CAHash] and narinfo files.
    pub fn to_nix_nixbase32_string(&self) -> String {
        self.encode(HashEncoding::Nixbase32, true)
    }

    /// Returns the digest as a hex string -- without any algorithm prefix.
    pub fn to_plain_hex_string(&self) -> String {
        HEXLOWER.encode(self.digest_as_bytes())
    }

    pub fn to_sri_string(&self) -> String {
        self.encode(HashEncoding::Sri, true)
    }
}

impl Ord for NixHash {
    /// Orders by digest length first, then bytewise.
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.digest_as_bytes(), other.digest_as_bytes());
        a.len()
            .cmp(&b.len())
            .then_with(|| a.cmp(b))
            .then_with(|| self.algo().cmp(&other.algo()))
    }
}

impl PartialOrd for NixHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NixHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_nix_nixbase32_string())
    }
}

impl FromStr for NixHash {
    type Err = Error;

    /// Parses any hash string that carries its algorithm inline.
    fn from_str(s: &str) -> Result<Self> {
        parse_any(s, None)
    }
}

impl Serialize for NixHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_sri_string())
    }
}

impl<'de> Deserialize<'de> for NixHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_any(&s, None).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<(HashAlgo, &[u8])> for NixHash {
    type Error = Error;

    /// Constructs a new [NixHash] by specifying [HashAlgo] and digest.
    /// It can fail if the passed digest length doesn't match what's expected for
    /// the passed algo.
    fn try_from(value: (HashAlgo, &[u8])) -> Result<Self> {
        let (algo, digest) = value;
        from_algo_and_digest(algo, digest)
    }
}

/// Constructs a new [NixHash] by specifying [HashAlgo] and digest.
/// It can fail if the passed digest length doesn't match what's expected for
/// the passed algo.
pub fn from_algo_and_digest(algo: HashAlgo, digest: &[u8]) -> Result<NixHash> {
    let wrong_len = |_| Error::InvalidDigestLength(digest.len(), algo);

    Ok(match algo {
        HashAlgo::Md5 => NixHash::Md5(digest.try_into().map_err(wrong_len)?),
        HashAlgo::Sha1 => NixHash::Sha1(digest.try_into().map_err(wrong_len)?),
        HashAlgo::Sha256 => NixHash::Sha256(digest.try_into().map_err(wrong_len)?),
        HashAlgo::Sha512 => NixHash::Sha512(Box::new(digest.try_into().map_err(wrong_len)?)),
    })
}

/// Hashes the given bytes with the given algorithm.
pub fn hash_bytes(algo: HashAlgo, data: impl AsRef<[u8]>) -> NixHash {
    let data = data.as_ref();
    match algo {
        HashAlgo::Md5 => NixHash::Md5(Md5::digest(data).into()),
        HashAlgo::Sha1 => NixHash::Sha1(Sha1::digest(data).into()),
        HashAlgo::Sha256 => NixHash::Sha256(Sha256::digest(data).into()),
        HashAlgo::Sha512 => {
            let mut digest = [0u8; 64];
            digest.copy_from_slice(&Sha512::digest(data));
            NixHash::Sha512(Box::new(digest))
        }
    }
}

/// Folds an arbitrarily long byte sequence into `OUTPUT_SIZE` bytes, by
/// XOR'ing every input byte into the output position it lands on when
/// cycling through the (zero-initialized) output buffer.
///
/// This is not collision resistant. It only exists for the shortened
/// digests in store paths.
pub fn compress_hash<const OUTPUT_SIZE: usize>(input: &[u8]) -> [u8; OUTPUT_SIZE] {
    let mut output = [0; OUTPUT_SIZE];

    for (ii, ch) in input.iter().enumerate() {
        output[ii % OUTPUT_SIZE] ^= ch;
    }

    output
}

/// Errors related to NixHash construction.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid hash algo: {0}")]
    InvalidAlgo(String),
    #[error("invalid SRI string: {0}")]
    InvalidSRI(String),
    #[error("invalid digest length '{0}' for algo {1}")]
    InvalidDigestLength(usize, HashAlgo),
    #[error("hash '{0}' has wrong length for hash algo {1}")]
    InvalidEncodedDigestLength(String, HashAlgo),
    #[error("invalid base16 encoding in '{0}'")]
    InvalidBase16Encoding(String),
    #[error("invalid base32 encoding in '{0}'")]
    InvalidBase32Encoding(String),
    #[error("invalid base64 encoding in '{0}'")]
    InvalidBase64Encoding(String),
    #[error("conflicting hash algo: {0} (hash_algo) vs {1} (inline)")]
    ConflictingHashAlgos(HashAlgo, HashAlgo),
    #[error("hash '{0}' does not include a type, nor is the type otherwise known from context")]
    MissingInlineHashAlgo(String),
}

/// Parses a hash string in any of the accepted forms:
///
/// - SRI: `sha256-$base64`
/// - Nix hash strings: `sha256:$digest`
/// - bare digests, in which case `algo` must be passed
///
/// Digests can be base16, nixbase32 or base64, told apart by their length.
/// If the algo is present both inline and in `algo`, they must agree.
pub fn parse_any(s: &str, algo: Option<HashAlgo>) -> Result<NixHash> {
    let parsed = if s.split_once('-').is_some_and(|(p, _)| is_algo_name(p)) {
        parse_sri(s)?
    } else if let Some((prefix, rest)) = s.split_once(':').filter(|(p, _)| is_algo_name(p)) {
        decode_digest(rest, HashAlgo::try_from(prefix)?)?
    } else {
        return match algo {
            None => Err(Error::MissingInlineHashAlgo(s.to_string())),
            Some(algo) => decode_digest(s, algo),
        };
    };

    if let Some(algo) = algo {
        if algo != parsed.algo() {
            return Err(Error::ConflictingHashAlgos(algo, parsed.algo()));
        }
    }
    Ok(parsed)
}

/// Parses a bare digest of a known algorithm, in any of the three encodings.
pub fn parse_non_sri_unprefixed(s: &str, algo: HashAlgo) -> Result<NixHash> {
    decode_digest(s, algo)
}

fn is_algo_name(s: &str) -> bool {
    algos::SUPPORTED_ALGOS.contains(&s)
}

/// Parses a Nix SRI string to a NixHash.
///
/// Only a single hash is supported, and trailing `=` padding is accepted in
/// any amount.
pub fn parse_sri(s: &str) -> Result<NixHash> {
    let (algo, encoded_digest) = s
        .split_once('-')
        .ok_or_else(|| Error::InvalidSRI(s.to_string()))?;
    let algo = HashAlgo::try_from(algo)?;

    let encoded_digest = encoded_digest.trim_end_matches('=');

    // without padding, the trailing bits can't be checked either.
    let mut spec = BASE64_NOPAD.specification();
    spec.check_trailing_bits = false;
    let encoder = spec
        .encoding()
        .map_err(|_| Error::InvalidSRI(s.to_string()))?;

    if encoded_digest.len() != encoder.encode_len(algo.digest_length()) {
        return Err(Error::InvalidEncodedDigestLength(s.to_string(), algo));
    }

    let digest = encoder
        .decode(encoded_digest.as_bytes())
        .map_err(|_| Error::InvalidBase64Encoding(s.to_string()))?;

    from_algo_and_digest(algo, &digest)
}

/// Decodes a digest of the given algo. The encoding is derived from the length.
fn decode_digest(s: &str, algo: HashAlgo) -> Result<NixHash> {
    let len = algo.digest_length();
    let digest = if s.len() == HEXLOWER.encode_len(len) {
        HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidBase16Encoding(s.to_string()))?
    } else if s.len() == nixbase32::encode_len(len) {
        nixbase32::decode(s).map_err(|_| Error::InvalidBase32Encoding(s.to_string()))?
    } else if s.len() == BASE64.encode_len(len) {
        BASE64
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidBase64Encoding(s.to_string()))?
    } else {
        return Err(Error::InvalidEncodedDigestLength(s.to_string(), algo));
    };

    from_algo_and_digest(algo, &digest)
}
