use crate::nixbase32;
use crate::nixhash::{self, HashAlgo, NixHash};
use std::borrow::Cow;
use std::fmt;

/// How the contents of a content-addressed path were hashed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CAMethod {
    /// The flat file contents.
    Flat,
    /// The NAR serialization of the path ("recursive").
    Nar,
    /// A text file, hashed like a flat file, that may carry references.
    Text,
}

impl CAMethod {
    /// The prefix used in front of the algo in derivation outputs, `r:` for
    /// [CAMethod::Nar], `text:` for [CAMethod::Text].
    pub fn algo_prefix(&self) -> &'static str {
        match self {
            CAMethod::Flat => "",
            CAMethod::Nar => "r:",
            CAMethod::Text => "text:",
        }
    }

    /// Splits a derivation output `hashAlgo` field (`r:sha256`, `sha1`,
    /// `text:sha256`) into method and algo.
    pub fn parse_with_algo(s: &str) -> Result<(CAMethod, HashAlgo), nixhash::Error> {
        let (method, algo) = if let Some(rest) = s.strip_prefix("r:") {
            (CAMethod::Nar, rest)
        } else if let Some(rest) = s.strip_prefix("text:") {
            (CAMethod::Text, rest)
        } else {
            (CAMethod::Flat, s)
        };

        Ok((method, HashAlgo::try_from(algo)?))
    }
}

/// A Nix CAHash describes a content-addressed hash of a path.
///
/// `Flat` and `Nar` support all algos [NixHash] supports, `Text` only sha256.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CAHash {
    Flat(NixHash),  // "fixed flat"
    Nar(NixHash),   // "fixed recursive"
    Text([u8; 32]), // "text", only supports sha256
}

impl CAHash {
    pub fn digest(&self) -> Cow<NixHash> {
        match *self {
            CAHash::Flat(ref digest) => Cow::Borrowed(digest),
            CAHash::Nar(ref digest) => Cow::Borrowed(digest),
            CAHash::Text(digest) => Cow::Owned(NixHash::Sha256(digest)),
        }
    }

    pub fn method(&self) -> CAMethod {
        match self {
            CAHash::Flat(_) => CAMethod::Flat,
            CAHash::Nar(_) => CAMethod::Nar,
            CAHash::Text(_) => CAMethod::Text,
        }
    }

    /// Combines a method with a digest. Text hashes must be sha256.
    pub fn from_method_and_hash(method: CAMethod, hash: NixHash) -> Result<Self, nixhash::Error> {
        Ok(match (method, hash) {
            (CAMethod::Flat, h) => CAHash::Flat(h),
            (CAMethod::Nar, h) => CAHash::Nar(h),
            (CAMethod::Text, NixHash::Sha256(digest)) => CAHash::Text(digest),
            (CAMethod::Text, h) => {
                return Err(nixhash::Error::ConflictingHashAlgos(HashAlgo::Sha256, h.algo()))
            }
        })
    }

    /// The `hashAlgo` field of a fixed derivation output, like `r:sha256`.
    pub fn algo_str(&self) -> String {
        format!("{}{}", self.method().algo_prefix(), self.digest().algo())
    }

    /// Parses the textual representation used in narinfo `CA` fields, one of:
    /// - `text:sha256:$nixbase32sha256digest`
    /// - `fixed:r:$algo:$nixbase32digest`
    /// - `fixed:$algo:$nixbase32digest`
    pub fn from_nix_nixbase32_str(s: &str) -> Option<Self> {
        let (tag, s) = s.split_once(':')?;

        match tag {
            "text" => {
                let digest = s.strip_prefix("sha256:")?;
                nixbase32::decode_fixed(digest).ok().map(CAHash::Text)
            }
            "fixed" => {
                if let Some(s) = s.strip_prefix("r:") {
                    parse_nixbase32_hash(s).map(CAHash::Nar)
                } else {
                    parse_nixbase32_hash(s).map(CAHash::Flat)
                }
            }
            _ => None,
        }
    }

    /// The inverse of [Self::from_nix_nixbase32_str].
    pub fn to_nix_nixbase32_string(&self) -> String {
        match self {
            CAHash::Flat(nh) => format!("fixed:{}", nh.to_nix_nixbase32_string()),
            CAHash::Nar(nh) => format!("fixed:r:{}", nh.to_nix_nixbase32_string()),
            CAHash::Text(digest) => {
                format!("text:sha256:{}", nixbase32::encode(digest))
            }
        }
    }
}

impl fmt::Display for CAHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_nix_nixbase32_string())
    }
}

fn parse_nixbase32_hash(s: &str) -> Option<NixHash> {
    let (algo, digest) = s.split_once(':')?;
    let algo = HashAlgo::try_from(algo).ok()?;
    if digest.len() != nixbase32::encode_len(algo.digest_length()) {
        return None;
    }
    nixhash::from_algo_and_digest(algo, &nixbase32::decode(digest).ok()?).ok()
}
