use crate::nixbase32::{self, Nixbase32DecodeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, path::PathBuf, str::FromStr};

mod utils;

pub use utils::*;

pub const DIGEST_SIZE: usize = 20;
pub const ENCODED_DIGEST_SIZE: usize = nixbase32::encode_len(DIGEST_SIZE);

/// The longest name a store path may carry.
pub const MAX_NAME_LEN: usize = 211;

// The store dir prefix, without trailing slash.
// That's usually where the Nix store is mounted at.
pub const STORE_DIR: &str = "/nix/store";
pub const STORE_DIR_WITH_SLASH: &str = "/nix/store/";

/// The suffix derivation store paths carry in their name.
pub const DRV_EXTENSION: &str = ".drv";

/// Errors that can occur when parsing a literal store path
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Dash is missing between hash and name")]
    MissingDash,
    #[error("Hash encoding is invalid: {0}")]
    InvalidHashEncoding(Nixbase32DecodeError),
    #[error("Invalid length")]
    InvalidLength,
    #[error("Invalid name: \"{0}\", character at position {1} is invalid")]
    InvalidName(String, usize),
    #[error("Name \"{0}\" is longer than {MAX_NAME_LEN} characters")]
    NameTooLong(String),
    #[error("Path '{0}' is not in the Nix store")]
    MissingStoreDir(String),
}

/// Represents a path in the Nix store (a direct child of [STORE_DIR]).
///
/// It consists of a digest (20 bytes), and a name, which is a string.
/// The name may only contain ASCII alphanumeric, or one of the following
/// characters: `-`, `_`, `.`, `+`, `?`, `=`.
/// Derivation paths are store paths whose names end with [DRV_EXTENSION].
///
/// A [StorePath] does not encode any additional subpath "inside" the store
/// path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorePath {
    digest: [u8; DIGEST_SIZE],
    name: String,
}

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered like the string representation: nixbase32 starts with the last
/// byte of the digest.
impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.digest
            .iter()
            .rev()
            .cmp(other.digest.iter().rev())
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl FromStr for StorePath {
    type Err = Error;

    /// Construct a [StorePath] by passing the `$digest-$name` string
    /// that comes after [STORE_DIR_WITH_SLASH].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl StorePath {
    /// Construct a [StorePath] by passing the `$digest-$name` string
    /// that comes after [STORE_DIR_WITH_SLASH].
    pub fn from_bytes(s: &[u8]) -> Result<StorePath, Error> {
        // the whole string needs to be at least:
        //
        // - 32 characters (encoded hash)
        // - 1 dash
        // - 1 character for the name
        if s.len() < ENCODED_DIGEST_SIZE + 2 {
            Err(Error::InvalidLength)?
        }

        let digest = nixbase32::decode_fixed(&s[..ENCODED_DIGEST_SIZE])
            .map_err(Error::InvalidHashEncoding)?;

        if s[ENCODED_DIGEST_SIZE] != b'-' {
            return Err(Error::MissingDash);
        }

        Ok(StorePath {
            name: validate_name(&s[ENCODED_DIGEST_SIZE + 1..])?,
            digest,
        })
    }

    /// Construct a [StorePath] from an absolute store path string.
    /// This is equivalent to calling [StorePath::from_bytes], but stripping the
    /// [STORE_DIR_WITH_SLASH] prefix before.
    pub fn from_absolute_path(s: &[u8]) -> Result<StorePath, Error> {
        match s.strip_prefix(STORE_DIR_WITH_SLASH.as_bytes()) {
            Some(s_stripped) => Self::from_bytes(s_stripped),
            None => Err(Error::MissingStoreDir(
                String::from_utf8_lossy(s).into_owned(),
            )),
        }
    }

    /// Construct a [StorePath] from a name and digest.
    pub fn from_name_and_digest(name: &str, digest: &[u8]) -> Result<StorePath, Error> {
        Ok(Self {
            name: validate_name(name.as_bytes())?,
            digest: digest.try_into().map_err(|_| Error::InvalidLength)?,
        })
    }

    /// Decompose an absolute path into a [StorePath] and the path inside
    /// it, which is empty if `s` points to the store path itself.
    pub fn from_absolute_path_full(s: &str) -> Result<(StorePath, PathBuf), Error> {
        let rest = s
            .strip_prefix(STORE_DIR_WITH_SLASH)
            .ok_or_else(|| Error::MissingStoreDir(s.to_string()))?;

        let (first, inner) = match rest.split_once('/') {
            Some((first, inner)) => (first, inner),
            None => (rest, ""),
        };

        Ok((StorePath::from_bytes(first.as_bytes())?, PathBuf::from(inner)))
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The nixbase32-encoded digest, the part before the first dash.
    pub fn hash_part(&self) -> String {
        nixbase32::encode(&self.digest)
    }

    /// Whether this is the path of a derivation, by the `.drv` suffix convention.
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(DRV_EXTENSION)
    }

    /// Converts the [StorePath] to an absolute store path string.
    /// That is just the string representation, prefixed with the store prefix
    /// ([STORE_DIR_WITH_SLASH]),
    pub fn to_absolute_path(&self) -> String {
        format!("{}{}", STORE_DIR_WITH_SLASH, self)
    }
}

/// Checks a given &[u8] to match the restrictions for [StorePath::name], and
/// returns the name as string if successful.
pub(crate) fn validate_name(s: &[u8]) -> Result<String, Error> {
    // Empty names are not allowed.
    if s.is_empty() {
        return Err(Error::InvalidLength);
    }

    for (i, c) in s.iter().enumerate() {
        if c.is_ascii_alphanumeric()
            || (*c == b'.' && i != 0) // can't start with a dot
            || *c == b'-'
            || *c == b'_'
            || *c == b'+'
            || *c == b'?'
            || *c == b'='
        {
            continue;
        }

        return Err(Error::InvalidName(
            String::from_utf8_lossy(s).into_owned(),
            i,
        ));
    }

    // only ASCII made it past the loop.
    let name = String::from_utf8_lossy(s).into_owned();
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name));
    }

    Ok(name)
}

impl fmt::Display for StorePath {
    /// The string representation of a store path starts with a digest (20
    /// bytes), [crate::nixbase32]-encoded, followed by a `-`,
    /// and ends with the name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", nixbase32::encode(&self.digest), self.name)
    }
}

impl Serialize for StorePath {
    /// Serialized as the absolute path.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_absolute_path())
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorePath::from_absolute_path(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::nixbase32;
    use crate::store_path::{DIGEST_SIZE, ENCODED_DIGEST_SIZE};
    use hex_literal::hex;
    use rstest::rstest;

    use super::{Error, StorePath};

    const NET_TOOLS: &str = "00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432";

    #[test]
    fn encoded_digest_size() {
        assert_eq!(ENCODED_DIGEST_SIZE, nixbase32::encode_len(DIGEST_SIZE));
    }

    #[test]
    fn happy_path() {
        let nixpath = StorePath::from_bytes(NET_TOOLS.as_bytes()).expect("must parse");

        assert_eq!("net-tools-1.60_p20170221182432", nixpath.name());
        assert_eq!(
            &hex!("8a12321522fd91efbd60ebb2481af88580f61600"),
            nixpath.digest()
        );
        assert_eq!("00bgd045z0d4icpbc2yyz4gx48ak44la", nixpath.hash_part());
        assert!(!nixpath.is_derivation());

        assert_eq!(NET_TOOLS, nixpath.to_string())
    }

    #[rstest]
    // rejected when adding an empty `.gitignore` file to the store.
    #[case::starts_with_dot("fli4bwscgna7lpm7v5xgnjxrxh0yc7ra-.gitignore")]
    #[case::short_hash("00bgd045z0d4icpbc2yy-net-tools-1.60_p20170221182432")]
    #[case::invalid_encoding("00bgd045z0d4icpbc2yyz4gx48aku4la-net-tools-1.60_p20170221182432")]
    #[case::subpath("00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432/bin/arp")]
    #[case::no_dash("00bgd045z0d4icpbc2yyz4gx48ak44lanet-tools-1.60_p20170221182432")]
    fn invalid(#[case] s: &str) {
        StorePath::from_bytes(s.as_bytes()).expect_err("must fail");
    }

    #[test]
    fn name_too_long() {
        let s = format!("00bgd045z0d4icpbc2yyz4gx48ak44la-{}", "a".repeat(212));
        assert!(matches!(
            StorePath::from_bytes(s.as_bytes()),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn derivation_suffix() {
        let p = StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-foo.drv").expect("must parse");
        assert!(p.is_derivation());
    }

    #[test]
    fn absolute_path() {
        let expected = StorePath::from_bytes(NET_TOOLS.as_bytes()).expect("must parse");
        let actual = StorePath::from_absolute_path(format!("/nix/store/{NET_TOOLS}").as_bytes())
            .expect("must parse");

        assert_eq!(expected, actual);
        assert_eq!(format!("/nix/store/{NET_TOOLS}"), actual.to_absolute_path());
    }

    #[test]
    fn absolute_path_missing_prefix() {
        assert_eq!(
            Error::MissingStoreDir("foobar-123".into()),
            StorePath::from_absolute_path(b"foobar-123").expect_err("must fail")
        );
    }

    #[rstest]
    #[case::bare("", "")]
    #[case::trailing_slash("/", "")]
    #[case::subpath("/bin/arp", "bin/arp")]
    #[case::subpath_trailing_slash("/bin/arp/", "bin/arp/")]
    fn from_absolute_path_full(#[case] suffix: &str, #[case] inner: &str) {
        let (path, rest) =
            StorePath::from_absolute_path_full(&format!("/nix/store/{NET_TOOLS}{suffix}"))
                .expect("must succeed");
        assert_eq!(NET_TOOLS, path.to_string());
        assert_eq!(PathBuf::from(inner), rest);
    }

    #[test]
    fn from_absolute_path_errors() {
        assert_eq!(
            Error::InvalidLength,
            StorePath::from_absolute_path_full("/nix/store/").expect_err("must fail")
        );
        assert_eq!(
            Error::InvalidLength,
            StorePath::from_absolute_path_full("/nix/store/foo").expect_err("must fail")
        );
        assert!(matches!(
            StorePath::from_absolute_path_full(NET_TOOLS),
            Err(Error::MissingStoreDir(_))
        ));
    }

    #[test]
    fn ordered_like_strings() {
        let mut paths: Vec<StorePath> = [
            "s32cldbh9pfzd9z82izi12mdlrw0yf8q-libidn2-2.3.7",
            "7n0mbqydcipkpbxm24fab066lxk68aqk-libunistring-1.1",
            "rxganm4ibf31qngal3j3psp20mak37yy-xgcc-13.2.0-libgcc",
            "dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1",
        ]
        .iter()
        .map(|s| s.parse().expect("must parse"))
        .collect();
        paths.sort();

        let mut strings: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let sorted = strings.clone();
        strings.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn serde_absolute() {
        let p = StorePath::from_bytes(NET_TOOLS.as_bytes()).expect("must parse");
        let json = serde_json::to_string(&p).expect("serialize");
        assert_eq!(format!("\"/nix/store/{NET_TOOLS}\""), json);
        assert_eq!(p, serde_json::from_str::<StorePath>(&json).expect("deserialize"));
    }
}
