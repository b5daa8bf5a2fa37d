use std::collections::BTreeSet;

use ferrix_compat::{
    narinfo::{self, NarInfo, Signature, SigningKey, VerifyingKey},
    nixhash::{self, CAHash, HashAlgo, NixHash},
    store_path::{build_ca_path, StorePath},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata of a valid store path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "PathInfoRecord", try_from = "PathInfoRecord")]
pub struct PathInfo {
    pub store_path: StorePath,
    pub nar_sha256: [u8; 32],
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    pub signatures: Vec<Signature>,
    pub ca: Option<CAHash>,
    /// Seconds since the epoch.
    pub registration_time: u64,
}

impl PathInfo {
    pub fn new(store_path: StorePath, nar_sha256: [u8; 32], nar_size: u64) -> Self {
        Self {
            store_path,
            nar_sha256,
            nar_size,
            references: BTreeSet::new(),
            deriver: None,
            signatures: vec![],
            ca: None,
            registration_time: 0,
        }
    }

    pub fn fingerprint(&self) -> String {
        narinfo::fingerprint(
            &self.store_path,
            &self.nar_sha256,
            self.nar_size,
            self.references.iter(),
        )
    }

    pub fn sign<S>(&mut self, signing_key: &SigningKey<S>)
    where
        S: ed25519::signature::Signer<ed25519::Signature>,
    {
        let sig = signing_key.sign(self.fingerprint().as_bytes());
        self.add_signatures([sig]);
    }

    /// Appends signatures not already present. Returns how many were new.
    pub fn add_signatures(&mut self, signatures: impl IntoIterator<Item = Signature>) -> usize {
        let mut added = 0;
        for sig in signatures {
            if !self.signatures.contains(&sig) {
                self.signatures.push(sig);
                added += 1;
            }
        }
        added
    }

    pub fn count_valid_signatures(&self, trusted_keys: &[VerifyingKey]) -> usize {
        let fingerprint = self.fingerprint();
        self.signatures
            .iter()
            .filter(|sig| trusted_keys.iter().any(|k| k.verify(&fingerprint, sig)))
            .count()
    }

    /// Whether the store path can be recomputed from the content address,
    /// which makes signatures unnecessary.
    pub fn is_content_addressed(&self) -> bool {
        let Some(ca) = &self.ca else {
            return false;
        };

        let self_reference = self.references.contains(&self.store_path);
        let references = self
            .references
            .iter()
            .filter(|r| *r != &self.store_path)
            .map(StorePath::to_absolute_path);

        match build_ca_path(self.store_path.name(), ca, references, self_reference) {
            Ok(computed) if computed == self.store_path => true,
            Ok(computed) => {
                debug!(
                    path = %self.store_path,
                    computed = %computed,
                    "content address does not match store path"
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Whether this path can be trusted, either through `sigs_needed`
    /// signatures from `trusted_keys` or by being content addressed.
    pub fn is_trusted(&self, trusted_keys: &[VerifyingKey], sigs_needed: usize) -> bool {
        self.is_content_addressed() || self.count_valid_signatures(trusted_keys) >= sigs_needed
    }

    /// Turns this into a narinfo pointing at a NAR file in a binary cache.
    pub fn to_narinfo(
        &self,
        url: String,
        compression: Option<String>,
        file_hash: Option<[u8; 32]>,
        file_size: Option<u64>,
    ) -> NarInfo {
        NarInfo {
            flags: narinfo::Flags::empty(),
            store_path: self.store_path.clone(),
            nar_hash: self.nar_sha256,
            nar_size: self.nar_size,
            references: self.references.iter().cloned().collect(),
            signatures: self.signatures.clone(),
            ca: self.ca.clone(),
            system: None,
            deriver: self.deriver.clone(),
            url,
            compression,
            file_hash,
            file_size,
        }
    }
}

impl From<&NarInfo> for PathInfo {
    fn from(value: &NarInfo) -> Self {
        Self {
            store_path: value.store_path.clone(),
            nar_sha256: value.nar_hash,
            nar_size: value.nar_size,
            references: value.references.iter().cloned().collect(),
            deriver: value.deriver.clone(),
            signatures: value.signatures.clone(),
            ca: value.ca.clone(),
            registration_time: 0,
        }
    }
}

/// The JSON form written by [crate::LocalStore], close to `nix path-info --json`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathInfoRecord {
    path: StorePath,
    nar_hash: String,
    nar_size: u64,
    references: BTreeSet<StorePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deriver: Option<StorePath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ca: Option<String>,
    #[serde(default)]
    registration_time: u64,
}

impl From<PathInfo> for PathInfoRecord {
    fn from(value: PathInfo) -> Self {
        Self {
            path: value.store_path,
            nar_hash: NixHash::Sha256(value.nar_sha256).to_sri_string(),
            nar_size: value.nar_size,
            references: value.references,
            deriver: value.deriver,
            signatures: value.signatures.iter().map(ToString::to_string).collect(),
            ca: value.ca.as_ref().map(CAHash::to_nix_nixbase32_string),
            registration_time: value.registration_time,
        }
    }
}

impl TryFrom<PathInfoRecord> for PathInfo {
    type Error = String;

    fn try_from(value: PathInfoRecord) -> Result<Self, Self::Error> {
        let nar_sha256 = match nixhash::parse_any(&value.nar_hash, Some(HashAlgo::Sha256)) {
            Ok(NixHash::Sha256(digest)) => digest,
            Ok(other) => return Err(format!("narHash must be sha256, got {}", other.algo())),
            Err(e) => return Err(format!("invalid narHash: {e}")),
        };

        let signatures = value
            .signatures
            .iter()
            .map(|s| Signature::parse(s).map_err(|e| format!("invalid signature {s}: {e}")))
            .collect::<Result<Vec<_>, _>>()?;

        let ca = value
            .ca
            .map(|s| CAHash::from_nix_nixbase32_str(&s).ok_or_else(|| format!("invalid ca: {s}")))
            .transpose()?;

        Ok(Self {
            store_path: value.path,
            nar_sha256,
            nar_size: value.nar_size,
            references: value.references,
            deriver: value.deriver,
            signatures,
            ca,
            registration_time: value.registration_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use ferrix_compat::{
        narinfo::{parse_keypair, NarInfo, VerifyingKey},
        nixhash::{CAHash, NixHash},
        store_path::{build_ca_path, StorePath},
    };
    use pretty_assertions::assert_eq;

    use super::PathInfo;
    use crate::tests::fixtures::{DUMMY_KEYPAIR, NARINFO_CURL};

    #[test]
    fn json_roundtrip() {
        let narinfo = NarInfo::parse(NARINFO_CURL).unwrap();
        let mut info = PathInfo::from(&narinfo);
        info.registration_time = 1700000000;

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            "sha256-QHvNm2CLenj5iFkwws4fyvrgl30xzNQ/wemYy0damqw=",
            json["narHash"]
        );
        assert_eq!(
            "/nix/store/syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin",
            json["path"]
        );
        assert_eq!(info, serde_json::from_value(json).unwrap());
    }

    #[test]
    fn narinfo_roundtrip() {
        let narinfo = NarInfo::parse(NARINFO_CURL).unwrap();
        let info = PathInfo::from(&narinfo);
        assert_eq!(narinfo.fingerprint(), info.fingerprint());

        let back = info.to_narinfo(
            narinfo.url.clone(),
            narinfo.compression.clone(),
            narinfo.file_hash,
            narinfo.file_size,
        );
        assert_eq!(narinfo.to_string(), back.to_string());
    }

    #[test]
    fn trusted_by_signature() {
        let narinfo = NarInfo::parse(NARINFO_CURL).unwrap();
        let info = PathInfo::from(&narinfo);
        let cache_key =
            VerifyingKey::parse("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")
                .unwrap();

        assert_eq!(1, info.count_valid_signatures(&[cache_key.clone()]));
        assert!(info.is_trusted(&[cache_key.clone()], 1));
        assert!(!info.is_trusted(&[cache_key], 2));
        assert!(!info.is_trusted(&[], 1));
    }

    #[test]
    fn sign_adds_once() {
        let (signing_key, verifying_key) = parse_keypair(DUMMY_KEYPAIR).unwrap();
        let mut info = PathInfo::new(
            StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432")
                .unwrap(),
            [1; 32],
            42,
        );

        info.sign(&signing_key);
        info.sign(&signing_key);
        assert_eq!(1, info.signatures.len());
        assert_eq!(1, info.count_valid_signatures(&[verifying_key]));
    }

    #[test]
    fn content_addressed() {
        let ca = CAHash::Nar(NixHash::Sha256([7; 32]));
        let path = build_ca_path("source", &ca, Vec::<String>::new(), false).unwrap();
        let mut info = PathInfo::new(path, [7; 32], 100);
        assert!(!info.is_content_addressed());

        info.ca = Some(ca);
        assert!(info.is_content_addressed());
        assert!(info.is_trusted(&[], 1));

        info.ca = Some(CAHash::Nar(NixHash::Sha256([8; 32])));
        assert!(!info.is_content_addressed());
    }
}
