use serde::{Deserialize, Serialize};

use crate::derivation::OutputError;
use crate::nixhash::{self, CAHash, CAMethod, HashAlgo};
use crate::store_path::StorePath;

/// An output of a derivation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OutputRepr", into = "OutputRepr")]
pub enum Output {
    /// The path is computed from the derivation and its inputs.
    /// It's `None` before [super::Derivation::calculate_output_paths] ran.
    InputAddressed(Option<StorePath>),
    /// The contents are known upfront, the path follows from the hash.
    Fixed {
        path: Option<StorePath>,
        hash: CAHash,
    },
    /// Content-addressed, but the hash is only known after building.
    Floating { method: CAMethod, algo: HashAlgo },
}

impl Output {
    pub fn is_fixed(&self) -> bool {
        matches!(self, Output::Fixed { .. })
    }

    pub fn path(&self) -> Option<&StorePath> {
        match self {
            Output::InputAddressed(path) | Output::Fixed { path, .. } => path.as_ref(),
            Output::Floating { .. } => None,
        }
    }

    /// The output path as a string, `""` for unset output paths.
    pub fn path_str(&self) -> String {
        self.path()
            .map(StorePath::to_absolute_path)
            .unwrap_or_default()
    }

    /// The `hashAlgo` and `hash` fields of the ATerm output tuple.
    pub(crate) fn hash_fields(&self) -> (String, String) {
        match self {
            Output::InputAddressed(_) => (String::new(), String::new()),
            Output::Fixed { hash, .. } => (hash.algo_str(), hash.digest().to_plain_hex_string()),
            Output::Floating { method, algo } => {
                (format!("{}{}", method.algo_prefix(), algo), String::new())
            }
        }
    }

    /// Builds an [Output] from the fields of an ATerm output tuple.
    pub(crate) fn from_fields(path: &str, hash_algo: &str, hash: &str) -> Result<Self, OutputError> {
        let path = if path.is_empty() {
            None
        } else {
            Some(
                StorePath::from_absolute_path(path.as_bytes())
                    .map_err(|e| OutputError::InvalidOutputPath(path.to_string(), e))?,
            )
        };

        match (hash_algo.is_empty(), hash.is_empty()) {
            (true, true) => Ok(Output::InputAddressed(path)),
            (true, false) => Err(OutputError::MissingHashAlgo),
            (false, hash_empty) => {
                let (method, algo) =
                    CAMethod::parse_with_algo(hash_algo).map_err(OutputError::InvalidHash)?;
                if hash_empty {
                    if path.is_some() {
                        return Err(OutputError::FloatingWithPath);
                    }
                    return Ok(Output::Floating { method, algo });
                }
                let digest = nixhash::parse_non_sri_unprefixed(hash, algo)
                    .map_err(OutputError::InvalidHash)?;
                let hash = CAHash::from_method_and_hash(method, digest)
                    .map_err(OutputError::InvalidHash)?;
                Ok(Output::Fixed { path, hash })
            }
        }
    }

    pub fn validate(&self, validate_output_paths: bool) -> Result<(), OutputError> {
        match self {
            Output::Fixed {
                hash: hash @ CAHash::Text(_),
                ..
            } => return Err(OutputError::InvalidCAHash(hash.clone())),
            Output::InputAddressed(None) | Output::Fixed { path: None, .. }
                if validate_output_paths =>
            {
                return Err(OutputError::MissingOutputPath)
            }
            _ => {}
        }
        Ok(())
    }
}

/// The JSON shape of an output: `path`, `hashAlgo` and `hash`, with absent
/// fields omitted.
#[derive(Serialize, Deserialize)]
struct OutputRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(rename = "hashAlgo", default, skip_serializing_if = "Option::is_none")]
    hash_algo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

impl TryFrom<OutputRepr> for Output {
    type Error = OutputError;

    fn try_from(value: OutputRepr) -> Result<Self, Self::Error> {
        Output::from_fields(
            value.path.as_deref().unwrap_or_default(),
            value.hash_algo.as_deref().unwrap_or_default(),
            value.hash.as_deref().unwrap_or_default(),
        )
    }
}

impl From<Output> for OutputRepr {
    fn from(value: Output) -> Self {
        let (hash_algo, hash) = value.hash_fields();
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        OutputRepr {
            path: value.path().map(StorePath::to_absolute_path),
            hash_algo: non_empty(hash_algo),
            hash: non_empty(hash),
        }
    }
}
