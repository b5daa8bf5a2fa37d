//! Derived paths name either a store path that already exists, or some
//! outputs of a derivation that may still need to be built.
//!
//! Two textual syntaxes exist: the current one uses `^` between the
//! derivation path and the outputs (`/nix/store/…-foo.drv^out,dev`), the
//! legacy one uses `!`.

use std::fmt;
use std::str::FromStr;

use serde_json::json;

use crate::store_path::{self, StorePath};

mod outputs_spec;
mod with_outputs;

pub use outputs_spec::{parse_with_extended_outputs, ExtendedOutputsSpec, OutputNames, OutputsSpec};
pub use with_outputs::StorePathWithOutputs;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid store path: {0}")]
    StorePath(#[from] store_path::Error),
    #[error("output set must not be empty")]
    EmptyOutputs,
    #[error("invalid output name '{0}'")]
    InvalidOutputName(String),
    #[error("path '{0}' is not a derivation, but outputs were selected")]
    NotADerivation(String),
}

/// A concrete store path, that needs no building.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opaque {
    path: StorePath,
}

impl Opaque {
    pub fn new(path: StorePath) -> Self {
        Opaque { path }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }
}

/// An [Opaque] path that is known to be a derivation, as referred to by
/// built paths.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvPath(Opaque);

impl DrvPath {
    pub fn new(path: StorePath) -> Result<Self, Error> {
        if !path.is_derivation() {
            return Err(Error::NotADerivation(path.to_absolute_path()));
        }
        Ok(DrvPath(Opaque { path }))
    }

    pub fn path(&self) -> &StorePath {
        self.0.path()
    }

    pub fn as_opaque(&self) -> &Opaque {
        &self.0
    }
}

/// A derived path resolving to exactly one store path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SingleDerivedPath {
    Opaque(Opaque),
    Built { drv_path: DrvPath, output: String },
}

/// A derived path resolving to any number of store paths.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
    Opaque(Opaque),
    Built {
        drv_path: DrvPath,
        outputs: OutputsSpec,
    },
}

/// Splits `s` at the last `sep`, parsing the left side as an absolute
/// store path.
fn split_path(s: &str, sep: char) -> Result<(StorePath, Option<&str>), Error> {
    let (path, rest) = match s.rsplit_once(sep) {
        Some((path, rest)) => (path, Some(rest)),
        None => (s, None),
    };
    Ok((StorePath::from_absolute_path(path.as_bytes())?, rest))
}

impl SingleDerivedPath {
    pub fn opaque(path: StorePath) -> Self {
        SingleDerivedPath::Opaque(Opaque { path })
    }

    pub fn built(drv_path: StorePath, output: impl Into<String>) -> Result<Self, Error> {
        let output = output.into();
        outputs_spec::validate_output_name(&output)?;
        Ok(SingleDerivedPath::Built {
            drv_path: DrvPath::new(drv_path)?,
            output,
        })
    }

    /// The store path itself, or the path of the derivation.
    pub fn base_store_path(&self) -> &StorePath {
        match self {
            SingleDerivedPath::Opaque(o) => &o.path,
            SingleDerivedPath::Built { drv_path, .. } => drv_path.path(),
        }
    }
}

impl FromStr for SingleDerivedPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_path(s, '^')? {
            (path, None) => Ok(SingleDerivedPath::opaque(path)),
            (path, Some(output)) => SingleDerivedPath::built(path, output),
        }
    }
}

impl fmt::Display for SingleDerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleDerivedPath::Opaque(o) => f.write_str(&o.path.to_absolute_path()),
            SingleDerivedPath::Built { drv_path, output } => {
                write!(f, "{}^{}", drv_path.path().to_absolute_path(), output)
            }
        }
    }
}

impl DerivedPath {
    pub fn opaque(path: StorePath) -> Self {
        DerivedPath::Opaque(Opaque { path })
    }

    pub fn built(drv_path: StorePath, outputs: OutputsSpec) -> Result<Self, Error> {
        Ok(DerivedPath::Built {
            drv_path: DrvPath::new(drv_path)?,
            outputs,
        })
    }

    /// Lifts a [SingleDerivedPath], selecting its one output by name.
    pub fn from_single(single: SingleDerivedPath) -> Self {
        match single {
            SingleDerivedPath::Opaque(o) => DerivedPath::Opaque(o),
            SingleDerivedPath::Built { drv_path, output } => DerivedPath::Built {
                drv_path,
                outputs: OutputsSpec::Names(OutputNames::single(output)),
            },
        }
    }

    /// The store path itself, or the path of the derivation.
    ///
    /// Different derived paths share a base path, and the outputs of a
    /// derivation may differ between builds, so this is not suitable as a
    /// cache key for realised contents.
    pub fn base_store_path(&self) -> &StorePath {
        match self {
            DerivedPath::Opaque(o) => &o.path,
            DerivedPath::Built { drv_path, .. } => drv_path.path(),
        }
    }

    fn parse_with_separator(s: &str, sep: char) -> Result<Self, Error> {
        match split_path(s, sep)? {
            (path, None) => Ok(DerivedPath::opaque(path)),
            (path, Some(outputs)) => DerivedPath::built(path, outputs.parse()?),
        }
    }

    /// Parses the legacy `!` syntax.
    pub fn parse_legacy(s: &str) -> Result<Self, Error> {
        Self::parse_with_separator(s, '!')
    }

    fn to_string_with_separator(&self, sep: char) -> String {
        match self {
            DerivedPath::Opaque(o) => o.path.to_absolute_path(),
            DerivedPath::Built { drv_path, outputs } => {
                format!("{}{}{}", drv_path.path().to_absolute_path(), sep, outputs)
            }
        }
    }

    /// Renders with the legacy `!` separator, the inverse of [Self::parse_legacy].
    pub fn to_string_legacy(&self) -> String {
        self.to_string_with_separator('!')
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DerivedPath::Opaque(o) => json!({ "path": o.path }),
            DerivedPath::Built { drv_path, outputs } => json!({
                "drvPath": drv_path.path(),
                "outputs": outputs,
            }),
        }
    }
}

impl FromStr for DerivedPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_separator(s, '^')
    }
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_separator('^'))
    }
}

impl From<SingleDerivedPath> for DerivedPath {
    fn from(value: SingleDerivedPath) -> Self {
        DerivedPath::from_single(value)
    }
}
