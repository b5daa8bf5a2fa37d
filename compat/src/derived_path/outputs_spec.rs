use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Error;

/// A selection of outputs of a derivation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputsSpec {
    /// All outputs, written as `*`.
    All,
    /// An explicit set of output names.
    Names(OutputNames),
}

/// A non-empty set of valid output names, built through [OutputsSpec::names].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputNames(BTreeSet<String>);

impl OutputNames {
    /// A single, already validated, name.
    pub(super) fn single(name: String) -> Self {
        OutputNames(BTreeSet::from([name]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// The names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_set(&self) -> &BTreeSet<String> {
        &self.0
    }
}

/// Output names share the character set of store path names.
pub(crate) fn validate_output_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"+-._?=".contains(&c))
    {
        return Err(Error::InvalidOutputName(name.to_string()));
    }
    Ok(())
}

impl OutputsSpec {
    /// Constructs [OutputsSpec::Names], failing if `names` is empty or
    /// contains an invalid output name.
    pub fn names<S: Into<String>, I: IntoIterator<Item = S>>(names: I) -> Result<Self, Error> {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::EmptyOutputs);
        }
        for name in &names {
            validate_output_name(name)?;
        }
        Ok(OutputsSpec::Names(OutputNames(names)))
    }

    pub fn contains(&self, output: &str) -> bool {
        match self {
            OutputsSpec::All => true,
            OutputsSpec::Names(names) => names.contains(output),
        }
    }

    /// Whether every output selected by `self` is also selected by `other`.
    pub fn is_subset_of(&self, other: &OutputsSpec) -> bool {
        match (self, other) {
            (_, OutputsSpec::All) => true,
            (OutputsSpec::All, OutputsSpec::Names(_)) => false,
            (OutputsSpec::Names(a), OutputsSpec::Names(b)) => a.0.is_subset(&b.0),
        }
    }

    pub fn union(&self, other: &OutputsSpec) -> OutputsSpec {
        match (self, other) {
            (OutputsSpec::Names(a), OutputsSpec::Names(b)) => {
                OutputsSpec::Names(OutputNames(a.0.union(&b.0).cloned().collect()))
            }
            _ => OutputsSpec::All,
        }
    }
}

impl FromStr for OutputsSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(OutputsSpec::All);
        }
        OutputsSpec::names(s.split(','))
    }
}

impl fmt::Display for OutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputsSpec::All => f.write_str("*"),
            OutputsSpec::Names(names) => {
                let mut first = true;
                for name in names.iter() {
                    if !first {
                        f.write_str(",")?;
                    }
                    f.write_str(name)?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for OutputsSpec {
    /// `["*"]` for [OutputsSpec::All], the sorted list of names otherwise.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OutputsSpec::All => vec!["*"].serialize(serializer),
            OutputsSpec::Names(names) => names.as_set().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OutputsSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        if names.len() == 1 && names[0] == "*" {
            return Ok(OutputsSpec::All);
        }
        OutputsSpec::names(names).map_err(serde::de::Error::custom)
    }
}

/// An [OutputsSpec] as written after an installable, which may be omitted
/// to select the default outputs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtendedOutputsSpec {
    Default,
    Explicit(OutputsSpec),
}

impl fmt::Display for ExtendedOutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedOutputsSpec::Default => Ok(()),
            ExtendedOutputsSpec::Explicit(spec) => write!(f, "^{}", spec),
        }
    }
}

/// Splits a trailing `^outputs` off `s`. If there is no `^`, or what follows
/// the last one does not parse as an [OutputsSpec], the whole string is
/// returned with [ExtendedOutputsSpec::Default].
pub fn parse_with_extended_outputs(s: &str) -> (&str, ExtendedOutputsSpec) {
    match s.rsplit_once('^') {
        Some((prefix, outputs)) => match outputs.parse::<OutputsSpec>() {
            Ok(spec) => (prefix, ExtendedOutputsSpec::Explicit(spec)),
            Err(_) => (s, ExtendedOutputsSpec::Default),
        },
        None => (s, ExtendedOutputsSpec::Default),
    }
}
