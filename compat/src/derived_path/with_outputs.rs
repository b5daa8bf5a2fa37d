use std::collections::BTreeSet;
use std::fmt;

use super::{DerivedPath, Error, OutputsSpec};
use crate::store_path::StorePath;

/// The legacy form of a derived path: a store path and a flat set of
/// output names. An empty set means all outputs for a derivation, and the
/// path itself otherwise.
///
/// Converting [OutputsSpec::All] into this form yields the empty set, so
/// "all outputs" and "no outputs given" can't be told apart afterwards.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathWithOutputs {
    pub path: StorePath,
    pub outputs: BTreeSet<String>,
}

impl StorePathWithOutputs {
    /// Parses `/nix/store/…[!out1,out2]`.
    pub fn parse_path_with_outputs(s: &str) -> Result<Self, Error> {
        let (path, outputs): (&str, BTreeSet<String>) = match s.rsplit_once('!') {
            Some((path, outputs)) => (path, outputs.split(',').map(str::to_string).collect()),
            None => (s, BTreeSet::new()),
        };
        for output in &outputs {
            super::outputs_spec::validate_output_name(output)?;
        }

        Ok(StorePathWithOutputs {
            path: StorePath::from_absolute_path(path.as_bytes())?,
            outputs,
        })
    }

    pub fn to_derived_path(&self) -> Result<DerivedPath, Error> {
        if !self.outputs.is_empty() {
            DerivedPath::built(self.path.clone(), OutputsSpec::names(self.outputs.iter().cloned())?)
        } else if self.path.is_derivation() {
            DerivedPath::built(self.path.clone(), OutputsSpec::All)
        } else {
            Ok(DerivedPath::opaque(self.path.clone()))
        }
    }

    /// Converts a [DerivedPath] into the legacy form.
    ///
    /// An opaque derivation path means the derivation file itself, which
    /// the legacy form can't express (it would mean "all outputs"). In that
    /// case the path is handed back as the error.
    pub fn try_from_derived_path(p: &DerivedPath) -> Result<Self, StorePath> {
        match p {
            DerivedPath::Opaque(opaque) => {
                let path = opaque.path();
                if path.is_derivation() {
                    Err(path.clone())
                } else {
                    Ok(StorePathWithOutputs {
                        path: path.clone(),
                        outputs: BTreeSet::new(),
                    })
                }
            }
            DerivedPath::Built { drv_path, outputs } => Ok(StorePathWithOutputs {
                path: drv_path.path().clone(),
                outputs: match outputs {
                    OutputsSpec::All => BTreeSet::new(),
                    OutputsSpec::Names(names) => names.as_set().clone(),
                },
            }),
        }
    }
}

impl fmt::Display for StorePathWithOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.to_absolute_path())?;
        if !self.outputs.is_empty() {
            let outputs: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
            write!(f, "!{}", outputs.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const DRV: &str = "/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo.drv";
    const OUT: &str = "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432";

    #[test]
    fn legacy_to_derived() {
        let p = StorePathWithOutputs::parse_path_with_outputs(&format!("{DRV}!out,dev")).unwrap();
        assert_eq!(DRV, p.path.to_absolute_path());
        assert_eq!(BTreeSet::from(["out".to_string(), "dev".to_string()]), p.outputs);
        assert_eq!(format!("{DRV}!dev,out"), p.to_string());

        assert_eq!(
            DerivedPath::built(p.path.clone(), OutputsSpec::names(["dev", "out"]).unwrap())
                .unwrap(),
            p.to_derived_path().unwrap()
        );
    }

    #[test]
    fn bare_paths() {
        let drv = StorePathWithOutputs::parse_path_with_outputs(DRV).unwrap();
        assert_eq!(
            DerivedPath::built(drv.path.clone(), OutputsSpec::All).unwrap(),
            drv.to_derived_path().unwrap()
        );

        let out = StorePathWithOutputs::parse_path_with_outputs(OUT).unwrap();
        assert_eq!(
            DerivedPath::opaque(out.path.clone()),
            out.to_derived_path().unwrap()
        );
        assert_eq!(OUT, out.to_string());
    }

    #[rstest]
    #[case::empty_segment("!out,,dev")]
    #[case::trailing_comma("!out,")]
    #[case::nothing_after_separator("!")]
    #[case::bad_name("!o/ut")]
    fn bad_outputs(#[case] suffix: &str) {
        StorePathWithOutputs::parse_path_with_outputs(&format!("{DRV}{suffix}"))
            .expect_err("must fail");
    }

    #[test]
    fn invalid_outputs_dont_convert() {
        let p = StorePathWithOutputs {
            path: StorePath::from_absolute_path(DRV.as_bytes()).unwrap(),
            outputs: BTreeSet::from([String::new()]),
        };
        assert!(matches!(p.to_derived_path(), Err(Error::InvalidOutputName(_))));
    }

    #[test]
    fn outputs_on_non_derivation() {
        let p = StorePathWithOutputs::parse_path_with_outputs(&format!("{OUT}!out")).unwrap();
        assert!(matches!(p.to_derived_path(), Err(Error::NotADerivation(_))));
    }

    #[test]
    fn from_derived() {
        let drv = StorePath::from_absolute_path(DRV.as_bytes()).unwrap();

        assert_eq!(
            Err(drv.clone()),
            StorePathWithOutputs::try_from_derived_path(&DerivedPath::opaque(drv.clone()))
        );

        // "all" loses its distinction, and comes back as "all" for derivations.
        let all = DerivedPath::built(drv.clone(), OutputsSpec::All).unwrap();
        let legacy = StorePathWithOutputs::try_from_derived_path(&all).unwrap();
        assert!(legacy.outputs.is_empty());
        assert_eq!(all, legacy.to_derived_path().unwrap());
    }
}
