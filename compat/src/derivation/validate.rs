use crate::derivation::{Derivation, DerivationError};
use crate::store_path;

/// Output names share the restrictions of store path names. `drv` is
/// reserved, as it would clash with `drvPath` in the evaluator.
fn is_valid_output_name(name: &str) -> bool {
    !name.is_empty() && name != "drv" && store_path::validate_name(name.as_bytes()).is_ok()
}

impl Derivation {
    /// validate ensures a Derivation struct is properly populated,
    /// and returns a [DerivationError] if not.
    ///
    /// if `validate_output_paths` is set to false, the output paths are
    /// excluded from validation.
    ///
    /// This is helpful to validate struct population before invoking
    /// [Derivation::calculate_output_paths].
    pub fn validate(&self, validate_output_paths: bool) -> Result<(), DerivationError> {
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs());
        }

        for (output_name, output) in &self.outputs {
            if !is_valid_output_name(output_name) {
                return Err(DerivationError::InvalidOutputName(output_name.to_string()));
            }

            if output.is_fixed() {
                if self.outputs.len() != 1 {
                    return Err(DerivationError::MoreThanOneOutputButFixed());
                }
                if output_name != "out" {
                    return Err(DerivationError::InvalidOutputNameForFixed(
                        output_name.to_string(),
                    ));
                }
            }

            output
                .validate(validate_output_paths)
                .map_err(|e| DerivationError::InvalidOutput(output_name.to_string(), e))?;
        }

        for (input_derivation_path, output_names) in &self.input_derivations {
            if !input_derivation_path.is_derivation() {
                return Err(DerivationError::InvalidInputDerivationPrefix(
                    input_derivation_path.to_absolute_path(),
                ));
            }

            if output_names.is_empty() {
                return Err(DerivationError::EmptyInputDerivationOutputNames(
                    input_derivation_path.to_absolute_path(),
                ));
            }

            for output_name in output_names.iter() {
                if !is_valid_output_name(output_name) {
                    return Err(DerivationError::InvalidInputDerivationOutputName(
                        input_derivation_path.to_absolute_path(),
                        output_name.to_string(),
                    ));
                }
            }
        }

        if self.system.is_empty() {
            return Err(DerivationError::InvalidPlatform(self.system.to_string()));
        }

        if self.builder.is_empty() {
            return Err(DerivationError::InvalidBuilder(self.builder.to_string()));
        }

        // none of the env keys may be empty.
        for k in self.environment.keys() {
            if k.is_empty() {
                return Err(DerivationError::InvalidEnvironmentKey(k.to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::derivation::{Derivation, DerivationError, Output};
    use crate::nixhash::{CAHash, NixHash};
    use crate::store_path::StorePath;

    fn drv_with_outputs(outputs: BTreeMap<String, Output>) -> Derivation {
        Derivation {
            builder: "/bin/sh".to_string(),
            outputs,
            system: "x86_64-linux".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn text_hash_output() {
        let drv = drv_with_outputs(BTreeMap::from([(
            "out".to_string(),
            Output::Fixed {
                path: None,
                hash: CAHash::Text([0; 32]),
            },
        )]));

        drv.validate(false).expect_err("must fail");
    }

    #[test]
    fn fixed_with_multiple_outputs() {
        let drv = drv_with_outputs(BTreeMap::from([
            (
                "out".to_string(),
                Output::Fixed {
                    path: None,
                    hash: CAHash::Flat(NixHash::Sha1([0; 20])),
                },
            ),
            ("dev".to_string(), Output::InputAddressed(None)),
        ]));

        assert_eq!(
            Err(DerivationError::MoreThanOneOutputButFixed()),
            drv.validate(false)
        );
    }

    #[test]
    fn reserved_output_name() {
        let drv = drv_with_outputs(BTreeMap::from([(
            "drv".to_string(),
            Output::InputAddressed(None),
        )]));

        assert_eq!(
            Err(DerivationError::InvalidOutputName("drv".to_string())),
            drv.validate(false)
        );
    }

    #[test]
    fn input_derivation_not_a_drv() {
        let mut drv = drv_with_outputs(BTreeMap::from([(
            "out".to_string(),
            Output::InputAddressed(None),
        )]));
        drv.input_derivations.insert(
            StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-foo").unwrap(),
            BTreeSet::from(["out".to_string()]),
        );

        assert!(matches!(
            drv.validate(false),
            Err(DerivationError::InvalidInputDerivationPrefix(_))
        ));
    }
}
