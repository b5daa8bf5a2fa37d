use crate::nixhash::NixHash;
use crate::store_path::{self, StorePath};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

mod errors;
mod output;
mod parse_error;
mod parser;
mod structured_attrs;
mod validate;
mod write;

pub use crate::store_path::{downstream_placeholder, hash_placeholder};
pub use errors::{DerivationError, OutputError};
pub use output::Output;
pub use parser::Error as ParseError;
pub use structured_attrs::{
    write_structured_attrs_shell, BuildSettings, ParsedDerivation,
    PathInfoSource, StructuredAttrsError,
};

/// Builders with this prefix are run inside the daemon, on any platform.
pub const BUILTIN_BUILDER_PREFIX: &str = "builtin:";

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    #[serde(rename = "args")]
    pub arguments: Vec<String>,

    pub builder: String,

    #[serde(rename = "env")]
    pub environment: BTreeMap<String, String>,

    /// Map from drv path to output names used from this derivation.
    #[serde(rename = "inputDrvs")]
    pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,

    /// Plain store paths additionally used by this derivation.
    #[serde(rename = "inputSrcs")]
    pub input_sources: BTreeSet<StorePath>,

    pub outputs: BTreeMap<String, Output>,

    pub system: String,
}

impl Derivation {
    /// Serializes to ATerm, with the given input derivations section.
    fn aterm_with_input_derivations(
        &self,
        input_derivations: &BTreeMap<String, BTreeSet<String>>,
    ) -> String {
        // ATerm lists are sorted by the printed path, not by digest.
        let input_sources: BTreeSet<String> = self
            .input_sources
            .iter()
            .map(StorePath::to_absolute_path)
            .collect();

        let mut out = String::new();
        out.push_str(write::DERIVATION_PREFIX);
        out.push(write::PAREN_OPEN);

        write::write_outputs(&mut out, &self.outputs);
        out.push(write::COMMA);
        write::write_input_derivations(&mut out, input_derivations);
        out.push(write::COMMA);
        write::write_input_sources(&mut out, &input_sources);
        out.push(write::COMMA);
        write::write_system(&mut out, &self.system);
        out.push(write::COMMA);
        write::write_builder(&mut out, &self.builder);
        out.push(write::COMMA);
        write::write_arguments(&mut out, &self.arguments);
        out.push(write::COMMA);
        write::write_environment(&mut out, &self.environment);

        out.push(write::PAREN_CLOSE);
        out
    }

    /// Returns the ATerm serialization.
    pub fn to_aterm_string(&self) -> String {
        let input_derivations = self
            .input_derivations
            .iter()
            .map(|(drv_path, outputs)| (drv_path.to_absolute_path(), outputs.clone()))
            .collect();

        self.aterm_with_input_derivations(&input_derivations)
    }

    /// Parses a Derivation from its ATerm serialization, and validates it.
    pub fn from_aterm_bytes(b: &[u8]) -> Result<Derivation, parser::Error<&[u8]>> {
        parser::parse(b)
    }

    /// Whether the builder runs inside the daemon (`builtin:fetchurl` and friends).
    pub fn is_builtin(&self) -> bool {
        self.builder.starts_with(BUILTIN_BUILDER_PREFIX)
    }

    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1 && self.outputs.get("out").is_some_and(Output::is_fixed)
    }

    /// Returns the drv path of a [Derivation] struct.
    ///
    /// The drv path is a text path named `$name.drv`, referencing all
    /// input sources and input derivations, with the ATerm as contents.
    pub fn calculate_derivation_path(&self, name: &str) -> Result<StorePath, DerivationError> {
        let name = &format!("{}{}", name, store_path::DRV_EXTENSION);

        // BTreeSet keeps the references sorted, as required.
        let references: BTreeSet<String> = self
            .input_sources
            .iter()
            .chain(self.input_derivations.keys())
            .map(StorePath::to_absolute_path)
            .collect();

        store_path::build_text_path(name, self.to_aterm_string(), references)
            .map_err(|e| DerivationError::InvalidOutputDerivationPath(name.to_string(), e))
    }

    /// Returns the FOD digest, if the derivation is fixed-output, or None if
    /// it's not.
    fn fod_digest(&self) -> Option<[u8; 32]> {
        if self.outputs.len() != 1 {
            return None;
        }

        match self.outputs.get("out")? {
            output @ Output::Fixed { hash, .. } => Some(
                Sha256::new_with_prefix(format!(
                    "fixed:out:{}:{}:{}",
                    hash.algo_str(),
                    hash.digest().to_plain_hex_string(),
                    output.path_str()
                ))
                .finalize()
                .into(),
            ),
            _ => None,
        }
    }

    /// Calculates the hash of a derivation modulo fixed-output subderivations.
    ///
    /// Fixed-output derivations hash `fixed:out:$algo:$digest:$path`. All
    /// others hash their ATerm, with every input derivation path replaced by
    /// the lower-hex result of this function for that input, which
    /// `fn_get_derivation_or_fod_hash` has to provide.
    pub fn derivation_or_fod_hash<F>(&self, fn_get_derivation_or_fod_hash: F) -> NixHash
    where
        F: Fn(&StorePath) -> NixHash,
    {
        let digest = self.fod_digest().unwrap_or_else(|| {
            let replaced_input_derivations: BTreeMap<String, BTreeSet<String>> = self
                .input_derivations
                .iter()
                .map(|(drv_path, output_names)| {
                    (
                        fn_get_derivation_or_fod_hash(drv_path).to_plain_hex_string(),
                        output_names.clone(),
                    )
                })
                .collect();

            Sha256::new_with_prefix(self.aterm_with_input_derivations(&replaced_input_derivations))
                .finalize()
                .into()
        });

        NixHash::Sha256(digest)
    }

    /// Calculates the paths of all outputs and writes them into
    /// [Derivation::outputs] and the environment.
    ///
    /// Input-addressed paths need the [Derivation::derivation_or_fod_hash]
    /// of this derivation, computed while output paths were still unset.
    /// Fixed outputs get their path from the content hash, floating outputs
    /// are left alone.
    pub fn calculate_output_paths(
        &mut self,
        name: &str,
        derivation_or_fod_hash: &NixHash,
    ) -> Result<(), DerivationError> {
        for (output_name, output) in self.outputs.iter_mut() {
            let output_path_name = store_path::output_path_name(name, output_name);

            let abs_store_path = match output {
                Output::InputAddressed(path) => {
                    let p = store_path::build_output_path(
                        derivation_or_fod_hash,
                        output_name,
                        &output_path_name,
                    )
                    .map_err(|_e| DerivationError::InvalidOutputName(output_path_name.clone()))?;
                    let abs = p.to_absolute_path();
                    *path = Some(p);
                    abs
                }
                Output::Fixed { path, hash } => {
                    let p = store_path::build_ca_path(
                        &output_path_name,
                        hash,
                        Vec::<String>::new(),
                        false,
                    )
                    .map_err(|e| {
                        DerivationError::InvalidOutputDerivationPath(output_path_name.clone(), e)
                    })?;
                    let abs = p.to_absolute_path();
                    *path = Some(p);
                    abs
                }
                Output::Floating { .. } => continue,
            };

            self.environment
                .insert(output_name.to_string(), abs_store_path);
        }

        Ok(())
    }
}
