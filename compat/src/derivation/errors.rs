//! Contains [DerivationError], exported as [crate::derivation::DerivationError]
use crate::nixhash::{self, CAHash};
use crate::store_path;
use thiserror::Error;

/// Errors that can occur during the validation of Derivation structs.
#[derive(Debug, Error, PartialEq)]
pub enum DerivationError {
    // outputs
    #[error("no outputs defined")]
    NoOutputs(),
    #[error("invalid output name: {0}")]
    InvalidOutputName(String),
    #[error("encountered fixed-output derivation, but more than 1 output in total")]
    MoreThanOneOutputButFixed(),
    #[error("invalid output name for fixed-output derivation: {0}")]
    InvalidOutputNameForFixed(String),
    #[error("unable to validate output {0}: {1}")]
    InvalidOutput(String, OutputError),
    #[error("unable to calculate output path for {0}: {1}")]
    InvalidOutputDerivationPath(String, store_path::BuildStorePathError),

    // input derivation
    #[error("input derivation {0} doesn't end with .drv")]
    InvalidInputDerivationPrefix(String),
    #[error("input derivation {0} output names are empty")]
    EmptyInputDerivationOutputNames(String),
    #[error("input derivation {0} output name {1} is invalid")]
    InvalidInputDerivationOutputName(String, String),

    // platform
    #[error("invalid platform field: {0}")]
    InvalidPlatform(String),

    // builder
    #[error("invalid builder field: {0}")]
    InvalidBuilder(String),

    // environment
    #[error("invalid environment key {0}")]
    InvalidEnvironmentKey(String),
}

/// Errors that can occur during the validation of a specific
/// [crate::derivation::Output] of a [crate::derivation::Derivation].
#[derive(Debug, Error, PartialEq)]
pub enum OutputError {
    #[error("Invalid output path {0}: {1}")]
    InvalidOutputPath(String, store_path::Error),
    #[error("Invalid CAHash: {0}")]
    InvalidCAHash(CAHash),
    #[error("Invalid hash: {0}")]
    InvalidHash(nixhash::Error),
    #[error("hash given without hashAlgo")]
    MissingHashAlgo,
    #[error("floating content-addressed output can't have a path")]
    FloatingWithPath,
    #[error("output path is missing")]
    MissingOutputPath,
}
