//! Formats used by the C++ implementation of Nix that aren't part of the
//! store or wire protocols.

pub mod conf;
