use std::collections::BTreeMap;

use crate::narinfo::VerifyingKey;

/// Represents configuration as stored in /etc/nix/nix.conf.
/// This list is not exhaustive, unknown keys are skipped.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NixConfig {
    pub system: Option<String>,
    pub extra_platforms: Option<Vec<String>>,
    pub system_features: Option<Vec<String>>,
    pub max_jobs: Option<u64>,
    pub cores: Option<u64>,
    /// Seconds a resolved moving reference (branch, tag, URL) stays fresh.
    pub tarball_ttl: Option<u64>,
    /// host (optionally with a path prefix) to token.
    pub access_tokens: Option<BTreeMap<String, String>>,
    pub allow_dirty: Option<bool>,
    pub warn_dirty: Option<bool>,
    pub require_sigs: Option<bool>,
    pub trusted_public_keys: Option<Vec<VerifyingKey>>,
    pub substituters: Option<Vec<String>>,
    pub always_allow_substitutes: Option<bool>,
}

pub const DEFAULT_TARBALL_TTL: u64 = 60 * 60;

/// Options that may be extended with an `extra-` prefixed key.
const EXTENDABLE: &[&str] = &[
    "access-tokens",
    "substituters",
    "system-features",
    "trusted-public-keys",
];

impl NixConfig {
    /// Parses configuration from a file like `/etc/nix/nix.conf`, returning
    /// a [NixConfig] with all values contained in there.
    /// It does not support parsing multiple config files, merging semantics,
    /// and also does not understand `include` and `!include` statements.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut out = Self::default();

        for line in input.lines() {
            // strip comments at the end of the line
            let line = match line.split_once('#') {
                Some((line, _comment)) => line,
                None => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            let (tag, val) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            let tag = tag.trim();
            let val = val.trim();

            let (tag, append) = match tag.strip_prefix("extra-") {
                Some(base) if EXTENDABLE.contains(&base) => (base, true),
                _ => (tag, false),
            };

            parse_val(&mut out, tag, val, append)
                .ok_or_else(|| Error::InvalidValue(tag.to_string(), val.to_string()))?
        }

        Ok(out)
    }

    pub fn tarball_ttl(&self) -> u64 {
        self.tarball_ttl.unwrap_or(DEFAULT_TARBALL_TTL)
    }
}

fn words(val: &str) -> Vec<String> {
    val.split_whitespace().map(str::to_string).collect()
}

fn set_or_extend<T>(field: &mut Option<Vec<T>>, values: Vec<T>, append: bool) {
    match field {
        Some(existing) if append => existing.extend(values),
        _ => *field = Some(values),
    }
}

/// Returns None if the value is invalid for a known key.
fn parse_val(this: &mut NixConfig, tag: &str, val: &str, append: bool) -> Option<()> {
    match tag {
        "system" => this.system = Some(val.to_string()),
        "extra-platforms" => this.extra_platforms = Some(words(val)),
        "system-features" => set_or_extend(&mut this.system_features, words(val), append),
        "max-jobs" => {
            this.max_jobs = Some(match val {
                "auto" => std::thread::available_parallelism()
                    .map(|n| n.get() as u64)
                    .unwrap_or(1),
                _ => val.parse().ok()?,
            })
        }
        "cores" => this.cores = Some(val.parse().ok()?),
        "tarball-ttl" => this.tarball_ttl = Some(val.parse().ok()?),
        "access-tokens" => {
            let tokens = val
                .split_whitespace()
                .map(|kv| {
                    kv.split_once('=')
                        .map(|(host, token)| (host.to_string(), token.to_string()))
                })
                .collect::<Option<BTreeMap<_, _>>>()?;
            match &mut this.access_tokens {
                Some(existing) if append => existing.extend(tokens),
                _ => this.access_tokens = Some(tokens),
            }
        }
        "allow-dirty" => this.allow_dirty = Some(val.parse().ok()?),
        "warn-dirty" => this.warn_dirty = Some(val.parse().ok()?),
        "require-sigs" => this.require_sigs = Some(val.parse().ok()?),
        "trusted-public-keys" => {
            let keys = val
                .split_whitespace()
                .map(VerifyingKey::parse)
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            set_or_extend(&mut this.trusted_public_keys, keys, append)
        }
        "substituters" => set_or_extend(&mut this.substituters, words(val), append),
        "always-allow-substitutes" => this.always_allow_substitutes = Some(val.parse().ok()?),
        _ => {}
    }
    Some(())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid line: {0}")]
    InvalidLine(String),
    #[error("Invalid value '{1}' for key '{0}'")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::NixConfig;
    use crate::narinfo::VerifyingKey;

    const NIX_CONF: &str = r#"
# a comment
system = x86_64-linux
extra-platforms = aarch64-linux i686-linux
system-features = nixos-test benchmark big-parallel kvm
max-jobs = 8
cores = 0
tarball-ttl = 600   # ten minutes
access-tokens = github.com=ghp_abc gitlab.example.org=PAT:glpat-xyz
warn-dirty = false
require-sigs = true
substituters = https://cache.nixos.org/
extra-substituters = https://nix-community.cachix.org
trusted-public-keys = cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=
sandbox = true
experimental-features = nix-command flakes
"#;

    #[test]
    fn parse() {
        let config = NixConfig::parse(NIX_CONF).expect("must parse");

        assert_eq!(
            NixConfig {
                system: Some("x86_64-linux".into()),
                extra_platforms: Some(vec!["aarch64-linux".into(), "i686-linux".into()]),
                system_features: Some(vec![
                    "nixos-test".into(),
                    "benchmark".into(),
                    "big-parallel".into(),
                    "kvm".into()
                ]),
                max_jobs: Some(8),
                cores: Some(0),
                tarball_ttl: Some(600),
                access_tokens: Some(BTreeMap::from([
                    ("github.com".into(), "ghp_abc".into()),
                    ("gitlab.example.org".into(), "PAT:glpat-xyz".into()),
                ])),
                allow_dirty: None,
                warn_dirty: Some(false),
                require_sigs: Some(true),
                trusted_public_keys: Some(vec![VerifyingKey::parse(
                    "cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY="
                )
                .expect("failed to parse pubkey")]),
                substituters: Some(vec![
                    "https://cache.nixos.org/".into(),
                    "https://nix-community.cachix.org".into()
                ]),
                always_allow_substitutes: None,
            },
            config
        );
        assert_eq!(600, config.tarball_ttl());
    }

    #[test]
    fn defaults() {
        let config = NixConfig::parse("").expect("must parse");
        assert_eq!(NixConfig::default(), config);
        assert_eq!(3600, config.tarball_ttl());
    }

    #[test]
    fn max_jobs_auto() {
        let config = NixConfig::parse("max-jobs = auto").expect("must parse");
        assert!(config.max_jobs.expect("is set") >= 1);
    }

    #[rstest]
    #[case::no_equals("system x86_64-linux")]
    #[case::bad_number("cores = many")]
    #[case::bad_bool("allow-dirty = yes")]
    #[case::bad_key("trusted-public-keys = foo")]
    #[case::bad_token("access-tokens = github.com")]
    fn parse_fail(#[case] input: &str) {
        NixConfig::parse(input).expect_err("must fail");
    }
}
