//! Attribute queries over a derivation, honouring structured attributes
//! (`__json`), and the build-locality predicates built on them.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use super::{Derivation, Output};
use crate::nixcpp::conf::NixConfig;
use crate::path_info::ExportedPathInfo;
use crate::store_path::{downstream_placeholder, hash_placeholder, StorePath};

lazy_static! {
    static ref SH_VAR_NAME: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex");
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StructuredAttrsError {
    #[error("cannot process __json attribute of '{0}': {1}")]
    InvalidJson(String, String),
    #[error("attribute '{0}' of derivation '{1}' must be {2}")]
    WrongType(String, String, &'static str),
    #[error("cannot export references of path '{0}' because it is not in the input closure of the derivation")]
    NotInInputClosure(String),
    #[error("path '{0}' in exportReferencesGraph is not a store path")]
    InvalidExportPath(String),
    #[error("no path info for '{0}'")]
    MissingPathInfo(String),
}

/// The local machine's build capabilities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildSettings {
    pub system: String,
    pub extra_platforms: BTreeSet<String>,
    pub system_features: BTreeSet<String>,
    pub max_jobs: u64,
    pub always_allow_substitutes: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            system: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            extra_platforms: BTreeSet::new(),
            system_features: BTreeSet::new(),
            max_jobs: 1,
            always_allow_substitutes: false,
        }
    }
}

impl From<&NixConfig> for BuildSettings {
    fn from(conf: &NixConfig) -> Self {
        let default = Self::default();
        Self {
            system: conf.system.clone().unwrap_or(default.system),
            extra_platforms: conf.extra_platforms.iter().flatten().cloned().collect(),
            system_features: conf.system_features.iter().flatten().cloned().collect(),
            max_jobs: conf.max_jobs.unwrap_or(default.max_jobs),
            always_allow_substitutes: conf.always_allow_substitutes.unwrap_or_default(),
        }
    }
}

/// Where [ParsedDerivation::prepare_structured_attrs] looks up the NAR
/// hash, NAR size and references of paths in the input closure.
pub trait PathInfoSource {
    fn nar_info(&self, path: &StorePath) -> Option<(&[u8; 32], u64, &BTreeSet<StorePath>)>;
}

/// Keyed by path, with `closure_size` ignored.
impl PathInfoSource for BTreeMap<StorePath, ExportedPathInfo> {
    fn nar_info(&self, path: &StorePath) -> Option<(&[u8; 32], u64, &BTreeSet<StorePath>)> {
        self.get(path)
            .map(|info| (&info.nar_sha256, info.nar_size, &info.references))
    }
}

/// A [Derivation] together with its path and parsed `__json`.
pub struct ParsedDerivation<'a> {
    drv_path: StorePath,
    drv: &'a Derivation,
    structured_attrs: Option<Map<String, Value>>,
}

impl<'a> ParsedDerivation<'a> {
    pub fn new(drv_path: StorePath, drv: &'a Derivation) -> Result<Self, StructuredAttrsError> {
        let structured_attrs = match drv.environment.get("__json") {
            None => None,
            Some(json) => match serde_json::from_str::<Value>(json) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => {
                    return Err(StructuredAttrsError::InvalidJson(
                        drv_path.to_absolute_path(),
                        "not a JSON object".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(StructuredAttrsError::InvalidJson(
                        drv_path.to_absolute_path(),
                        e.to_string(),
                    ))
                }
            },
        };

        Ok(Self {
            drv_path,
            drv,
            structured_attrs,
        })
    }

    pub fn has_structured_attrs(&self) -> bool {
        self.structured_attrs.is_some()
    }

    pub fn structured_attrs(&self) -> Option<&Map<String, Value>> {
        self.structured_attrs.as_ref()
    }

    fn wrong_type(&self, name: &str, expected: &'static str) -> StructuredAttrsError {
        StructuredAttrsError::WrongType(
            name.to_string(),
            self.drv_path.to_absolute_path(),
            expected,
        )
    }

    /// Structured attrs, if present, are the only source. The
    /// environment is not consulted then.
    pub fn get_string_attr(&self, name: &str) -> Result<Option<String>, StructuredAttrsError> {
        match &self.structured_attrs {
            Some(attrs) => match attrs.get(name) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(self.wrong_type(name, "a string")),
            },
            None => Ok(self.drv.environment.get(name).cloned()),
        }
    }

    /// In the environment, only `"1"` is true.
    pub fn get_bool_attr(&self, name: &str, default: bool) -> Result<bool, StructuredAttrsError> {
        match &self.structured_attrs {
            Some(attrs) => match attrs.get(name) {
                None => Ok(default),
                Some(Value::Bool(b)) => Ok(*b),
                Some(_) => Err(self.wrong_type(name, "a Boolean")),
            },
            None => Ok(self
                .drv
                .environment
                .get(name)
                .map_or(default, |v| v == "1")),
        }
    }

    /// In the environment, lists are whitespace separated.
    pub fn get_strings_attr(&self, name: &str) -> Result<Option<Vec<String>>, StructuredAttrsError> {
        match &self.structured_attrs {
            Some(attrs) => match attrs.get(name) {
                None => Ok(None),
                Some(Value::Array(values)) => values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        _ => Err(self.wrong_type(name, "a list of strings")),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Some),
                Some(_) => Err(self.wrong_type(name, "a list of strings")),
            },
            None => Ok(self
                .drv
                .environment
                .get(name)
                .map(|v| v.split_whitespace().map(str::to_string).collect())),
        }
    }

    pub fn required_system_features(&self) -> Result<BTreeSet<String>, StructuredAttrsError> {
        Ok(self
            .get_strings_attr("requiredSystemFeatures")?
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    pub fn can_build_locally(&self, settings: &BuildSettings) -> Result<bool, StructuredAttrsError> {
        let builtin = self.drv.is_builtin();

        if self.drv.system != settings.system
            && !settings.extra_platforms.contains(&self.drv.system)
            && !builtin
        {
            return Ok(false);
        }

        if settings.max_jobs == 0 && !builtin {
            return Ok(false);
        }

        Ok(self
            .required_system_features()?
            .iter()
            .all(|feature| settings.system_features.contains(feature)))
    }

    pub fn will_build_locally(&self, settings: &BuildSettings) -> Result<bool, StructuredAttrsError> {
        Ok(self.get_bool_attr("preferLocalBuild", false)? && self.can_build_locally(settings)?)
    }

    pub fn substitutes_allowed(&self, settings: &BuildSettings) -> Result<bool, StructuredAttrsError> {
        if settings.always_allow_substitutes {
            return Ok(true);
        }
        self.get_bool_attr("allowSubstitutes", true)
    }

    pub fn use_uid_range(&self) -> Result<bool, StructuredAttrsError> {
        Ok(self.required_system_features()?.contains("uid-range"))
    }

    /// Returns the structured attrs as passed to the builder: with an
    /// `outputs` object mapping output names to placeholders, and every
    /// `exportReferencesGraph` entry replaced by the path infos of the
    /// closure of the listed paths. Those must be in `input_paths`.
    ///
    /// Returns `None` for derivations without structured attrs.
    pub fn prepare_structured_attrs(
        &self,
        infos: &impl PathInfoSource,
        input_paths: &BTreeSet<StorePath>,
    ) -> Result<Option<Value>, StructuredAttrsError> {
        let Some(attrs) = &self.structured_attrs else {
            return Ok(None);
        };
        let mut json = attrs.clone();

        let outputs: Map<String, Value> = self
            .drv
            .outputs
            .iter()
            .map(|(name, output)| {
                let placeholder = match output {
                    Output::Floating { .. } => downstream_placeholder(&self.drv_path, name),
                    _ => hash_placeholder(name),
                };
                (name.clone(), Value::String(placeholder))
            })
            .collect();
        json.insert("outputs".to_string(), Value::Object(outputs));

        if let Some(Value::Object(graphs)) = attrs.get("exportReferencesGraph") {
            for (key, paths) in graphs {
                // a single string is accepted in place of a list.
                let paths: Vec<&Value> = match paths {
                    Value::Array(values) => values.iter().collect(),
                    other => vec![other],
                };

                let mut roots = BTreeSet::new();
                for path in paths {
                    let s = path.as_str().ok_or_else(|| self.wrong_type(key, "a list of strings"))?;
                    let (store_path, _) = StorePath::from_absolute_path_full(s)
                        .map_err(|_| StructuredAttrsError::InvalidExportPath(s.to_string()))?;
                    roots.insert(store_path);
                }

                let exported = export_references(infos, &roots, input_paths)?;
                json.insert(
                    key.clone(),
                    serde_json::to_value(exported)
                        .map_err(|e| StructuredAttrsError::InvalidJson(key.clone(), e.to_string()))?,
                );
            }
        }

        Ok(Some(Value::Object(json)))
    }
}

/// Collects the closure of `roots`.
fn compute_closure(
    infos: &impl PathInfoSource,
    roots: &BTreeSet<StorePath>,
) -> Result<BTreeSet<StorePath>, StructuredAttrsError> {
    let mut closure = BTreeSet::new();
    let mut todo: Vec<StorePath> = roots.iter().cloned().collect();

    while let Some(path) = todo.pop() {
        if closure.contains(&path) {
            continue;
        }
        let (_, _, references) = infos
            .nar_info(&path)
            .ok_or_else(|| StructuredAttrsError::MissingPathInfo(path.to_absolute_path()))?;
        todo.extend(references.iter().filter(|r| !closure.contains(*r)).cloned());
        closure.insert(path);
    }

    Ok(closure)
}

fn export_references(
    infos: &impl PathInfoSource,
    roots: &BTreeSet<StorePath>,
    input_paths: &BTreeSet<StorePath>,
) -> Result<BTreeSet<ExportedPathInfo>, StructuredAttrsError> {
    if let Some(outside) = roots.iter().find(|p| !input_paths.contains(p)) {
        return Err(StructuredAttrsError::NotInInputClosure(
            outside.to_absolute_path(),
        ));
    }

    let mut exported = BTreeSet::new();
    for path in compute_closure(infos, roots)? {
        let (nar_sha256, nar_size, references) = infos
            .nar_info(&path)
            .ok_or_else(|| StructuredAttrsError::MissingPathInfo(path.to_absolute_path()))?;

        let mut closure_size = 0;
        for p in compute_closure(infos, &BTreeSet::from([path.clone()]))? {
            if let Some((_, size, _)) = infos.nar_info(&p) {
                closure_size += size;
            }
        }

        exported.insert(ExportedPathInfo {
            closure_size,
            nar_sha256: *nar_sha256,
            nar_size,
            path,
            references: references.clone(),
        });
    }

    Ok(exported)
}

/// Single-quotes `s` for bash.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Strings, whole numbers, null and Booleans can be expressed in bash.
fn simple_shell_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(shell_escape(s)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                // whole floats only, and only those an i64 holds exactly
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64)
                    .then(|| (f as i64).to_string())
            }
        }
        Value::Null => Some("''".to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "" }.to_string()),
        _ => None,
    }
}

/// Renders structured attrs as bash `declare` statements.
///
/// Arrays and objects are only rendered if all their members are simple
/// values. Keys that aren't valid shell variable names, and values that
/// can't be represented, are skipped.
pub fn write_structured_attrs_shell(json: &Map<String, Value>) -> String {
    let mut out = String::new();

    for (key, value) in json {
        if !SH_VAR_NAME.is_match(key) {
            continue;
        }

        if let Some(s) = simple_shell_value(value) {
            out.push_str(&format!("declare {}={}\n", key, s));
            continue;
        }

        match value {
            Value::Array(values) => {
                let rendered: Option<String> = values
                    .iter()
                    .map(|v| simple_shell_value(v).map(|s| s + " "))
                    .collect();
                if let Some(rendered) = rendered {
                    out.push_str(&format!("declare -a {}=({})\n", key, rendered));
                }
            }
            Value::Object(members) => {
                let rendered: Option<String> = members
                    .iter()
                    .map(|(k, v)| {
                        simple_shell_value(v).map(|s| format!("[{}]={} ", shell_escape(k), s))
                    })
                    .collect();
                if let Some(rendered) = rendered {
                    out.push_str(&format!("declare -A {}=({})\n", key, rendered));
                }
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nixhash::{CAMethod, HashAlgo};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn drv_path() -> StorePath {
        StorePath::from_bytes(b"g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo.drv").unwrap()
    }

    fn drv(env: &[(&str, &str)]) -> Derivation {
        Derivation {
            builder: "/bin/sh".to_string(),
            system: "x86_64-linux".to_string(),
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            outputs: BTreeMap::from([("out".to_string(), Output::InputAddressed(None))]),
            ..Default::default()
        }
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            system: "x86_64-linux".to_string(),
            extra_platforms: BTreeSet::from(["i686-linux".to_string()]),
            system_features: BTreeSet::from(["kvm".to_string(), "big-parallel".to_string()]),
            max_jobs: 4,
            always_allow_substitutes: false,
        }
    }

    #[test]
    fn env_attrs() {
        let d = drv(&[
            ("preferLocalBuild", "1"),
            ("allowSubstitutes", ""),
            ("requiredSystemFeatures", " kvm  big-parallel "),
        ]);
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();

        assert!(!parsed.has_structured_attrs());
        assert_eq!(Some("1".to_string()), parsed.get_string_attr("preferLocalBuild").unwrap());
        assert!(parsed.get_bool_attr("preferLocalBuild", false).unwrap());
        assert!(!parsed.get_bool_attr("allowSubstitutes", true).unwrap());
        assert!(parsed.get_bool_attr("missing", true).unwrap());
        assert_eq!(
            Some(vec!["kvm".to_string(), "big-parallel".to_string()]),
            parsed.get_strings_attr("requiredSystemFeatures").unwrap()
        );
        assert!(parsed.will_build_locally(&settings()).unwrap());
        assert!(!parsed.substitutes_allowed(&settings()).unwrap());
        assert!(parsed
            .substitutes_allowed(&BuildSettings {
                always_allow_substitutes: true,
                ..settings()
            })
            .unwrap());
    }

    #[test]
    fn structured_attrs_override_env() {
        let d = drv(&[
            ("__json", r#"{"preferLocalBuild": true, "requiredSystemFeatures": ["uid-range"]}"#),
            // ignored, structured attrs are present.
            ("allowSubstitutes", ""),
        ]);
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();

        assert!(parsed.get_bool_attr("preferLocalBuild", false).unwrap());
        assert!(parsed.get_bool_attr("allowSubstitutes", true).unwrap());
        assert_eq!(None, parsed.get_string_attr("allowSubstitutes").unwrap());
        assert!(parsed.use_uid_range().unwrap());
        // uid-range isn't a local system feature.
        assert!(!parsed.can_build_locally(&settings()).unwrap());
    }

    #[rstest]
    #[case::string_not_bool(r#"{"preferLocalBuild": "1"}"#)]
    #[case::list_of_ints(r#"{"requiredSystemFeatures": [1]}"#)]
    fn structured_attrs_type_errors(#[case] json: &str) {
        let d = drv(&[("__json", json)]);
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();

        let err = match (
            parsed.get_bool_attr("preferLocalBuild", false),
            parsed.get_strings_attr("requiredSystemFeatures"),
        ) {
            (Err(e), _) | (_, Err(e)) => e,
            _ => panic!("expected a type error"),
        };
        assert!(matches!(err, StructuredAttrsError::WrongType(_, _, _)));
    }

    #[test]
    fn invalid_json() {
        let d = drv(&[("__json", "{")]);
        assert!(matches!(
            ParsedDerivation::new(drv_path(), &d),
            Err(StructuredAttrsError::InvalidJson(_, _))
        ));
    }

    #[rstest]
    #[case::matching("x86_64-linux", "/bin/sh", 4, true)]
    #[case::extra_platform("i686-linux", "/bin/sh", 4, true)]
    #[case::foreign_platform("aarch64-linux", "/bin/sh", 4, false)]
    #[case::foreign_builtin("aarch64-linux", "builtin:fetchurl", 4, true)]
    #[case::no_jobs("x86_64-linux", "/bin/sh", 0, false)]
    #[case::no_jobs_builtin("x86_64-linux", "builtin:fetchurl", 0, true)]
    fn can_build_locally(
        #[case] system: &str,
        #[case] builder: &str,
        #[case] max_jobs: u64,
        #[case] expected: bool,
    ) {
        let mut d = drv(&[]);
        d.system = system.to_string();
        d.builder = builder.to_string();
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();

        assert_eq!(
            expected,
            parsed
                .can_build_locally(&BuildSettings {
                    max_jobs,
                    ..settings()
                })
                .unwrap()
        );
    }

    #[test]
    fn shell_projection() {
        let json = json!({"a": "x", "b": [1, 2], "c": {"k": "v"}, "d": {"nested": {"bad": 1}}});
        assert_eq!(
            "declare a='x'\ndeclare -a b=(1 2 )\ndeclare -A c=(['k']='v' )\n",
            write_structured_attrs_shell(json.as_object().unwrap())
        );
    }

    #[test]
    fn shell_projection_simple_values() {
        let json = json!({
            "quote": "it's",
            "float": 1.0,
            "fraction": 1.5,
            "huge": 1e300,
            "tiny": -1e19,
            "null": null,
            "t": true,
            "f": false,
            "bad-name": "x",
            "mixed": [1, [2]],
        });
        assert_eq!(
            "declare f=\ndeclare float=1\ndeclare null=''\ndeclare quote='it'\\''s'\ndeclare t=1\n",
            write_structured_attrs_shell(json.as_object().unwrap())
        );
    }

    fn info(path: &StorePath, size: u64, refs: &[&StorePath]) -> ExportedPathInfo {
        ExportedPathInfo {
            closure_size: 0,
            nar_sha256: [size as u8; 32],
            nar_size: size,
            path: path.clone(),
            references: refs.iter().map(|p| (*p).clone()).collect(),
        }
    }

    #[test]
    fn prepare_outputs_and_export_graph() {
        let hello = StorePath::from_bytes(b"dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1").unwrap();
        let glibc = StorePath::from_bytes(b"ddwyrxif62r8n6xclvskjyy6szdhvj60-glibc-2.39-5").unwrap();

        let infos = BTreeMap::from([
            (hello.clone(), info(&hello, 10, &[&hello, &glibc])),
            (glibc.clone(), info(&glibc, 5, &[&glibc])),
        ]);

        let mut d = drv(&[(
            "__json",
            r#"{"exportReferencesGraph": {"graph": ["/nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1/bin/hello"]}}"#,
        )]);
        d.outputs.insert(
            "dev".to_string(),
            Output::Floating {
                method: CAMethod::Nar,
                algo: HashAlgo::Sha256,
            },
        );
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();

        let json = parsed
            .prepare_structured_attrs(&infos, &BTreeSet::from([hello.clone(), glibc.clone()]))
            .unwrap()
            .expect("has structured attrs");

        assert_eq!(
            json!({
                "out": hash_placeholder("out"),
                "dev": downstream_placeholder(&drv_path(), "dev"),
            }),
            json["outputs"]
        );

        let graph: BTreeSet<ExportedPathInfo> =
            serde_json::from_value(json["graph"].clone()).unwrap();
        let sizes: Vec<(u64, u64)> = graph.iter().map(|i| (i.nar_size, i.closure_size)).collect();
        // hello sorts before glibc.
        assert_eq!(vec![(10, 15), (5, 5)], sizes);

        // paths outside the input closure are rejected.
        assert_eq!(
            Err(StructuredAttrsError::NotInInputClosure(hello.to_absolute_path())),
            parsed.prepare_structured_attrs(&infos, &BTreeSet::from([glibc]))
        );
    }

    #[test]
    fn prepare_without_structured_attrs() {
        let d = drv(&[]);
        let parsed = ParsedDerivation::new(drv_path(), &d).unwrap();
        assert_eq!(
            None,
            parsed
                .prepare_structured_attrs(
                    &BTreeMap::<StorePath, ExportedPathInfo>::new(),
                    &BTreeSet::new()
                )
                .unwrap()
        );
    }
}
