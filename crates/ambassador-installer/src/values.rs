//! Helm values
//!
//! Values are kept as a typed tree. Dotted keys (`image.tag`) and nested maps
//! land in the same place, so `{"image.tag": "1"}` and `{"image": {"tag": "1"}}`
//! are the same value. The tree is flattened into `--set` arguments only when
//! handed to Helm.
//!
//! Precedence, lowest first:
//! 1. built-in defaults
//! 2. values files, later files overriding earlier ones
//! 3. `spec.helmValues`
//! 4. values derived from the spec (`baseImage`, `logLevel`, flavor)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ambassador_common::crd::{AmbassadorInstallationSpec, Flavor};
use ambassador_common::{Error, Result};
use tracing::{debug, info};

/// Image repository used for the open-source flavor
pub const OSS_IMAGE_REPOSITORY: &str = "quay.io/datawire/ambassador";

/// Values files read on every pass, in increasing precedence
pub const DEFAULT_VALUES_FILES: [&str; 5] = [
    "/etc/helm/values.yaml",
    "/tmp/helm/values.yaml",
    "/etc/values.yaml",
    "/tmp/values.yaml",
    "/tmp/cloud-values.yaml",
];

/// A single Helm value
#[derive(Clone, Debug, PartialEq)]
pub enum HelmValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// String
    String(String),
    /// List of values
    List(Vec<HelmValue>),
    /// Nested values
    Map(HelmValues),
}

impl HelmValue {
    /// Convert a JSON value; `null` has no Helm equivalent and yields `None`
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::String(s)),
            Value::Array(items) => Some(Self::List(
                items.into_iter().filter_map(Self::from_json).collect(),
            )),
            Value::Object(map) => Some(Self::Map(HelmValues::from_json_map(map))),
        }
    }

    /// JSON encoding of the value
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::from(*n),
            Self::Float(f) => Value::from(*f),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(values) => values.to_json(),
        }
    }
}

impl From<&str> for HelmValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for HelmValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Tree of Helm values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelmValues(BTreeMap<String, HelmValue>);

impl HelmValues {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in values every release gets
    pub fn defaults() -> Self {
        let mut values = Self::new();
        values.insert_path("deploymentTool", "amb-oper".into());
        values
    }

    /// Build a tree from a JSON object, normalizing dotted keys
    pub fn from_json_map<I>(map: I) -> Self
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut values = Self::new();
        for (key, value) in map {
            if let Some(value) = HelmValue::from_json(value) {
                values.insert_path(&key, value);
            }
        }
        values
    }

    /// Set the value at a dotted path
    ///
    /// Maps merge into what is already there; any other value replaces it.
    /// Intermediate non-map values are replaced by maps.
    pub fn insert_path(&mut self, path: &str, value: HelmValue) {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        match rest {
            Some(rest) => {
                let entry = self
                    .0
                    .entry(head.to_string())
                    .or_insert_with(|| HelmValue::Map(Self::new()));
                if !matches!(entry, HelmValue::Map(_)) {
                    *entry = HelmValue::Map(Self::new());
                }
                if let HelmValue::Map(child) = entry {
                    child.insert_path(rest, value);
                }
            }
            None => self.merge_entry(head.to_string(), value),
        }
    }

    /// Deep-merge `other` into `self`; `other` wins on conflicts
    pub fn merge(&mut self, other: HelmValues) {
        for (key, value) in other.0 {
            self.merge_entry(key, value);
        }
    }

    fn merge_entry(&mut self, key: String, value: HelmValue) {
        match value {
            HelmValue::Map(incoming) => match self.0.get_mut(&key) {
                Some(HelmValue::Map(existing)) => existing.merge(incoming),
                _ => {
                    self.0.insert(key, HelmValue::Map(incoming));
                }
            },
            value => {
                self.0.insert(key, value);
            }
        }
    }

    /// Value at a dotted path
    pub fn get_path(&self, path: &str) -> Option<&HelmValue> {
        match path.split_once('.') {
            Some((head, rest)) => match self.0.get(head) {
                Some(HelmValue::Map(child)) => child.get_path(rest),
                _ => None,
            },
            None => self.0.get(path),
        }
    }

    /// `enableAES` when set as a boolean
    pub fn enable_aes(&self) -> Option<bool> {
        match self.get_path("enableAES") {
            Some(HelmValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Whether a non-empty `image.repository` is configured
    pub fn has_image_repository(&self) -> bool {
        matches!(self.get_path("image.repository"), Some(HelmValue::String(s)) if !s.is_empty())
    }

    /// Leaves of the tree keyed by dotted path
    ///
    /// Lists and empty maps are leaves, so an explicit `{}` still reaches Helm.
    pub fn flatten(&self) -> BTreeMap<String, HelmValue> {
        let mut out = BTreeMap::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut BTreeMap<String, HelmValue>) {
        for (key, value) in &self.0 {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                HelmValue::Map(child) if !child.is_empty() => child.flatten_into(&path, out),
                leaf => {
                    out.insert(path, leaf.clone());
                }
            }
        }
    }

    /// Helm command-line arguments setting every leaf
    ///
    /// Strings go through `--set-string` so Helm does not retype them.
    /// Floats, lists and empty maps go through `--set-json` so they keep
    /// their type. Booleans and integers use plain `--set`.
    pub fn set_args(&self) -> Vec<String> {
        self.flatten()
            .into_iter()
            .flat_map(|(path, value)| {
                let (flag, rendered) = match &value {
                    HelmValue::String(s) => ("--set-string", escape_set_value(s)),
                    HelmValue::Bool(b) => ("--set", b.to_string()),
                    HelmValue::Int(n) => ("--set", n.to_string()),
                    HelmValue::Float(_) | HelmValue::List(_) | HelmValue::Map(_) => {
                        ("--set-json", value.to_json().to_string())
                    }
                };
                [flag.to_string(), format!("{}={}", path, rendered)]
            })
            .collect()
    }

    /// Whether two trees hold the same values as far as Helm is concerned
    ///
    /// Numbers compare by value, so `2` read back from a release equals a
    /// requested `2.0`.
    pub fn same_values(&self, other: &HelmValues) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().all(|(key, value)| {
                other
                    .0
                    .get(key)
                    .is_some_and(|theirs| same_value(value, theirs))
            })
    }

    /// JSON object encoding of the tree
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Whether the tree is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn same_value(a: &HelmValue, b: &HelmValue) -> bool {
    match (a, b) {
        (HelmValue::Int(i), HelmValue::Float(f)) | (HelmValue::Float(f), HelmValue::Int(i)) => {
            *i as f64 == *f
        }
        (HelmValue::List(x), HelmValue::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| same_value(x, y))
        }
        (HelmValue::Map(x), HelmValue::Map(y)) => x.same_values(y),
        _ => a == b,
    }
}

/// Helm splits `--set` values on commas
fn escape_set_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,")
}

/// Split `repository:tag`
///
/// Exactly one colon is accepted, so registries with a port are rejected.
pub fn parse_repo_tag(image: &str) -> Option<(&str, &str)> {
    let mut parts = image.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(tag), None) => Some((repo, tag)),
        _ => None,
    }
}

/// Read values files in order, later files overriding earlier ones
///
/// Missing and unparsable files are logged and skipped.
pub fn load_values_files(paths: &[PathBuf]) -> HelmValues {
    let mut values = HelmValues::new();
    for path in paths {
        match read_values_file(path) {
            Ok(Some(file_values)) => {
                info!(file = %path.display(), "loaded values file");
                values.merge(file_values);
            }
            Ok(None) => debug!(file = %path.display(), "values file is empty"),
            Err(e) => debug!(file = %path.display(), error = %e, "skipping values file"),
        }
    }
    values
}

fn read_values_file(path: &Path) -> std::result::Result<Option<HelmValues>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let parsed: serde_json::Value = serde_yaml::from_str(&content).map_err(|e| e.to_string())?;
    match parsed {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(HelmValues::from_json_map(map))),
        other => Err(format!("expected a mapping, found {}", json_kind(&other))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "a mapping",
    }
}

/// Values for a release of `spec` with the given flavor
///
/// `file_values` is the already-merged content of the values files.
pub fn desired_values(
    spec: &AmbassadorInstallationSpec,
    flavor: Flavor,
    file_values: &HelmValues,
) -> Result<HelmValues> {
    let mut values = HelmValues::defaults();
    values.merge(file_values.clone());
    values.merge(HelmValues::from_json_map(spec.helm_values.clone()));

    if let Some(image) = spec.base_image.as_deref().filter(|i| !i.is_empty()) {
        let (repository, tag) = parse_repo_tag(image).ok_or_else(|| {
            Error::parameters(format!("could not parse base image from {}", image))
        })?;
        debug!(repository, tag, "using custom base image");
        values.insert_path("image.repository", repository.into());
        values.insert_path("image.tag", tag.into());
    }

    if let Some(level) = spec.log_level.as_deref().filter(|l| !l.is_empty()) {
        values.insert_path("pro.logLevel", level.into());
    }

    if flavor == Flavor::Oss {
        values.insert_path("enableAES", false.into());
        if !values.has_image_repository() {
            values.insert_path("image.repository", OSS_IMAGE_REPOSITORY.into());
        }
    }

    Ok(values)
}
