//! The pipeline payload and the effective configuration derived from it.
//!
//! The payload mirrors what the pipeline hands to the plugin: the workspace, the build being run, and the plugin
//! parameters under `vargs`. Every field is optional. [`normalize`] fills in defaults and resolves paths once, after
//! which the configuration is only ever read.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};

use crate::process::SECRET_MASK;

pub const DEFAULT_REGISTRY: &str = "gcr.io";
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DEFAULT_CONTEXT: &str = ".";
pub const DEFAULT_TAG: &str = crate::docker::LATEST;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Payload {
    #[serde(deserialize_with = "null_as_default")]
    pub workspace: Workspace,
    #[serde(deserialize_with = "null_as_default")]
    pub build: Build,
    #[serde(deserialize_with = "null_as_default")]
    pub vargs: Params,
}

impl Payload {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn into_config(self) -> EffectiveConfig {
        let Payload {
            workspace,
            build,
            vargs,
        } = self;
        normalize(vargs, workspace.path, build.commit)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Workspace {
    #[serde(deserialize_with = "null_as_default")]
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Build {
    #[serde(deserialize_with = "null_as_default")]
    pub commit: String,
}

/// Raw plugin parameters, zero-valued when absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Params {
    #[serde(deserialize_with = "null_as_default")]
    pub registry: String,
    #[serde(deserialize_with = "null_as_default")]
    pub storage_driver: String,
    #[serde(deserialize_with = "null_as_default")]
    pub token: Secret,
    #[serde(deserialize_with = "null_as_default")]
    pub repo: String,
    #[serde(deserialize_with = "one_or_many")]
    pub tag: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub file: String,
    #[serde(deserialize_with = "null_as_default")]
    pub context: String,
    #[serde(deserialize_with = "null_as_default")]
    pub load: String,
    #[serde(deserialize_with = "null_as_default")]
    pub save: Save,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Save {
    /// Absolute or relative to the workspace.
    #[serde(deserialize_with = "null_as_default")]
    pub destination: String,
    /// Only archive these tags.
    #[serde(deserialize_with = "one_or_many")]
    pub tag: Vec<String>,
}

/// Treats `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Accepts `"v1"`, `["v1", "v2"]` and `null`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// A string that is never printed.
#[derive(Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SECRET_MASK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Working directory of every engine command.
    pub workspace: PathBuf,
    /// Local name of the freshly built image, before it is tagged into the repository.
    pub commit: String,
    pub registry: String,
    pub storage_driver: Option<String>,
    pub token: Secret,
    pub repository: String,
    /// Never empty.
    pub tags: Vec<String>,
    pub dockerfile: String,
    pub context: String,
    pub load: Option<PathBuf>,
    pub save: Option<SaveTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub destination: PathBuf,
    /// When empty, the bare repository is archived.
    pub tags: Vec<String>,
}

/// Applies defaults and resolves paths against `workspace`. Never fails.
pub fn normalize(params: Params, workspace: PathBuf, commit: String) -> EffectiveConfig {
    let Params {
        registry,
        storage_driver,
        token,
        repo,
        tag,
        file,
        context,
        load,
        save,
    } = params;

    let registry = or_default(registry, DEFAULT_REGISTRY);
    let repository = qualify_repository(&registry, repo);
    let tags = if tag.is_empty() {
        vec![DEFAULT_TAG.to_owned()]
    } else {
        tag
    };

    let load = non_empty(load).map(|path| resolve_path(&workspace, path));
    let save = non_empty(save.destination).map(|destination| SaveTarget {
        destination: resolve_path(&workspace, destination),
        tags: save.tag,
    });

    EffectiveConfig {
        commit,
        registry,
        storage_driver: non_empty(storage_driver),
        token: Secret(token.0.trim().to_owned()),
        repository,
        tags,
        dockerfile: or_default(file, DEFAULT_DOCKERFILE),
        context: or_default(context, DEFAULT_CONTEXT),
        load,
        save,
        workspace,
    }
}

/// Prefixes `namespace/name` with the registry. Anything with zero or more than one `/` is assumed to be either a
/// local name or already qualified and is returned as is.
///
/// NOTE: `localhost:5000/app` also has exactly one `/` and is qualified a second time.
pub fn qualify_repository(registry: &str, repository: String) -> String {
    if repository.matches('/').count() == 1 {
        format!("{registry}/{repository}")
    } else {
        repository
    }
}

/// Joins relative paths onto the workspace.
pub fn resolve_path(workspace: &Path, path: String) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn or_default(value: String, default: &str) -> String {
    non_empty(value).unwrap_or_else(|| default.to_owned())
}
