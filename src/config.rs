//! Backend target configuration.
//!
//! Each non-relational renderer binds registered table names to a concrete
//! resource. Targets are validated when registered; after setup the map is
//! read-only.

use crate::backend::BackendKind;
use crate::error::{QueryError, Result};
use crate::schema::{check_identifier, Registry, Table};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

static KEY_PATTERN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_:.\-]*\{id\}[A-Za-z0-9_:.\-]*$").unwrap());

static INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.\-]{0,254}$").unwrap());

static BUCKET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.\-]{1,61}[a-z0-9]$").unwrap());

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-/]*$").unwrap());

/// Data structure a key-value table is stored as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStructure {
    String,
    #[default]
    Hash,
    Set,
    SortedSet,
    List,
}

pub fn valid_data_structure(value: &str) -> Result<DataStructure> {
    match value.trim().to_lowercase().as_str() {
        "string" | "scalar" => Ok(DataStructure::String),
        "hash" | "map" => Ok(DataStructure::Hash),
        "set" => Ok(DataStructure::Set),
        "sorted_set" | "zset" => Ok(DataStructure::SortedSet),
        "list" => Ok(DataStructure::List),
        _ => Err(QueryError::InvalidKeyword {
            kind: "data structure",
            value: value.to_string(),
        }),
    }
}

/// Index refresh behaviour after a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshPolicy {
    #[serde(rename = "true")]
    True,
    #[default]
    #[serde(rename = "false")]
    False,
    #[serde(rename = "wait_for")]
    WaitFor,
}

impl RefreshPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPolicy::True => "true",
            RefreshPolicy::False => "false",
            RefreshPolicy::WaitFor => "wait_for",
        }
    }
}

pub fn valid_refresh_policy(value: &str) -> Result<RefreshPolicy> {
    match value.trim().to_lowercase().as_str() {
        "true" => Ok(RefreshPolicy::True),
        "false" => Ok(RefreshPolicy::False),
        "wait_for" => Ok(RefreshPolicy::WaitFor),
        _ => Err(QueryError::InvalidKeyword {
            kind: "refresh policy",
            value: value.to_string(),
        }),
    }
}

/// Validation hook run when a target is registered.
pub trait TargetSpec {
    fn validate(&self) -> Result<()>;
}

/// Key-value target: a key pattern with one `{id}` slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueTarget {
    pub key_pattern: String,
    #[serde(default)]
    pub structure: DataStructure,
    pub id_field: String,
}

impl KeyValueTarget {
    pub fn new(key_pattern: impl Into<String>, structure: DataStructure, id_field: impl Into<String>) -> Self {
        Self {
            key_pattern: key_pattern.into(),
            structure,
            id_field: id_field.into(),
        }
    }

    /// Key with the id slot filled by `id`.
    pub fn key(&self, id: &str) -> String {
        self.key_pattern.replacen("{id}", id, 1)
    }

    /// Glob matching every key of this target.
    pub fn scan_pattern(&self) -> String {
        self.key("*")
    }
}

impl TargetSpec for KeyValueTarget {
    fn validate(&self) -> Result<()> {
        if !KEY_PATTERN_RE.is_match(&self.key_pattern) {
            return Err(QueryError::Config(format!(
                "key pattern '{}' must contain exactly one {{id}} slot and only [A-Za-z0-9_:.-]",
                self.key_pattern
            )));
        }
        check_identifier("field", &self.id_field)
    }
}

/// Search target: an index and the field holding document ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTarget {
    pub index: String,
    pub id_field: String,
    #[serde(default)]
    pub analyzer: Option<String>,
    #[serde(default)]
    pub refresh: RefreshPolicy,
}

impl SearchTarget {
    pub fn new(index: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            id_field: id_field.into(),
            analyzer: None,
            refresh: RefreshPolicy::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.analyzer = Some(analyzer.into());
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }
}

impl TargetSpec for SearchTarget {
    fn validate(&self) -> Result<()> {
        if !INDEX_RE.is_match(&self.index) {
            return Err(QueryError::Config(format!("invalid index name '{}'", self.index)));
        }
        if let Some(analyzer) = &self.analyzer {
            check_identifier("analyzer", analyzer)?;
        }
        check_identifier("field", &self.id_field)
    }
}

/// Object-store target: bucket, key prefix and id field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTarget {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub id_field: String,
}

impl ObjectTarget {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            id_field: id_field.into(),
        }
    }
}

impl TargetSpec for ObjectTarget {
    fn validate(&self) -> Result<()> {
        if !BUCKET_RE.is_match(&self.bucket) {
            return Err(QueryError::Config(format!("invalid bucket name '{}'", self.bucket)));
        }
        if !PREFIX_RE.is_match(&self.prefix) || self.prefix.starts_with('/') {
            return Err(QueryError::Config(format!("invalid key prefix '{}'", self.prefix)));
        }
        check_identifier("field", &self.id_field)
    }
}

/// Serializable table → target map, e.g. loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct TargetConfig<T> {
    #[serde(default)]
    pub targets: BTreeMap<String, T>,
}

impl<T> Default for TargetConfig<T> {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
        }
    }
}

impl<T: DeserializeOwned> TargetConfig<T> {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub type KeyValueConfig = TargetConfig<KeyValueTarget>;
pub type SearchConfig = TargetConfig<SearchTarget>;
pub type ObjectStoreConfig = TargetConfig<ObjectTarget>;

/// Registered targets held by a renderer.
#[derive(Debug, Clone)]
pub(crate) struct Targets<T> {
    backend: BackendKind,
    targets: HashMap<String, T>,
}

impl<T: TargetSpec> Targets<T> {
    pub(crate) fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            targets: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, table: &Table, target: T) -> Result<()> {
        target.validate()?;
        tracing::info!(backend = %self.backend, table = %table, "registered target");
        self.targets.insert(table.name().to_string(), target);
        Ok(())
    }

    /// Register every entry of `config`, resolving table names through the
    /// registry.
    pub(crate) fn register_all(&mut self, registry: &Registry, config: TargetConfig<T>) -> Result<()> {
        for (name, target) in config.targets {
            let table = registry.try_table(&name)?;
            self.register(&table, target)?;
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, table: &Table) -> Result<&T> {
        self.targets
            .get(table.name())
            .ok_or_else(|| QueryError::UnregisteredTarget {
                table: table.name().to_string(),
                backend: self.backend,
            })
    }
}
