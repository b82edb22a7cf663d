//! TOML-based configuration system for RosterSync.
//!
//! Store credentials are never written in the file. Each store names the
//! environment variable holding its API token in a `token_env` field, and
//! the secret is resolved at startup via [`AppConfig::resolve_env_vars`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::reconcile::{FieldPolicy, FieldRule};
use crate::record::Side;
use crate::schema::RecordSchema;
use crate::sync_engine::{ReconcileSettings, SyncDirection};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / logging / storage settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Shared field vocabulary.
    #[serde(default)]
    pub schema: RecordSchema,

    /// Matching and resolution behaviour.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Store A (the first side of every comparison).
    pub store_a: StoreConfig,

    /// Store B.
    pub store_b: StoreConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between reconciliation sweeps (default 3600).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily-rotated log files. Logs go to stderr only when
    /// unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory for persistent data (run-history database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of runs kept in the history database; older runs are pruned
    /// after each daemon sweep. `0` keeps everything.
    #[serde(default = "default_history_keep")]
    pub history_keep: u32,
}

fn default_poll_interval() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/rostersync")
}
fn default_history_keep() -> u32 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            log_dir: None,
            data_dir: default_data_dir(),
            history_keep: default_history_keep(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Matching and per-field resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Ordered pivot fields forming the identity tuple.
    #[serde(default = "default_pivot_fields")]
    pub pivot_fields: Vec<String>,

    /// Alternative pivot sets tried in order on records the earlier sets
    /// left unmatched, e.g. `[["last_name", "first_name"]]`.
    #[serde(default)]
    pub fallback_pivots: Vec<Vec<String>>,

    /// Which stores may be written.
    #[serde(default)]
    pub direction: SyncDirection,

    /// Create records missing from the other store.
    #[serde(default = "default_true")]
    pub create_missing: bool,

    /// Report writes without performing them.
    #[serde(default)]
    pub dry_run: bool,

    /// Rule for fields without an explicit entry in `rules`.
    #[serde(default)]
    pub default_rule: FieldRule,

    /// Per-field resolution rules.
    #[serde(default)]
    pub rules: BTreeMap<String, FieldRule>,

    /// Fields compared on raw values rather than normalized ones.
    #[serde(default)]
    pub exact_fields: BTreeSet<String>,
}

fn default_pivot_fields() -> Vec<String> {
    vec!["email_address".into()]
}
fn default_true() -> bool {
    true
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pivot_fields: default_pivot_fields(),
            fallback_pivots: Vec::new(),
            direction: SyncDirection::default(),
            create_missing: true,
            dry_run: false,
            default_rule: FieldRule::default(),
            rules: BTreeMap::new(),
            exact_fields: BTreeSet::new(),
        }
    }
}

impl ReconcileConfig {
    pub fn policy(&self) -> FieldPolicy {
        FieldPolicy {
            rules: self.rules.clone(),
            default_rule: self.default_rule,
            exact_fields: self.exact_fields.clone(),
        }
    }

    /// Engine settings for one run. Every field is kept; see
    /// [`AppConfig::reconcile_settings`] for settings bound to the stores.
    pub fn to_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            pivot_fields: self.pivot_fields.clone(),
            fallback_pivots: self.fallback_pivots.clone(),
            shared_fields: None,
            policy: self.policy(),
            direction: self.direction,
            create_missing: self.create_missing,
            dry_run: self.dry_run,
        }
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// One record store, selected by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    ActionNetwork(ActionNetworkConfig),
    Airtable(AirtableConfig),
}

impl StoreConfig {
    /// Display name used in logs and summaries.
    pub fn name(&self) -> &str {
        match self {
            Self::ActionNetwork(c) => &c.name,
            Self::Airtable(c) => &c.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ActionNetwork(_) => "action_network",
            Self::Airtable(_) => "airtable",
        }
    }

    pub fn token_env(&self) -> &str {
        match self {
            Self::ActionNetwork(c) => &c.token_env,
            Self::Airtable(c) => &c.token_env,
        }
    }

    /// The resolved API token, if `resolve_env_vars` found one.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::ActionNetwork(c) => c.token.as_deref(),
            Self::Airtable(c) => c.token.as_deref(),
        }
    }

    /// Normalized field names this store can read and write.
    pub fn mapped_fields(&self) -> BTreeSet<&str> {
        match self {
            Self::ActionNetwork(c) => ActionNetworkConfig::STANDARD_FIELDS
                .iter()
                .copied()
                .chain(c.custom_fields.keys().map(String::as_str))
                .collect(),
            Self::Airtable(c) => c.field_map.keys().map(String::as_str).collect(),
        }
    }

    fn resolve_token(&mut self, section: &str) {
        let field = format!("{}.token_env", section);
        let token = resolve_optional_env(self.token_env(), &field);
        match self {
            Self::ActionNetwork(c) => c.token = token,
            Self::Airtable(c) => c.token = token,
        }
    }

    fn validate(&self, section: &str, schema: &RecordSchema) -> Result<(), ConfigError> {
        if self.token_env().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.token_env", section),
                detail: "token environment variable name must not be empty".into(),
            });
        }

        match self {
            Self::ActionNetwork(c) => {
                require_url(&c.api_url, &format!("{}.api_url", section))?;
                for field in c.custom_fields.keys() {
                    require_declared(schema, field, &format!("{}.custom_fields", section))?;
                }
            }
            Self::Airtable(c) => {
                require_url(&c.api_url, &format!("{}.api_url", section))?;
                if c.base_id.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.base_id", section),
                        detail: "Airtable base id must not be empty".into(),
                    });
                }
                if c.table.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.table", section),
                        detail: "Airtable table must not be empty".into(),
                    });
                }
                if c.field_map.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.field_map", section),
                        detail: "at least one field must be mapped".into(),
                    });
                }
                for field in c.field_map.keys() {
                    require_declared(schema, field, &format!("{}.field_map", section))?;
                }
            }
        }

        for field in schema.field_names() {
            if !self.mapped_fields().contains(field) {
                warn!(store = self.name(), field, "schema field not mapped by store; it will not be synced");
            }
        }
        Ok(())
    }
}

/// ActionNetwork (OSDI) people endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNetworkConfig {
    #[serde(default = "default_action_network_name")]
    pub name: String,

    /// API root (default `https://actionnetwork.org/api/v2`).
    #[serde(default = "default_action_network_url")]
    pub api_url: String,

    /// Environment variable holding the `OSDI-API-Token`.
    pub token_env: String,

    /// Extra normalized fields stored as OSDI custom fields, keyed by
    /// normalized name with the custom-field key as value.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,

    /// Resolved token (not serialized).
    #[serde(skip)]
    pub token: Option<String>,
}

impl ActionNetworkConfig {
    /// Normalized fields carried by the standard OSDI person shape.
    pub const STANDARD_FIELDS: [&'static str; 4] =
        ["email_address", "first_name", "last_name", "zip_code"];
}

fn default_action_network_name() -> String {
    "ActionNetwork".into()
}
fn default_action_network_url() -> String {
    "https://actionnetwork.org/api/v2".into()
}

/// Airtable table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirtableConfig {
    #[serde(default = "default_airtable_name")]
    pub name: String,

    /// API root (default `https://api.airtable.com/v0`).
    #[serde(default = "default_airtable_url")]
    pub api_url: String,

    /// Base id (`app...`).
    pub base_id: String,

    /// Table name or id.
    pub table: String,

    /// Environment variable holding the personal access token.
    pub token_env: String,

    /// Normalized field name -> Airtable column name.
    #[serde(default = "default_airtable_field_map")]
    pub field_map: BTreeMap<String, String>,

    /// Column holding a last-modified time. Falls back to the record's
    /// `createdTime` when unset.
    #[serde(default)]
    pub modified_field: Option<String>,

    /// Resolved token (not serialized).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_airtable_name() -> String {
    "Airtable".into()
}
fn default_airtable_url() -> String {
    "https://api.airtable.com/v0".into()
}
fn default_airtable_field_map() -> BTreeMap<String, String> {
    [
        ("email_address", "Email Address"),
        ("first_name", "First Name"),
        ("last_name", "Last Name"),
        ("zip_code", "Zip code"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve each store's `token_env` from the environment.
    ///
    /// A missing variable only logs a warning; building a connection for
    /// that store fails later with [`ConfigError::EnvVarMissing`]. This lets
    /// `validate` run without credentials.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        self.store_a.resolve_token("store_a");
        self.store_b.resolve_token("store_b");
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.schema.fields.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "schema.fields".into(),
                detail: "at least one field must be declared".into(),
            });
        }

        let reconcile = &self.reconcile;
        self.validate_pivot(&reconcile.pivot_fields, "reconcile.pivot_fields")?;
        for (i, pivot) in reconcile.fallback_pivots.iter().enumerate() {
            let section = format!("reconcile.fallback_pivots[{}]", i);
            self.validate_pivot(pivot, &section)?;
            let mut earlier = std::iter::once(&reconcile.pivot_fields)
                .chain(&reconcile.fallback_pivots[..i]);
            if earlier.any(|p| p == pivot) {
                return Err(ConfigError::InvalidValue {
                    field: section,
                    detail: "pivot set repeats an earlier one".into(),
                });
            }
        }
        for field in reconcile.rules.keys() {
            require_declared(&self.schema, field, "reconcile.rules")?;
        }
        for field in &reconcile.exact_fields {
            require_declared(&self.schema, field, "reconcile.exact_fields")?;
        }

        self.store_a.validate("store_a", &self.schema)?;
        self.store_b.validate("store_b", &self.schema)?;

        let pivots = std::iter::once(&reconcile.pivot_fields).chain(&reconcile.fallback_pivots);
        for field in pivots.flatten() {
            for (section, store) in [("store_a", &self.store_a), ("store_b", &self.store_b)] {
                if !store.mapped_fields().contains(field.as_str()) {
                    return Err(ConfigError::InvalidValue {
                        field: section.into(),
                        detail: format!("pivot field '{}' is not mapped by this store", field),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_pivot(&self, pivot: &[String], section: &str) -> Result<(), ConfigError> {
        if pivot.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: section.into(),
                detail: "at least one pivot field is required".into(),
            });
        }
        let mut seen = BTreeSet::new();
        for field in pivot {
            require_declared(&self.schema, field, section)?;
            if !seen.insert(field) {
                return Err(ConfigError::InvalidValue {
                    field: section.into(),
                    detail: format!("'{}' is listed twice", field),
                });
            }
        }
        Ok(())
    }

    /// Schema fields both stores map. Only these are compared and written.
    pub fn shared_fields(&self) -> BTreeSet<String> {
        let mapped_a = self.store_a.mapped_fields();
        let mapped_b = self.store_b.mapped_fields();
        self.schema
            .field_names()
            .filter(|f| mapped_a.contains(f) && mapped_b.contains(f))
            .map(str::to_string)
            .collect()
    }

    /// Engine settings for a run between the two configured stores.
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            shared_fields: Some(self.shared_fields()),
            ..self.reconcile.to_settings()
        }
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// The store configured for `side`.
    pub fn store(&self, side: Side) -> &StoreConfig {
        match side {
            Side::A => &self.store_a,
            Side::B => &self.store_b,
        }
    }

    /// Path of the run-history database.
    pub fn db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("rostersync.db")
    }
}

fn require_declared(schema: &RecordSchema, field: &str, section: &str) -> Result<(), ConfigError> {
    if schema.contains(field) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: section.into(),
            detail: format!("field '{}' is not declared in [schema.fields]", field),
        })
    }
}

fn require_url(url: &str, field: &str) -> Result<(), ConfigError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: format!("'{}' is not an http(s) URL", url),
        })
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

/// Starter configuration written by `rostersync init`.
pub const SAMPLE_CONFIG: &str = r#"# RosterSync configuration

[daemon]
poll_interval_secs = 3600
log_level = "info"
data_dir = "/var/lib/rostersync"
history_keep = 1000
# log_dir = "/var/log/rostersync"

[schema.fields]
email_address = "text"
first_name = "text"
last_name = "text"
zip_code = "text"

[reconcile]
pivot_fields = ["email_address"]
fallback_pivots = [["last_name", "first_name"]]
direction = "bidirectional"    # bidirectional | a_to_b | b_to_a
create_missing = true
dry_run = false
default_rule = "prefer_non_empty"
exact_fields = []

[reconcile.rules]
first_name = "most_recently_updated"
last_name = "most_recently_updated"

[store_a]
kind = "action_network"
token_env = "ACTION_NETWORK_TOKEN"

[store_b]
kind = "airtable"
base_id = "appXXXXXXXXXXXXXX"
table = "Members"
token_env = "AIRTABLE_TOKEN"

[store_b.field_map]
email_address = "Email Address"
first_name = "First Name"
last_name = "Last Name"
zip_code = "Zip code"
"#;
