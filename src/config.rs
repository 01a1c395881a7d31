//! Provider configuration and the negotiator that accepts it once per run.
//!
//! Configuration arrives as a JSON object through `Configure`. It is checked
//! against [`provider_config_schema`] plus a few semantic rules, every problem
//! is reported at once, and the accepted value is cached for the rest of the
//! process. Resource operations read it through a [`ProviderContext`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ConfigIssue, ProviderError};
use crate::schema::{Attribute, AttributeType, Schema};
use crate::types::PropertyMap;
use crate::validation::{normalize_integers, validate};

const ROOT_KEY: &str = "<root>";

/// Validated provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Region the provider operates in, e.g. `us-east-1`.
    pub region: String,
    /// Directory every `LocalFile` path is resolved against.
    pub root_dir: PathBuf,
    /// Makes generated values reproducible when set.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Schema of the provider configuration object.
pub fn provider_config_schema() -> Schema {
    Schema::v0()
        .with_attribute(
            "region",
            Attribute::required(AttributeType::String)
                .with_description("Region in the form xx-name-N, e.g. us-east-1"),
        )
        .with_attribute(
            "rootDir",
            Attribute::required(AttributeType::String)
                .with_description("Absolute path of an existing directory that sandboxes LocalFile"),
        )
        .with_attribute(
            "seed",
            Attribute::optional(AttributeType::Int64)
                .with_description("Seed for reproducible generated values"),
        )
}

/// Parse and check a raw configuration object.
///
/// Returns the typed config and one warning per unknown key, or
/// [`ProviderError::InvalidConfig`] listing every problem found.
pub fn parse_config(raw: &Value) -> Result<(ProviderConfig, Vec<String>), ProviderError> {
    let schema = provider_config_schema();

    let Value::Object(obj) = raw else {
        return Err(ProviderError::InvalidConfig(vec![ConfigIssue::new(
            ROOT_KEY,
            "configuration must be a JSON object",
        )]));
    };

    let mut known = PropertyMap::new();
    let mut warnings = Vec::new();
    for (key, value) in obj {
        if schema.attribute(key).is_some() {
            known.insert(key.clone(), value.clone());
        } else {
            warnings.push(format!("unknown configuration key '{}' is ignored", key));
        }
    }

    normalize_integers(&schema, &mut known);

    let mut issues: Vec<ConfigIssue> = validate(&schema, &Value::Object(known.clone()))
        .into_iter()
        .filter(|d| d.is_error())
        .map(|d| ConfigIssue::new(d.attribute.clone().unwrap_or_else(|| ROOT_KEY.into()), d.message()))
        .collect();

    if let Some(Value::String(region)) = known.get("region") {
        if !is_region(region) {
            issues.push(ConfigIssue::new(
                "region",
                format!("'{}' is not a region name like us-east-1", region),
            ));
        }
    }

    if let Some(Value::String(root_dir)) = known.get("rootDir") {
        let path = Path::new(root_dir);
        if !path.is_absolute() {
            issues.push(ConfigIssue::new("rootDir", "must be an absolute path"));
        } else if !path.is_dir() {
            issues.push(ConfigIssue::new(
                "rootDir",
                format!("'{}' is not an existing directory", root_dir),
            ));
        }
    }

    if let Some(Value::Number(seed)) = known.get("seed") {
        if seed.as_i64().is_some_and(|s| s < 0) {
            issues.push(ConfigIssue::new("seed", "must not be negative"));
        }
    }

    if !issues.is_empty() {
        return Err(ProviderError::InvalidConfig(issues));
    }

    let config: ProviderConfig = serde_json::from_value(Value::Object(known))
        .map_err(|e| ProviderError::InvalidConfig(vec![ConfigIssue::new(ROOT_KEY, e.to_string())]))?;
    Ok((config, warnings))
}

// Two-letter area, one or more name parts, then a number: `us-gov-west-1`.
static REGION: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-[0-9]+$"));

fn is_region(region: &str) -> bool {
    REGION.as_ref().is_ok_and(|re| re.is_match(region))
}

/// Accepts provider configuration once and hands it out afterwards.
#[derive(Debug, Default)]
pub struct ConfigNegotiator {
    current: OnceLock<Arc<ProviderConfig>>,
}

impl ConfigNegotiator {
    /// Create a negotiator with no configuration yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `raw` and cache it.
    ///
    /// Configuring again with an equal config succeeds; a different one fails
    /// with [`ProviderError::ConfigurationImmutable`].
    pub fn configure(&self, raw: &Value) -> Result<(Arc<ProviderConfig>, Vec<String>), ProviderError> {
        let (config, warnings) = parse_config(raw)?;
        for warning in &warnings {
            warn!(warning = %warning, "Configuration warning");
        }

        if let Some(current) = self.current.get() {
            return Self::reconfigure(current, &config).map(|c| (c, warnings));
        }

        let config = Arc::new(config);
        match self.current.set(Arc::clone(&config)) {
            Ok(()) => {
                info!(region = %config.region, root_dir = %config.root_dir.display(), "Provider configured");
                Ok((config, warnings))
            },
            Err(_) => {
                // Lost a race with another configure call.
                let current = self.current.get().ok_or(ProviderError::NotConfigured)?;
                Self::reconfigure(current, &config).map(|c| (c, warnings))
            },
        }
    }

    fn reconfigure(
        current: &Arc<ProviderConfig>,
        requested: &ProviderConfig,
    ) -> Result<Arc<ProviderConfig>, ProviderError> {
        if current.as_ref() == requested {
            debug!("Provider already configured with an equal config");
            Ok(Arc::clone(current))
        } else {
            Err(ProviderError::ConfigurationImmutable)
        }
    }

    /// Whether `configure` has succeeded.
    pub fn is_configured(&self) -> bool {
        self.current.get().is_some()
    }

    /// The context resource operations run with.
    pub fn context(&self) -> Result<ProviderContext, ProviderError> {
        self.current
            .get()
            .map(|config| ProviderContext::new(Arc::clone(config)))
            .ok_or(ProviderError::NotConfigured)
    }
}

/// Read-only configuration passed into every engine call.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    config: Arc<ProviderConfig>,
}

impl ProviderContext {
    /// Create a context around an accepted configuration.
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self { config }
    }

    /// The full configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Configured region.
    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Sandbox directory for local files.
    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Seed for generated values, if reproducibility was requested.
    pub fn seed(&self) -> Option<u64> {
        self.config.seed
    }
}
