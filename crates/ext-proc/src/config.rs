//! Configuration loading and validation for the external processor.
//!
//! Settings come from an optional JSON config file (path in `CONFIG_FILE`)
//! overlaid with environment variables. The bundle-service token is
//! redacted from all Debug output.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable naming the config file to load.
pub const ENV_CONFIG_FILE: &str = "CONFIG_FILE";

/// Top-level service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Listen address for the gRPC server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for the gRPC server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Filter implementation selector.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Filter-local settings.
    #[serde(default)]
    pub local: LocalSettings,

    /// Trace export settings.
    #[serde(default)]
    pub otlp: OtlpSettings,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level", rename = "logLevel", alias = "log_level")]
    pub log_level: String,
}

/// Settings evaluated by the local policy engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalSettings {
    /// Policy engine source and data configuration.
    #[serde(default, rename = "policyEngine", alias = "policy_engine")]
    pub policy_engine: PolicyEngineSettings,
}

/// Policy engine configuration: exactly one source should be set.
#[derive(Clone, Default, Deserialize)]
pub struct PolicyEngineSettings {
    /// Directory of `.rego` policy files.
    #[serde(default, rename = "policiesDirectory", alias = "policies_directory")]
    pub policies_directory: String,

    /// OCI bundle resource, `<host>/<repo>:<tag>`.
    #[serde(default, rename = "bundleResource", alias = "bundle_resource")]
    pub bundle_resource: String,

    /// Explicit bundle service URL; derived from the resource when empty.
    #[serde(default, rename = "bundleServiceUrl", alias = "bundle_service_url")]
    pub bundle_service_url: String,

    /// Bearer token for the bundle service.
    #[serde(
        default,
        rename = "bundleServiceCredentialsToken",
        alias = "bundle_service_credentials_token"
    )]
    pub bundle_service_credentials_token: String,

    /// Authorization scheme for the bundle service token.
    #[serde(
        default,
        rename = "bundleServiceCredentialsScheme",
        alias = "bundle_service_credentials_scheme"
    )]
    pub bundle_service_credentials_scheme: String,

    /// Inline policy modules, filename to contents.
    #[serde(default)]
    pub modules: Option<HashMap<String, String>>,

    /// Synthesize an allow-all policy when no other source is set.
    #[serde(default, rename = "allowAll", alias = "allow_all")]
    pub allow_all: bool,

    /// Static data document made available to policies.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Debug for PolicyEngineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = if self.bundle_service_credentials_token.is_empty() {
            ""
        } else {
            "****"
        };
        f.debug_struct("PolicyEngineSettings")
            .field("policies_directory", &self.policies_directory)
            .field("bundle_resource", &self.bundle_resource)
            .field("bundle_service_url", &self.bundle_service_url)
            .field("bundle_service_credentials_token", &token)
            .field(
                "bundle_service_credentials_scheme",
                &self.bundle_service_credentials_scheme,
            )
            .field("modules", &self.modules.as_ref().map(HashMap::len))
            .field("allow_all", &self.allow_all)
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// OTLP trace exporter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OtlpSettings {
    /// OTLP/gRPC collector endpoint.
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
}

impl Default for OtlpSettings {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8281
}
fn default_filter() -> String {
    "opa".into()
}
fn default_otlp_endpoint() -> String {
    "localhost:4317".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Settings {
    /// Load and validate settings from the config file (if named by
    /// `CONFIG_FILE`) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on unparsable sources or values.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let cfg = builder
            .add_source(config::Environment::default().separator("__"))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build configuration: {e}")))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(format!("failed to deserialise configuration: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            filter: default_filter(),
            local: LocalSettings::default(),
            otlp: OtlpSettings::default(),
            log_level: default_log_level(),
        }
    }
}
