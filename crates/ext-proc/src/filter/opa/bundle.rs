//! OCI policy bundle download.
//!
//! A bundle resource is `<host>/<repo>:<tag>`. The manifest and the bundle
//! layer are fetched through the OCI distribution API; the layer is a
//! gzipped tar archive whose `.rego` entries become the policy module set.
//! The transfer uses `https` unless the `USE_HTTP` environment variable is
//! `true`, and sends the configured credentials (default scheme `Bearer`)
//! when a token is present.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::PolicyEngineSettings;
use crate::error::ConfigError;

/// Environment variable that downgrades the bundle transfer to plain HTTP.
pub const ENV_USE_HTTP: &str = "USE_HTTP";

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
struct Layer {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
}

/// Download the configured bundle and return its policy modules keyed by
/// filename.
///
/// # Errors
///
/// Returns [`ConfigError::BundleDownload`] on any transfer or unpack
/// failure, [`ConfigError::Invalid`] for an unparsable resource, and
/// [`ConfigError::EmptyBundle`] when the bundle holds no `.rego` modules.
pub async fn download_policy_bundle(
    settings: &PolicyEngineSettings,
) -> Result<HashMap<String, String>, ConfigError> {
    let resource = settings.bundle_resource.as_str();
    let (registry, repo, tag) = parse_resource(resource)?;

    let base_url = if settings.bundle_service_url.is_empty() {
        format!("{}://{registry}", bundle_protocol())
    } else {
        settings.bundle_service_url.clone()
    };

    info!(resource, base_url, "triggering policy bundle download from oci registry");
    let client = reqwest::Client::new();

    let manifest_url = format!("{base_url}/v2/{repo}/manifests/{tag}");
    let manifest: Manifest = authorized(client.get(&manifest_url), settings)
        .header(
            reqwest::header::ACCEPT,
            "application/vnd.oci.image.manifest.v1+json",
        )
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| pull_error(resource, &e))?
        .json()
        .await
        .map_err(|e| pull_error(resource, &e))?;

    let layer = manifest
        .layers
        .iter()
        .find(|l| l.media_type.ends_with("tar+gzip"))
        .ok_or_else(|| {
            ConfigError::BundleDownload(format!(
                "failed to pull {resource}: manifest has no tar+gzip bundle layer"
            ))
        })?;
    debug!(digest = %layer.digest, "fetching bundle layer");

    let blob_url = format!("{base_url}/v2/{repo}/blobs/{}", layer.digest);
    let blob = authorized(client.get(&blob_url), settings)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| pull_error(resource, &e))?
        .bytes()
        .await
        .map_err(|e| pull_error(resource, &e))?;

    let modules = extract_rego_modules(&blob).map_err(|e| {
        ConfigError::BundleDownload(format!("failed to unpack bundle {resource}: {e}"))
    })?;
    if modules.is_empty() {
        return Err(ConfigError::EmptyBundle);
    }

    info!(modules = modules.len(), "bundle downloaded successfully");
    Ok(modules)
}

fn authorized(
    req: reqwest::RequestBuilder,
    settings: &PolicyEngineSettings,
) -> reqwest::RequestBuilder {
    if settings.bundle_service_credentials_token.is_empty() {
        return req;
    }
    let scheme = if settings.bundle_service_credentials_scheme.is_empty() {
        "Bearer"
    } else {
        settings.bundle_service_credentials_scheme.as_str()
    };
    req.header(
        reqwest::header::AUTHORIZATION,
        format!("{scheme} {}", settings.bundle_service_credentials_token),
    )
}

fn pull_error(resource: &str, err: &dyn std::fmt::Display) -> ConfigError {
    ConfigError::BundleDownload(format!("failed to pull {resource}: {err}"))
}

fn bundle_protocol() -> &'static str {
    match std::env::var(ENV_USE_HTTP) {
        Ok(v) if v.parse::<bool>().unwrap_or(false) => "http",
        _ => "https",
    }
}

/// Split `<host>/<repo>:<tag>` into its parts; the tag defaults to `latest`.
fn parse_resource(resource: &str) -> Result<(&str, &str, &str), ConfigError> {
    let (registry, rest) = resource.split_once('/').ok_or_else(|| {
        ConfigError::Invalid(format!("bundle resource {resource:?} is missing a repository"))
    })?;
    let (repo, tag) = rest.rsplit_once(':').unwrap_or((rest, "latest"));
    if registry.is_empty() || repo.is_empty() || tag.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "bundle resource {resource:?} is malformed"
        )));
    }
    Ok((registry, repo, tag))
}

fn extract_rego_modules(blob: &[u8]) -> std::io::Result<HashMap<String, String>> {
    let mut modules = HashMap::new();
    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.extension().and_then(|e| e.to_str()) != Some("rego") {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;
        modules.insert(name, contents);
    }
    Ok(modules)
}
