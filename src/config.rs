use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    pub images: Images,
    #[serde(default)]
    pub controller: Controller,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webserver {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Images {
    /// Base image every customized image is generated from
    pub base_image_path: PathBuf,
    /// Externally reachable URL of the webserver, used to build image URLs
    pub base_url: String,
    #[serde(default = "default_max_network_data_bytes")]
    pub max_network_data_bytes: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct Controller {
    /// Only watch ImageRequests in this namespace, all namespaces if unset
    pub namespace: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_max_network_data_bytes() -> usize {
    1024 * 1024
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
