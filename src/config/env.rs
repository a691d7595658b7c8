//! Environment configuration
//!
//! Every component reads its settings once at startup and receives them as a
//! plain struct. Lookups go through a closure so tests can feed a map instead
//! of mutating the process environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::domain::pipeline::DeployGate;

/// Constants
pub mod constants {
    /// Edge router listen port
    pub const DEFAULT_ROUTER_PORT: u16 = 80;

    /// Backend listen port when `PORT` is unset
    pub const DEFAULT_BACKEND_PORT: u16 = 3000;

    /// Pipeline agent listen port
    pub const DEFAULT_AGENT_PORT: u16 = 9876;

    /// Upstream address of the backend as seen from the router
    pub const DEFAULT_BACKEND_URL: &str = "http://backend:3000";

    /// Document root of the built frontend
    pub const DEFAULT_STATIC_ROOT: &str = "/usr/share/nginx/html";

    /// SPA fallback document
    pub const DEFAULT_INDEX_FILE: &str = "index.html";

    pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 5;

    pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

    /// Max proxied request body (bytes)
    pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

    /// Per command timeout in the release pipeline (seconds)
    pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 1800; // 30 minutes

    /// How long a run waits for manual approval (seconds)
    pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 86_400;

    pub const DEFAULT_MAIN_BRANCH: &str = "main";

    pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

    /// Run history kept in memory
    pub const MAX_RUN_HISTORY: usize = 100;

    /// Max runs not yet finished
    pub const MAX_ACTIVE_RUNS: usize = 20;

    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

use constants::*;

/// Edge router settings
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub port: u16,
    /// Directory holding the built frontend
    pub static_root: PathBuf,
    /// Document served when no static file matches
    pub index_file: String,
    /// Base URL `/api` requests are forwarded to
    pub backend_url: String,
    pub connect_timeout: Duration,
    /// Bound on the whole upstream exchange
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
}

impl RouterConfig {
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: parse_or(&lookup, "ROUTER_PORT", DEFAULT_ROUTER_PORT),
            static_root: lookup("ROUTER_STATIC_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_ROOT)),
            index_file: lookup("ROUTER_INDEX_FILE")
                .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string()),
            backend_url: lookup("ROUTER_BACKEND_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            connect_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ROUTER_CONNECT_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS,
            )),
            upstream_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ROUTER_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )),
            max_body_bytes: parse_or(&lookup, "ROUTER_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
        }
    }

    /// Path of the SPA fallback document
    pub fn index_path(&self) -> PathBuf {
        self.static_root.join(&self.index_file)
    }
}

/// Backend service settings
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub port: u16,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: parse_or(&lookup, "PORT", DEFAULT_BACKEND_PORT),
        }
    }
}

/// Registry login, used by the pipeline only
#[derive(Clone)]
pub struct RegistryCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Registry host (`CI_REGISTRY`), used for `docker login`
    pub address: Option<String>,
    /// Project image prefix (`CI_REGISTRY_IMAGE`)
    pub image_prefix: String,
    pub credentials: Option<RegistryCredentials>,
}

impl RegistryConfig {
    pub fn from_source<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup("CI_REGISTRY").filter(|s| !s.is_empty());
        let image_prefix = lookup("CI_REGISTRY_IMAGE")
            .filter(|s| !s.is_empty())
            .or_else(|| address.clone())
            .unwrap_or_default();

        let user = lookup("CI_REGISTRY_USER").filter(|s| !s.is_empty());
        let password = lookup("CI_REGISTRY_PASSWORD").filter(|s| !s.is_empty());
        let credentials = match (user, password) {
            (Some(user), Some(password)) => Some(RegistryCredentials { user, password }),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Only one of CI_REGISTRY_USER / CI_REGISTRY_PASSWORD is set, registry login disabled");
                None
            }
            (None, None) => None,
        };

        Self {
            address,
            image_prefix,
            credentials,
        }
    }
}

/// Release pipeline settings
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// The only branch that triggers releases
    pub main_branch: String,
    pub gate: DeployGate,
    /// Checkout holding the component sources and the compose file
    pub work_dir: PathBuf,
    /// Orchestration descriptor, relative to `work_dir` unless absolute
    pub compose_file: String,
    pub registry: RegistryConfig,
    pub step_timeout: Duration,
    pub approval_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            main_branch: lookup("RELEASE_MAIN_BRANCH")
                .unwrap_or_else(|| DEFAULT_MAIN_BRANCH.to_string()),
            gate: lookup("RELEASE_DEPLOY_GATE")
                .map(|v| DeployGate::from_str(&v))
                .unwrap_or(DeployGate::Manual),
            work_dir: lookup("RELEASE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            compose_file: lookup("RELEASE_COMPOSE_FILE")
                .unwrap_or_else(|| DEFAULT_COMPOSE_FILE.to_string()),
            registry: RegistryConfig::from_source(&lookup),
            step_timeout: Duration::from_secs(parse_or(
                &lookup,
                "RELEASE_STEP_TIMEOUT_SECS",
                DEFAULT_STEP_TIMEOUT_SECS,
            )),
            approval_timeout: Duration::from_secs(parse_or(
                &lookup,
                "RELEASE_APPROVAL_TIMEOUT_SECS",
                DEFAULT_APPROVAL_TIMEOUT_SECS,
            )),
        }
    }

    /// Absolute or work-dir relative descriptor path
    pub fn compose_path(&self) -> PathBuf {
        let file = PathBuf::from(&self.compose_file);
        if file.is_absolute() {
            file
        } else {
            self.work_dir.join(file)
        }
    }
}

/// Pipeline agent (control API) settings
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub port: u16,
    /// Key expected in `x-api-key` on mutating endpoints
    pub api_key: String,
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = load_with_fallback(&lookup, "DEPLOY_AGENT_API_KEY", "API_KEY")
            .unwrap_or_else(|| {
                warn!("DEPLOY_AGENT_API_KEY not set, using insecure default");
                "change-me-in-production".to_string()
            });

        Self {
            port: parse_or(&lookup, "AGENT_PORT", DEFAULT_AGENT_PORT),
            api_key,
            pipeline: PipelineConfig::from_source(&lookup),
        }
    }
}

/// Parse `key`, falling back to `default` when unset or invalid
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, "Invalid value, using default");
            default
        }),
        None => default,
    }
}

fn load_with_fallback<F>(lookup: &F, primary: &str, fallback: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(primary).or_else(|| lookup(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_backend_port_default_and_override() {
        assert_eq!(BackendConfig::from_source(source(&[])).port, 3000);
        assert_eq!(BackendConfig::from_source(source(&[("PORT", "8081")])).port, 8081);
        // garbage falls back to the default
        assert_eq!(BackendConfig::from_source(source(&[("PORT", "abc")])).port, 3000);
    }

    #[test]
    fn test_router_defaults() {
        let config = RouterConfig::from_source(source(&[]));
        assert_eq!(config.port, 80);
        assert_eq!(config.backend_url, "http://backend:3000");
        assert_eq!(config.index_path(), PathBuf::from("/usr/share/nginx/html/index.html"));
        assert_eq!(config.upstream_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_router_backend_url_trailing_slash_trimmed() {
        let config = RouterConfig::from_source(source(&[("ROUTER_BACKEND_URL", "http://127.0.0.1:3000/")]));
        assert_eq!(config.backend_url, "http://127.0.0.1:3000");
    }

    #[test]
    fn test_registry_credentials_require_both() {
        let registry = RegistryConfig::from_source(&source(&[
            ("CI_REGISTRY", "registry.gitlab.com"),
            ("CI_REGISTRY_USER", "gitlab-ci-token"),
        ]));
        assert!(registry.credentials.is_none());
        assert_eq!(registry.image_prefix, "registry.gitlab.com");

        let registry = RegistryConfig::from_source(&source(&[
            ("CI_REGISTRY", "registry.gitlab.com"),
            ("CI_REGISTRY_IMAGE", "registry.gitlab.com/acme/shop"),
            ("CI_REGISTRY_USER", "gitlab-ci-token"),
            ("CI_REGISTRY_PASSWORD", "secret"),
        ]));
        let creds = registry.credentials.unwrap();
        assert_eq!(creds.user, "gitlab-ci-token");
        assert!(!format!("{:?}", creds).contains("secret"));
        assert_eq!(registry.image_prefix, "registry.gitlab.com/acme/shop");
    }

    #[test]
    fn test_pipeline_config() {
        let config = PipelineConfig::from_source(source(&[
            ("RELEASE_DEPLOY_GATE", "auto"),
            ("RELEASE_WORK_DIR", "/srv/app"),
        ]));
        assert_eq!(config.gate, DeployGate::Automatic);
        assert_eq!(config.main_branch, "main");
        assert_eq!(config.compose_path(), PathBuf::from("/srv/app/docker-compose.yml"));
    }

    #[test]
    fn test_agent_api_key_fallback() {
        let config = AgentConfig::from_source(source(&[("API_KEY", "legacy")]));
        assert_eq!(config.api_key, "legacy");
        let config = AgentConfig::from_source(source(&[
            ("API_KEY", "legacy"),
            ("DEPLOY_AGENT_API_KEY", "primary"),
        ]));
        assert_eq!(config.api_key, "primary");
    }
}
