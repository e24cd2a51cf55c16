use crate::error::MuxError;
use crate::pool::PoolConfig;
use hyper::Uri;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable overriding the public (gateway) address
pub const PUBLIC_HOST_VAR: &str = "OLLAMA_HOST";
/// Environment variable overriding the private execution address
pub const EXECUTION_HOST_VAR: &str = "OLLAMA_EXEC_HOST";
/// Environment variable pointing at an optional TOML config file
pub const CONFIG_PATH_VAR: &str = "OLLAMAMUX_CONFIG";
/// Set on a detached gateway child whose parent holds the lock on its behalf
pub const DELEGATED_OWNER_VAR: &str = "OLLAMAMUX_DELEGATED_OWNER";

pub const DEFAULT_PUBLIC_PORT: u16 = 11434;
pub const DEFAULT_EXECUTION_PORT: u16 = 11435;

/// An absolute `http://host:port/path/` address.
///
/// The host is stored without IPv6 brackets; rendering adds them back.
#[derive(Debug, Clone)]
pub struct HostAddress {
    host: String,
    port: u16,
    path: String,
}

impl HostAddress {
    /// Loopback address on the given port
    pub fn loopback(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            path: "/".to_string(),
        }
    }

    /// Parse an address override.
    ///
    /// Values without a scheme are treated as `http://`; a missing port takes
    /// `default_port`. Only plain HTTP is supported.
    pub fn parse(value: &str, default_port: u16) -> Result<Self, MuxError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MuxError::Config("empty address".to_string()));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let uri: Uri = candidate
            .parse()
            .map_err(|e| MuxError::Config(format!("'{}' is not a valid URL: {}", value, e)))?;

        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            other => {
                return Err(MuxError::Config(format!(
                    "'{}' uses unsupported scheme {:?}",
                    value,
                    other.unwrap_or("")
                )))
            }
        }

        let authority = uri
            .authority()
            .ok_or_else(|| MuxError::Config(format!("'{}' has no host", value)))?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(MuxError::Config(format!("'{}' has no host", value)));
        }

        let mut path = uri.path().to_string();
        if !path.ends_with('/') {
            path.push('/');
        }

        Ok(Self {
            host,
            port: authority.port_u16().unwrap_or(default_port),
            path,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path prefix, always ending in `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Host and port to bind a listener on
    pub fn bind_target(&self) -> (&str, u16) {
        match self.host.as_str() {
            "+" | "*" => ("0.0.0.0", self.port),
            host => (host, self.port),
        }
    }

    /// Host to connect to when probing; wildcard binds are reached via loopback
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "+" | "*" => "127.0.0.1",
            "::" => "::1",
            host => host,
        }
    }

    /// `host:port` suitable for a TCP connect
    pub fn probe_authority(&self) -> String {
        format_authority(self.probe_host(), self.port)
    }

    /// URL of `path_and_query` on this address, suitable for an outbound request
    pub fn join(&self, path_and_query: &str) -> String {
        let relative = path_and_query.trim_start_matches('/');
        format!(
            "http://{}{}{}",
            self.probe_authority(),
            self.path,
            relative
        )
    }

    /// Whether two addresses name the same endpoint
    pub fn same_endpoint(&self, other: &HostAddress) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.path.trim_end_matches('/') == other.path.trim_end_matches('/')
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", format_authority(&self.host, self.port), self.path)
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The public gateway address and the private address the backend listens on
#[derive(Debug, Clone)]
pub struct HostPair {
    pub public: HostAddress,
    pub execution: HostAddress,
}

impl HostPair {
    pub fn new(public: HostAddress, execution: HostAddress) -> Result<Self, MuxError> {
        if public.same_endpoint(&execution) {
            return Err(MuxError::HostLoop(public.to_string()));
        }
        Ok(Self { public, execution })
    }
}

impl Default for HostPair {
    fn default() -> Self {
        Self {
            public: HostAddress::loopback(DEFAULT_PUBLIC_PORT),
            execution: HostAddress::loopback(DEFAULT_EXECUTION_PORT),
        }
    }
}

/// Optional TOML configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigFile {
    /// Public gateway address (overridden by OLLAMA_HOST)
    pub public_host: Option<String>,

    /// Private backend address (overridden by OLLAMA_EXEC_HOST)
    pub execution_host: Option<String>,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    /// Backend executable (default: ollama, ollama.exe on Windows)
    pub program: Option<String>,

    /// How long a detached launch must survive to count as started (default: 3000)
    #[serde(default = "default_launch_grace_ms")]
    pub launch_grace_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            program: None,
            launch_grace_ms: default_launch_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Upper bound for confirming a running gateway (default: 3000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Maximum backend connections in use at once (default: 128)
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: usize,

    /// Maximum idle connections kept to the backend (default: 128)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection lifetime in seconds (default: 120)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Directory holding the lock file and the detached gateway log
    pub lock_dir: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            pool_max_connections: default_pool_max_connections(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            lock_dir: None,
        }
    }
}

fn default_launch_grace_ms() -> u64 {
    3000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_pool_max_connections() -> usize {
    128
}

fn default_pool_max_idle_per_host() -> usize {
    128
}

fn default_pool_idle_timeout() -> u64 {
    120
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConfigFile = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Default backend executable for this platform
pub fn default_backend_program() -> &'static str {
    if cfg!(windows) {
        "ollama.exe"
    } else {
        "ollama"
    }
}

/// Configuration resolved once at startup and passed to every component
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub hosts: HostPair,
    pub backend_program: String,
    pub launch_grace: Duration,
    pub probe_timeout: Duration,
    pub pool: PoolConfig,
    pub lock_dir: PathBuf,
    /// This process is a detached gateway whose parent holds the lock
    pub delegated_owner: bool,
}

impl MuxConfig {
    /// Resolve from the process environment
    pub fn from_env() -> Result<Self, MuxError> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    ///
    /// Malformed values are logged and replaced by the next layer down; only a
    /// public/execution address collision is fatal.
    pub fn resolve<F>(lookup: F) -> Result<Self, MuxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match non_blank(lookup(CONFIG_PATH_VAR)) {
            Some(path) => match ConfigFile::load(&path) {
                Ok(file) => {
                    debug!(path = %path, "Configuration file loaded");
                    file
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Ignoring unreadable configuration file");
                    ConfigFile::default()
                }
            },
            None => ConfigFile::default(),
        };

        let public = resolve_address(
            PUBLIC_HOST_VAR,
            lookup(PUBLIC_HOST_VAR),
            file.public_host.as_deref(),
            DEFAULT_PUBLIC_PORT,
        );
        let execution = resolve_address(
            EXECUTION_HOST_VAR,
            lookup(EXECUTION_HOST_VAR),
            file.execution_host.as_deref(),
            DEFAULT_EXECUTION_PORT,
        );
        let hosts = HostPair::new(public, execution)?;

        let lock_dir = file
            .gateway
            .lock_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(default_lock_dir);

        Ok(Self {
            hosts,
            backend_program: file
                .backend
                .program
                .clone()
                .unwrap_or_else(|| default_backend_program().to_string()),
            launch_grace: Duration::from_millis(file.backend.launch_grace_ms),
            probe_timeout: Duration::from_millis(file.gateway.probe_timeout_ms),
            pool: PoolConfig {
                max_connections: file.gateway.pool_max_connections,
                max_idle_per_host: file.gateway.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(file.gateway.pool_idle_timeout_secs),
            },
            lock_dir,
            delegated_owner: non_blank(lookup(DELEGATED_OWNER_VAR)).is_some(),
        })
    }

    /// Defaults with an explicit host pair
    pub fn with_hosts(hosts: HostPair) -> Self {
        Self {
            hosts,
            backend_program: default_backend_program().to_string(),
            launch_grace: Duration::from_millis(default_launch_grace_ms()),
            probe_timeout: Duration::from_millis(default_probe_timeout_ms()),
            pool: PoolConfig::default(),
            lock_dir: default_lock_dir(),
            delegated_owner: false,
        }
    }

    /// Log file for a detached gateway's stderr
    pub fn gateway_log_path(&self) -> PathBuf {
        self.lock_dir.join("ollamamux-gateway.log")
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_address(
    var: &str,
    env_value: Option<String>,
    file_value: Option<&str>,
    default_port: u16,
) -> HostAddress {
    let layers = [
        (var, non_blank(env_value)),
        ("config file", non_blank(file_value.map(str::to_string))),
    ];

    for (source, value) in layers {
        let Some(value) = value else { continue };
        match HostAddress::parse(&value, default_port) {
            Ok(address) => return address,
            Err(e) => {
                warn!(source, value = %value, error = %e, "Ignoring malformed address override");
            }
        }
    }

    HostAddress::loopback(default_port)
}

fn default_lock_dir() -> PathBuf {
    dirs_next::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MuxConfig::resolve(lookup_from(&[])).unwrap();
        assert_eq!(config.hosts.public.to_string(), "http://127.0.0.1:11434/");
        assert_eq!(config.hosts.execution.to_string(), "http://127.0.0.1:11435/");
        assert_eq!(config.launch_grace, Duration::from_secs(3));
        assert_eq!(config.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.pool.max_connections, 128);
        assert_eq!(config.pool.max_idle_per_host, 128);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.backend_program, default_backend_program());
        assert!(!config.delegated_owner);
    }

    #[test]
    fn test_env_overrides() {
        let config = MuxConfig::resolve(lookup_from(&[
            (PUBLIC_HOST_VAR, "localhost:9000"),
            (EXECUTION_HOST_VAR, "http://127.0.0.1:9001"),
            (DELEGATED_OWNER_VAR, "1"),
        ]))
        .unwrap();
        assert_eq!(config.hosts.public.to_string(), "http://localhost:9000/");
        assert_eq!(config.hosts.execution.to_string(), "http://127.0.0.1:9001/");
        assert!(config.delegated_owner);
    }

    #[test]
    fn test_malformed_override_falls_back_to_default() {
        let config = MuxConfig::resolve(lookup_from(&[
            (PUBLIC_HOST_VAR, "http://bad host:port"),
            (EXECUTION_HOST_VAR, "ftp://127.0.0.1:21"),
        ]))
        .unwrap();
        assert_eq!(config.hosts.public.to_string(), "http://127.0.0.1:11434/");
        assert_eq!(config.hosts.execution.to_string(), "http://127.0.0.1:11435/");
    }

    #[test]
    fn test_identical_hosts_rejected() {
        let result = MuxConfig::resolve(lookup_from(&[
            (PUBLIC_HOST_VAR, "127.0.0.1:11435"),
        ]));
        assert!(matches!(result, Err(MuxError::HostLoop(_))));
    }

    #[test]
    fn test_missing_port_uses_role_default() {
        let public = HostAddress::parse("0.0.0.0", DEFAULT_PUBLIC_PORT).unwrap();
        assert_eq!(public.port(), 11434);
        assert_eq!(public.probe_host(), "127.0.0.1");
        assert_eq!(public.to_string(), "http://0.0.0.0:11434/");
    }

    #[test]
    fn test_ipv6_address() {
        let address = HostAddress::parse("http://[::1]:8080", 80).unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "http://[::1]:8080/");
        assert_eq!(address.probe_authority(), "[::1]:8080");
    }

    #[test]
    fn test_join_path_and_query() {
        let exec = HostAddress::parse("http://127.0.0.1:11435/", 0).unwrap();
        assert_eq!(exec.join("/api/tags"), "http://127.0.0.1:11435/api/tags");
        assert_eq!(
            exec.join("/api/show?verbose=true"),
            "http://127.0.0.1:11435/api/show?verbose=true"
        );

        let nested = HostAddress::parse("127.0.0.1:9000/prefix", 0).unwrap();
        assert_eq!(nested.join("/api/tags"), "http://127.0.0.1:9000/prefix/api/tags");
    }

    #[test]
    fn test_same_endpoint_ignores_case_and_trailing_slash() {
        let a = HostAddress::parse("http://LOCALHOST:1234", 0).unwrap();
        let b = HostAddress::parse("localhost:1234/", 0).unwrap();
        assert!(a.same_endpoint(&b));
        assert!(HostPair::new(a, b).is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let toml = r#"
public_host = "127.0.0.1:8434"
execution_host = "127.0.0.1:8435"

[backend]
program = "/opt/ollama/bin/ollama"
launch_grace_ms = 500

[gateway]
probe_timeout_ms = 1500
pool_max_connections = 32
pool_max_idle_per_host = 16
pool_idle_timeout_secs = 30
lock_dir = "/tmp/mux"
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.public_host.as_deref(), Some("127.0.0.1:8434"));
        assert_eq!(file.backend.program.as_deref(), Some("/opt/ollama/bin/ollama"));
        assert_eq!(file.backend.launch_grace_ms, 500);
        assert_eq!(file.gateway.probe_timeout_ms, 1500);
        assert_eq!(file.gateway.pool_max_connections, 32);
        assert_eq!(file.gateway.pool_max_idle_per_host, 16);
        assert_eq!(file.gateway.lock_dir.as_deref(), Some("/tmp/mux"));
    }

    #[test]
    fn test_config_file_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        assert!(file.public_host.is_none());
        assert_eq!(file.backend.launch_grace_ms, 3000);
        assert_eq!(file.gateway.pool_idle_timeout_secs, 120);
    }

    #[test]
    fn test_env_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ollamamux.toml");
        std::fs::write(
            &path,
            "public_host = \"127.0.0.1:7000\"\nexecution_host = \"127.0.0.1:7001\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();

        let config = MuxConfig::resolve(lookup_from(&[
            (CONFIG_PATH_VAR, path_str.as_str()),
            (PUBLIC_HOST_VAR, "127.0.0.1:7100"),
        ]))
        .unwrap();
        assert_eq!(config.hosts.public.port(), 7100);
        assert_eq!(config.hosts.execution.port(), 7001);
    }

    #[test]
    fn test_unreadable_config_file_is_ignored() {
        let config = MuxConfig::resolve(lookup_from(&[(
            CONFIG_PATH_VAR,
            "/nonexistent/ollamamux.toml",
        )]))
        .unwrap();
        assert_eq!(config.hosts.public.port(), DEFAULT_PUBLIC_PORT);
    }
}
