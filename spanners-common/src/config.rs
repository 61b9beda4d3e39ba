//! Process-wide configuration with defined precedence: command-line > environment
//! (`SPANNERS_` prefix) > config file > default, layered with a `clap` CLI
//! overlay and a commented key=value file loader (`--config-file` overrides
//! file lookup; otherwise `$XDG_CONFIG_HOME/spanners/server.cfg`, falling back
//! to `$HOME/.config/spanners/server.cfg`, auto-created with commented defaults
//! on first run).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::ConfigError;

/// Option key strings, carried verbatim from the original `config_options` table.
pub mod keys {
    pub const CONFIG_FILE: &str = "config-file";
    pub const SERVER_PORT: &str = "server-port";
    pub const DB_HOST: &str = "db-host";
    pub const DB_PORT: &str = "db-port";
    pub const DB_USER: &str = "db-user";
    pub const DB_NAME: &str = "db-name";
    pub const DB_PASSWORD: &str = "db-password";
    pub const DB_TIMEOUT: &str = "db-timeout";
    pub const SCHEDULER_EXEC_PATH: &str = "scheduler-exec-path";
    pub const SCHEDULER_PROCESS_LIMIT: &str = "scheduler-process-limit";
    pub const SCHEDULER_TIME_LIMIT: &str = "scheduler-time-limit";
    pub const SCHEDULER_RESOURCE_LIMIT: &str = "scheduler-resource-limit";
    pub const SCHEDULER_SLEEP: &str = "scheduler-sleep";
    pub const TLS_CERT_PATH: &str = "tls-cert-path";
    pub const TLS_KEY_PATH: &str = "tls-key-path";
    pub const MANAGEMENT_SOCKET_PATH: &str = "management-socket-path";

    pub const ALL: &[&str] = &[
        SERVER_PORT,
        DB_HOST,
        DB_PORT,
        DB_USER,
        DB_NAME,
        DB_PASSWORD,
        DB_TIMEOUT,
        SCHEDULER_EXEC_PATH,
        SCHEDULER_PROCESS_LIMIT,
        SCHEDULER_TIME_LIMIT,
        SCHEDULER_RESOURCE_LIMIT,
        SCHEDULER_SLEEP,
        TLS_CERT_PATH,
        TLS_KEY_PATH,
        MANAGEMENT_SOCKET_PATH,
    ];
}

pub const ENV_PREFIX: &str = "SPANNERS_";

fn env_var_for(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_uppercase().replace('-', "_"))
}

/// Command-line overlay. Every option mirrors a key in [`keys`]; `None` means
/// "not given on the command line", letting the lower layers show through.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "spanners-server", about = "spanners job server")]
pub struct CliArgs {
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    #[arg(long = "server-port")]
    pub server_port: Option<u16>,

    #[arg(long = "db-host")]
    pub db_host: Option<String>,

    #[arg(long = "db-port")]
    pub db_port: Option<u16>,

    #[arg(long = "db-user")]
    pub db_user: Option<String>,

    #[arg(long = "db-name")]
    pub db_name: Option<String>,

    #[arg(long = "db-password")]
    pub db_password: Option<String>,

    #[arg(long = "db-timeout")]
    pub db_timeout: Option<u64>,

    #[arg(long = "scheduler-exec-path")]
    pub scheduler_exec_path: Option<String>,

    #[arg(long = "scheduler-process-limit")]
    pub scheduler_process_limit: Option<u32>,

    #[arg(long = "scheduler-time-limit")]
    pub scheduler_time_limit: Option<u64>,

    #[arg(long = "scheduler-resource-limit")]
    pub scheduler_resource_limit: Option<u64>,

    #[arg(long = "scheduler-sleep")]
    pub scheduler_sleep: Option<u64>,

    #[arg(long = "tls-cert-path")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long = "tls-key-path")]
    pub tls_key_path: Option<PathBuf>,

    #[arg(long = "management-socket-path")]
    pub management_socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_name: String,
    pub db_password: String,
    pub db_timeout_secs: u64,
    pub scheduler_exec_path: String,
    pub scheduler_process_limit: u32,
    pub scheduler_time_limit_ms: u64,
    pub scheduler_resource_limit_bytes: u64,
    pub scheduler_sleep_ms: u64,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub management_socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_port: 4711,
            db_host: "localhost".to_owned(),
            db_port: 5432,
            db_user: "spanners".to_owned(),
            db_name: "spanners".to_owned(),
            db_password: String::new(),
            db_timeout_secs: 10,
            scheduler_exec_path: "spanners-worker".to_owned(),
            scheduler_process_limit: 4,
            scheduler_time_limit_ms: 0,
            scheduler_resource_limit_bytes: 0,
            scheduler_sleep_ms: 1000,
            tls_cert_path: None,
            tls_key_path: None,
            management_socket_path: PathBuf::from("/tmp/spanners-management.sock"),
        }
    }
}

impl Config {
    /// Builds the database connection string from the parsed option values.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn bind(&self) -> String {
        format!("0.0.0.0:{}", self.server_port)
    }

    /// Loads configuration with precedence command-line > environment > file > default.
    pub fn load(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        let config_file_path = match &cli.config_file {
            Some(path) => path.clone(),
            None => default_config_file_path()?,
        };
        let file_values = read_or_create_config_file(&config_file_path)?;
        apply_str_map(&mut cfg, &file_values)?;

        let env_values = collect_env_values();
        apply_str_map(&mut cfg, &env_values)?;

        apply_cli(&mut cfg, &cli)?;

        Ok(cfg)
    }
}

fn collect_env_values() -> HashMap<String, String> {
    let mut map = HashMap::new();
    for key in keys::ALL {
        if let Ok(val) = std::env::var(env_var_for(key)) {
            map.insert((*key).to_owned(), val);
        }
    }
    map
}

fn default_config_file_path() -> Result<PathBuf, ConfigError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Ok(Path::new(&xdg).join("spanners").join("server.cfg"));
        }
    }
    let home = std::env::var("HOME").map_err(|_| ConfigError::NoConfigHome)?;
    Ok(Path::new(&home).join(".config").join("spanners").join("server.cfg"))
}

const DEFAULT_CONFIG_TEMPLATE: &str = "\
# spanners server configuration
# Uncomment and edit any key below. Command-line flags and SPANNERS_-prefixed
# environment variables take precedence over this file.
#
# server-port = 4711
# db-host = localhost
# db-port = 5432
# db-user = spanners
# db-name = spanners
# db-password =
# db-timeout = 10
# scheduler-exec-path = spanners-worker
# scheduler-process-limit = 4
# scheduler-time-limit = 0
# scheduler-resource-limit = 0
# scheduler-sleep = 1000
# tls-cert-path =
# tls-key-path =
# management-socket-path = /tmp/spanners-management.sock
";

fn read_or_create_config_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_config_file(&contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFile {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            std::fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|source| {
                ConfigError::WriteFile {
                    path: path.display().to_string(),
                    source,
                }
            })?;
            Ok(HashMap::new())
        }
        Err(source) => Err(ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn parse_config_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    map
}

fn apply_str_map(cfg: &mut Config, values: &HashMap<String, String>) -> Result<(), ConfigError> {
    if let Some(v) = values.get(keys::SERVER_PORT) {
        cfg.server_port = parse(keys::SERVER_PORT, v)?;
    }
    if let Some(v) = values.get(keys::DB_HOST) {
        cfg.db_host = v.clone();
    }
    if let Some(v) = values.get(keys::DB_PORT) {
        cfg.db_port = parse(keys::DB_PORT, v)?;
    }
    if let Some(v) = values.get(keys::DB_USER) {
        cfg.db_user = v.clone();
    }
    if let Some(v) = values.get(keys::DB_NAME) {
        cfg.db_name = v.clone();
    }
    if let Some(v) = values.get(keys::DB_PASSWORD) {
        cfg.db_password = v.clone();
    }
    if let Some(v) = values.get(keys::DB_TIMEOUT) {
        cfg.db_timeout_secs = parse(keys::DB_TIMEOUT, v)?;
    }
    if let Some(v) = values.get(keys::SCHEDULER_EXEC_PATH) {
        cfg.scheduler_exec_path = v.clone();
    }
    if let Some(v) = values.get(keys::SCHEDULER_PROCESS_LIMIT) {
        cfg.scheduler_process_limit = parse(keys::SCHEDULER_PROCESS_LIMIT, v)?;
    }
    if let Some(v) = values.get(keys::SCHEDULER_TIME_LIMIT) {
        cfg.scheduler_time_limit_ms = parse(keys::SCHEDULER_TIME_LIMIT, v)?;
    }
    if let Some(v) = values.get(keys::SCHEDULER_RESOURCE_LIMIT) {
        cfg.scheduler_resource_limit_bytes = parse(keys::SCHEDULER_RESOURCE_LIMIT, v)?;
    }
    if let Some(v) = values.get(keys::SCHEDULER_SLEEP) {
        cfg.scheduler_sleep_ms = parse(keys::SCHEDULER_SLEEP, v)?;
    }
    if let Some(v) = values.get(keys::TLS_CERT_PATH) {
        cfg.tls_cert_path = Some(PathBuf::from(v));
    }
    if let Some(v) = values.get(keys::TLS_KEY_PATH) {
        cfg.tls_key_path = Some(PathBuf::from(v));
    }
    if let Some(v) = values.get(keys::MANAGEMENT_SOCKET_PATH) {
        cfg.management_socket_path = PathBuf::from(v);
    }
    Ok(())
}

fn apply_cli(cfg: &mut Config, cli: &CliArgs) -> Result<(), ConfigError> {
    if let Some(v) = cli.server_port {
        cfg.server_port = v;
    }
    if let Some(v) = &cli.db_host {
        cfg.db_host = v.clone();
    }
    if let Some(v) = cli.db_port {
        cfg.db_port = v;
    }
    if let Some(v) = &cli.db_user {
        cfg.db_user = v.clone();
    }
    if let Some(v) = &cli.db_name {
        cfg.db_name = v.clone();
    }
    if let Some(v) = &cli.db_password {
        cfg.db_password = v.clone();
    }
    if let Some(v) = cli.db_timeout {
        cfg.db_timeout_secs = v;
    }
    if let Some(v) = &cli.scheduler_exec_path {
        cfg.scheduler_exec_path = v.clone();
    }
    if let Some(v) = cli.scheduler_process_limit {
        cfg.scheduler_process_limit = v;
    }
    if let Some(v) = cli.scheduler_time_limit {
        cfg.scheduler_time_limit_ms = v;
    }
    if let Some(v) = cli.scheduler_resource_limit {
        cfg.scheduler_resource_limit_bytes = v;
    }
    if let Some(v) = cli.scheduler_sleep {
        cfg.scheduler_sleep_ms = v;
    }
    if let Some(v) = &cli.tls_cert_path {
        cfg.tls_cert_path = Some(v.clone());
    }
    if let Some(v) = &cli.tls_key_path {
        cfg.tls_key_path = Some(v.clone());
    }
    if let Some(v) = &cli.management_socket_path {
        cfg.management_socket_path = v.clone();
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}
