use derive_more::{Display, Error};
use miette::Diagnostic;
use pipe_trait::Pipe;
use serde::Deserialize;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Which repository layout an entry speaks.
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    #[serde(rename = "pacman")]
    #[default]
    Pacman,
}

/// One repository to serve: the request path prefix and the ordered list
/// of mirrors to fill misses from. A mirror is either a base URL the
/// repo-relative path gets appended to, or a template with a `{path}`
/// placeholder.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct RepoSettings {
    pub prefix: String,

    #[serde(default)]
    pub format: FormatKind,

    pub mirrors: Vec<String>,
}

/// Settings read from `pacmirror.yaml`.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Address the HTTP server binds to.
    #[serde(rename = "listen-addr", default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory the cache writes packages and databases to.
    #[serde(rename = "cache-dir", default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Seconds between background database refreshes. 0 disables the
    /// periodic refresh.
    #[serde(rename = "refresh-interval-secs", default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Repositories to serve.
    #[serde(default)]
    pub repos: Vec<RepoSettings>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9129".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/pacmirror")
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: default_listen_addr(),
            cache_dir: default_cache_dir(),
            refresh_interval_secs: default_refresh_interval_secs(),
            repos: Vec::new(),
        }
    }
}

/// Error when reading the settings file.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum LoadSettingsError {
    #[display("Failed to read settings file: {_0}")]
    #[diagnostic(code(pacmirror_config::read_file))]
    ReadFile(io::Error),

    #[display("Failed to parse settings file as YAML: {_0}")]
    #[diagnostic(code(pacmirror_config::parse_yaml))]
    ParseYaml(serde_yaml::Error),
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, LoadSettingsError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Settings::default()),
            Err(error) => return error.pipe(LoadSettingsError::ReadFile).pipe(Err),
        };
        content.pipe_as_ref(serde_yaml::from_str).map_err(LoadSettingsError::ParseYaml)
    }
}
