//! Configuration surface: built-in defaults, a YAML file, `LOGBOOK_*`
//! environment variables and command line flags, merged in that order of
//! precedence and normalized into an immutable [`Settings`] snapshot.

// System
use std::path::{Path, PathBuf};

// Third Party
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

// Local
use crate::error::ConfigError;
use crate::sink::{Destination, RecordFormat};

/// Default for `target.listoptions.timeoutseconds`, ten years.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 315_360_000;
pub const CONFIG_FILE_NAME: &str = "logbook.yaml";
const DEFAULT_LOG_FILENAME: &str = "k8s-events.log";

#[derive(Debug, Parser)]
#[command(
    name = "logbook",
    about = "Logbook is a kubernetes event logger.",
    long_about = "Logbook is a kubernetes event logger which can be used both in-cluster \
                  (use kubernetes ServiceAccount for auth) and out-of-cluster (use kubeconfig \
                  file for auth).",
    version
)]
pub struct Cli {
    /// Config file (default is $PWD/logbook.yaml). A missing file is reported and the defaults used
    #[arg(long, env = "LOGBOOK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Running mode, in-cluster or out-of-cluster (default is in-cluster)
    #[arg(long, env = "LOGBOOK_AUTH_MODE")]
    pub mode: Option<String>,

    /// Path of kubeconfig file (default is $HOME/.kube/config, only used in out-of-cluster mode)
    #[arg(long, env = "LOGBOOK_AUTH_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Namespace to watch (default is all namespaces)
    #[arg(long, env = "LOGBOOK_TARGET_NAMESPACE")]
    pub namespace: Option<String>,

    /// Emit every event type, or only ADDED, MODIFIED and ERROR when false
    #[arg(long, env = "LOGBOOK_TARGET_EMITALL")]
    pub emit_all: Option<bool>,

    /// Watch timeout in seconds (default is effectively unbounded)
    #[arg(long, env = "LOGBOOK_TARGET_LISTOPTIONS_TIMEOUTSECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Resource version to start watching after (default is to list existing events first)
    #[arg(long, env = "LOGBOOK_TARGET_LISTOPTIONS_RESOURCEVERSION")]
    pub resource_version: Option<String>,

    #[arg(long, env = "LOGBOOK_TARGET_LISTOPTIONS_LABELSELECTOR")]
    pub label_selector: Option<String>,

    #[arg(long, env = "LOGBOOK_TARGET_LISTOPTIONS_FIELDSELECTOR")]
    pub field_selector: Option<String>,

    /// Log format, json or text (default is json)
    #[arg(long, env = "LOGBOOK_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Log output, stdout, stderr or file (default is stdout)
    #[arg(long, env = "LOGBOOK_LOG_OUT")]
    pub log_out: Option<String>,

    /// Log level (default is info)
    #[arg(long, env = "LOGBOOK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log file path, used only when log-out is file (default is k8s-events.log)
    #[arg(long, env = "LOGBOOK_LOG_FILENAME")]
    pub log_filename: Option<String>,

    /// Consecutive sink write failures tolerated before giving up (default is never)
    #[arg(long, env = "LOGBOOK_LOG_MAXCONSECUTIVEFAILURES")]
    pub max_sink_failures: Option<u32>,
}

impl Cli {
    /// Overlay every flag (or its environment variable) that was set.
    fn apply(&self, raw: &mut RawSettings) {
        if let Some(mode) = &self.mode {
            raw.auth.mode = mode.clone();
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            raw.auth.kubeconfig = kubeconfig.clone();
        }
        if let Some(namespace) = &self.namespace {
            raw.target.namespace = namespace.clone();
        }
        if let Some(emit_all) = self.emit_all {
            raw.target.emit_all = emit_all;
        }
        if let Some(timeout) = self.timeout_seconds {
            raw.target.list_options.timeout_seconds = timeout;
        }
        if let Some(rv) = &self.resource_version {
            raw.target.list_options.resource_version = rv.clone();
        }
        if let Some(labels) = &self.label_selector {
            raw.target.list_options.label_selector = labels.clone();
        }
        if let Some(fields) = &self.field_selector {
            raw.target.list_options.field_selector = fields.clone();
        }
        if let Some(format) = &self.log_format {
            raw.log.format = format.clone();
        }
        if let Some(out) = &self.log_out {
            raw.log.out = out.clone();
        }
        if let Some(level) = &self.log_level {
            raw.log.level = level.clone();
        }
        if let Some(filename) = &self.log_filename {
            raw.log.filename = filename.clone();
        }
        if let Some(max) = self.max_sink_failures {
            raw.log.max_consecutive_failures = Some(max);
        }
    }
}

/// The configuration as written in the YAML file, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    pub log: RawLogSettings,
    pub target: RawTargetSettings,
    pub auth: RawAuthSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLogSettings {
    pub format: String,
    pub out: String,
    pub filename: String,
    pub level: String,
    #[serde(rename = "maxconsecutivefailures")]
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RawLogSettings {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            out: "stdout".to_string(),
            filename: DEFAULT_LOG_FILENAME.to_string(),
            level: "info".to_string(),
            max_consecutive_failures: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTargetSettings {
    pub namespace: String,
    #[serde(rename = "emitall")]
    pub emit_all: bool,
    #[serde(rename = "listoptions")]
    pub list_options: RawListOptions,
}

impl Default for RawTargetSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            emit_all: true,
            list_options: RawListOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawListOptions {
    #[serde(rename = "timeoutseconds")]
    pub timeout_seconds: u64,
    #[serde(rename = "resourceversion")]
    pub resource_version: String,
    #[serde(rename = "labelselector")]
    pub label_selector: String,
    #[serde(rename = "fieldselector")]
    pub field_selector: String,
}

impl Default for RawListOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            resource_version: String::new(),
            label_selector: String::new(),
            field_selector: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAuthSettings {
    pub mode: String,
    pub kubeconfig: String,
}

impl Default for RawAuthSettings {
    fn default() -> Self {
        Self {
            mode: "in-cluster".to_string(),
            kubeconfig: String::new(),
        }
    }
}

/// Normalized, immutable configuration snapshot handed to every component.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log: LogSettings,
    pub target: TargetSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub format: RecordFormat,
    pub destination: Destination,
    pub level: LevelFilter,
    /// Consecutive emit failures after which the pump gives up. `None` never gives up.
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSettings {
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub emit_all: bool,
    pub list_options: ListOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOptions {
    pub timeout_seconds: u64,
    /// Where the watch starts. Empty or `"1"` lists the existing events first.
    pub resource_version: String,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSettings {
    /// Carried verbatim; validated by the client factory.
    pub mode: String,
    pub kubeconfig: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        RawSettings::default().normalize().0
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl RawSettings {
    /// Normalize into [`Settings`]. Unsupported log values fall back to their
    /// defaults; the returned warnings describe each fallback.
    pub fn normalize(self) -> (Settings, Vec<String>) {
        let mut warnings = Vec::new();

        let format = RecordFormat::from_setting(&self.log.format).unwrap_or_else(|| {
            warnings.push(format!(
                "log.format \"{}\" not supported, defaults to json",
                self.log.format
            ));
            RecordFormat::Json
        });

        let destination = match self.log.out.as_str() {
            "stdout" => Destination::Stdout,
            "stderr" => Destination::Stderr,
            "file" => Destination::File(PathBuf::from(
                non_empty(&self.log.filename).unwrap_or_else(|| DEFAULT_LOG_FILENAME.to_string()),
            )),
            other => {
                warnings.push(format!("log.out \"{}\" not supported, defaults to stdout", other));
                Destination::Stdout
            }
        };

        let level = parse_level(&self.log.level).unwrap_or_else(|| {
            warnings.push(format!(
                "log.level \"{}\" not supported, defaults to info",
                self.log.level
            ));
            LevelFilter::INFO
        });

        let timeout_seconds = match self.target.list_options.timeout_seconds {
            0 => DEFAULT_TIMEOUT_SECONDS,
            timeout => timeout,
        };

        let settings = Settings {
            log: LogSettings {
                format,
                destination,
                level,
                max_consecutive_failures: self.log.max_consecutive_failures,
            },
            target: TargetSettings {
                namespace: non_empty(&self.target.namespace),
                emit_all: self.target.emit_all,
                list_options: ListOptions {
                    timeout_seconds,
                    resource_version: self.target.list_options.resource_version.trim().to_string(),
                    label_selector: non_empty(&self.target.list_options.label_selector),
                    field_selector: non_empty(&self.target.list_options.field_selector),
                },
            },
            auth: AuthSettings {
                mode: self.auth.mode.trim().to_string(),
                kubeconfig: non_empty(&self.auth.kubeconfig).map(PathBuf::from),
            },
        };
        (settings, warnings)
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => Some(LevelFilter::ERROR),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

/// Result of [`load`]: the snapshot, the file it came from, and any
/// normalization warnings to log once diagnostics are up.
#[derive(Debug)]
pub struct Loaded {
    pub settings: Settings,
    pub source: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Directories searched for `logbook.yaml` when no `--config` is given.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".logbook").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/logbook").join(CONFIG_FILE_NAME));
    paths
}

/// An explicit path that does not exist is reported and the defaults are used.
fn locate(
    explicit: Option<&Path>,
    candidates: &[PathBuf],
    warnings: &mut Vec<String>,
) -> Option<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) => {
            warnings.push(format!(
                "Error opening config file {}: file not found, using defaults",
                path.display()
            ));
            None
        }
        None => candidates.iter().find(|path| path.is_file()).cloned(),
    }
}

/// Parse a YAML config file. An empty file yields the defaults.
pub fn read_file(path: &Path) -> Result<RawSettings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(RawSettings::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge defaults, the config file, environment variables and flags.
pub fn load(cli: &Cli) -> Result<Loaded, ConfigError> {
    load_from(cli, &search_paths())
}

fn load_from(cli: &Cli, candidates: &[PathBuf]) -> Result<Loaded, ConfigError> {
    let mut warnings = Vec::new();
    let source = locate(cli.config.as_deref(), candidates, &mut warnings);
    let mut raw = match &source {
        Some(path) => read_file(path)?,
        None => RawSettings::default(),
    };
    cli.apply(&mut raw);
    let (settings, normalized) = raw.normalize();
    warnings.extend(normalized);
    Ok(Loaded {
        settings,
        source,
        warnings,
    })
}
