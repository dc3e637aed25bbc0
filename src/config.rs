use std::{fs, path::{Path, PathBuf}, thread, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{engine::{EngineCommand, Timeouts}, error_metric::K, params::{self, TuningParameter, Value}, TuneError};

pub const DEFAULT_RESULT_FILE: &str = "tuning_result.toml";

/// A `[[tuning]]` entry; shared by the config file and the result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningEntry {
    pub name: String,
    pub value: EntryValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryValue {
    Scalar(Value),
    List(Vec<Value>),
}

#[derive(Deserialize)]
struct RawConfig {
    engine: EngineCommand,
    options: RawOptions,
    #[serde(default)]
    tuning: Vec<TuningEntry>,
}

#[derive(Deserialize)]
struct RawOptions {
    test_positions_file: PathBuf,
    concurrency: Option<i64>,
    #[serde(default)]
    debug_log: bool,
    k: Option<f64>,
    timeout_secs: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    result_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineCommand,
    pub test_positions_file: PathBuf,
    pub concurrency: usize,
    pub debug_log: bool,
    pub k: f64,
    pub timeouts: Timeouts,
    pub result_file: PathBuf,
    pub tuning: Vec<TuningParameter>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, TuneError> {
        let text = fs::read_to_string(path).map_err(|source| TuneError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, TuneError> {
        let raw: RawConfig = toml::from_str(text)?;

        if raw.engine.cmd.trim().is_empty() {
            return Err(TuneError::Config("'engine.cmd' must not be empty".to_string()));
        }

        let concurrency = raw.options.concurrency.unwrap_or(1);
        if concurrency <= 0 {
            return Err(TuneError::Config(format!("invalid value for 'options.concurrency': {concurrency}")));
        }

        let k = raw.options.k.unwrap_or(K);
        if !(k.is_finite() && k > 0.0) {
            return Err(TuneError::Config(format!("invalid value for 'options.k': {k}")));
        }

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            reply: raw.options.timeout_secs.map_or(defaults.reply, Duration::from_secs),
            shutdown_grace: raw.options.shutdown_grace_ms.map_or(defaults.shutdown_grace, Duration::from_millis),
        };

        Ok(Config {
            engine: raw.engine,
            test_positions_file: raw.options.test_positions_file,
            concurrency: concurrency as usize,
            debug_log: raw.options.debug_log,
            k,
            timeouts,
            result_file: raw.options.result_file.unwrap_or_else(|| PathBuf::from(DEFAULT_RESULT_FILE)),
            tuning: expand_entries(&raw.tuning),
        })
    }

    /// Logs the worker setup and warns when it oversubscribes the machine.
    pub fn check_concurrency(&self) {
        info!("- use {} concurrent engine processes", self.concurrency);
        if let Ok(cpus) = thread::available_parallelism() {
            if self.concurrency >= cpus.get() {
                warn!("Configured 'options.concurrency' to be >= the number of logical CPU cores");
                info!("It is recommended to set concurrency to the number of physical CPU cores - 1");
            }
        }
        if self.tuning.is_empty() {
            warn!("No [[tuning]] entries configured, nothing will change");
        }
    }
}

pub fn expand_entries(entries: &[TuningEntry]) -> Vec<TuningParameter> {
    let mut tuning = Vec::new();
    for entry in entries {
        match &entry.value {
            EntryValue::Scalar(value) => tuning.push(TuningParameter::scalar(&entry.name, *value)),
            EntryValue::List(values) => tuning.extend(params::expand(&entry.name, values)),
        }
    }
    tuning
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamKind;

    const SAMPLE: &str = r#"
[engine]
cmd = "./engine"
args = ["--tuning"]

[options]
test_positions_file = "positions.txt"
concurrency = 3
debug_log = true
timeout_secs = 5

[[tuning]]
name = "QueenValue"
value = 950

[[tuning]]
name = "PawnPst"
value = [0, 5, -10]
"#;

    #[test]
    fn reads_engine_options_and_parameters() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.engine.cmd, "./engine");
        assert_eq!(config.engine.args, vec!["--tuning"]);
        assert_eq!(config.test_positions_file, PathBuf::from("positions.txt"));
        assert_eq!(config.concurrency, 3);
        assert!(config.debug_log);
        assert_eq!(config.k, K);
        assert_eq!(config.timeouts.reply, Duration::from_secs(5));
        assert_eq!(config.timeouts.shutdown_grace, Timeouts::default().shutdown_grace);
        assert_eq!(config.result_file, PathBuf::from(DEFAULT_RESULT_FILE));

        let names: Vec<String> = config.tuning.iter().map(|p| p.option_name()).collect();
        assert_eq!(names, vec!["QueenValue", "PawnPst0", "PawnPst1", "PawnPst2"]);
        assert_eq!(config.tuning[3].value, -10);
        assert_eq!(config.tuning[3].kind, ParamKind::ArrayElement { base_name: "PawnPst".to_string(), index: 2 });
        assert!(config.tuning.iter().all(|p| p.step == 16));
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let config = Config::parse("[engine]\ncmd = \"e\"\n[options]\ntest_positions_file = \"p\"\n").unwrap();
        assert_eq!(config.concurrency, 1);
        assert!(!config.debug_log);
        assert!(config.engine.args.is_empty());
        assert!(config.tuning.is_empty());
    }

    #[test]
    fn missing_engine_section_is_reported() {
        let err = Config::parse("[options]\ntest_positions_file = \"p\"\n").unwrap_err();
        assert!(matches!(err, TuneError::ConfigSyntax(_)));
        assert!(err.to_string().contains("engine"));
    }

    #[test]
    fn missing_position_file_is_reported() {
        let err = Config::parse("[engine]\ncmd = \"e\"\n[options]\nconcurrency = 2\n").unwrap_err();
        assert!(err.to_string().contains("test_positions_file"));
    }

    #[test]
    fn non_positive_concurrency_is_rejected() {
        let err = Config::parse("[engine]\ncmd = \"e\"\n[options]\ntest_positions_file = \"p\"\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }
}
