use crate::debugger::error::Error;
use log::debug;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fs::read_to_string;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Engine configuration, read from a toml file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Signals that are delivered to the debugee without a stop, in addition to the default set
    /// (`SIGALRM`, `SIGURG`, `SIGCHLD`, `SIGIO`, `SIGVTALRM`, `SIGPROF`, `SIGWINCH`).
    pub quiet_signals: Vec<String>,
    /// Maximum number of thread capture rounds when attaching a running process.
    pub attach_rounds: u32,
    /// Kill debugee when debugger detaches. By default launched programs are killed
    /// and attached processes keep running.
    pub kill_on_detach: Option<bool>,
    /// Start programs with disabled address space randomization.
    pub disable_aslr: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_signals: vec![],
            attach_rounds: 2,
            kill_on_detach: None,
            disable_aslr: true,
        }
    }
}

impl EngineConfig {
    const DEFAULT_PATH: &'static str = ".config/haltpoint/config.toml";

    /// Default config location: `~/.config/haltpoint/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(Self::DEFAULT_PATH))
    }

    /// Load configuration from a file, [`None`] means a default location.
    /// Missing file gives a default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let data = match read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(target: "debugger", "config file {path:?} not found, use defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&data)
    }

    /// Parse configuration from a toml document.
    pub fn parse(data: &str) -> Result<Self, Error> {
        let config: EngineConfig =
            toml::de::from_str(data).map_err(|e| Error::Config(e.to_string()))?;
        config.quiet_signals()?;
        Ok(config)
    }

    /// Configured quiet signals, names accepted with or without `SIG` prefix.
    pub fn quiet_signals(&self) -> Result<Vec<Signal>, Error> {
        self.quiet_signals
            .iter()
            .map(|name| {
                let name = name.trim().to_uppercase();
                let full_name = if name.starts_with("SIG") {
                    name
                } else {
                    format!("SIG{name}")
                };
                Signal::from_str(&full_name)
                    .map_err(|_| Error::Config(format!("unknown signal {full_name}")))
            })
            .collect()
    }

    /// Number of attach rounds, never less than two.
    pub fn attach_rounds(&self) -> u32 {
        self.attach_rounds.max(2)
    }
}
