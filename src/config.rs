use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::exercise::Exercise;

#[derive(Parser)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Number of grading workers, i.e. the most submissions executing at once
    #[arg(long = "threads", short = 't', default_value_t = 4)]
    pub threads: u8,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// When present, exercises are served from SQLite instead of `exercises`
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub exercises: Vec<Exercise>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
pub struct DatabaseConfig {
    /// Defaults to a file in the per-user data directory
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub definition_timeout: MilliSecond,
    pub test_timeout: MilliSecond,
    /// How long a timed-out execution unit gets to acknowledge the interrupt
    pub grace_period: MilliSecond,
    /// Python recursion limit inside the execution unit
    pub max_call_depth: usize,
    /// Bytes a single step (definition pass or one test) may allocate
    pub allocation_budget: ByteSize,
    /// Bytes of printed output a single step may produce
    pub output_limit: ByteSize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            definition_timeout: MilliSecond(2000),
            test_timeout: MilliSecond(1000),
            grace_period: MilliSecond(250),
            max_call_depth: 500,
            allocation_budget: ByteSize(64 << 20),
            output_limit: ByteSize(64 << 10),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl MilliSecond {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);
