//! Build configuration
//!
//! [`BuildConfig`] is plain data: it can be built in code, or loaded from
//! JSON with [`BuildConfig::from_json`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse JSON
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantically invalid setting
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetArch {
    #[default]
    X86_64,
}

impl TargetArch {
    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
        }
    }

    /// Pointer size in bytes
    pub fn pointer_size(self) -> u32 {
        match self {
            TargetArch::X86_64 => 8,
        }
    }
}

/// What happens when evaluation stack values exceed the register pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpillPolicy {
    /// Overflowing values live in stack slots
    #[default]
    Allow,
    /// Running out of registers is an error
    Forbid,
}

/// Which methods a build compiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildScope {
    /// Every method reachable from the entry points
    #[default]
    Closure,
    /// Every method defined in the module, plus what they reach
    WholeModule,
}

/// An extra global name for a method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAlias {
    #[serde(default)]
    pub namespace: String,
    /// Declaring type name
    #[serde(rename = "type")]
    pub type_name: String,
    pub method: String,
    /// Symbol to define at the method's address
    pub alias: String,
}

/// Settings for one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub arch: TargetArch,
    /// Worker threads; 0 uses one per CPU, 1 builds on the calling thread
    pub threads: usize,
    pub spill: SpillPolicy,
    /// Emit module and assembly info records
    pub emit_module_info: bool,
    pub scope: BuildScope,
    /// Only emit artifacts that belong to the module being built
    pub single_module: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<EntryAlias>,
    /// Log IR and machine code at trace level
    pub dump_ir: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            arch: TargetArch::default(),
            threads: 1,
            spill: SpillPolicy::default(),
            emit_module_info: true,
            scope: BuildScope::default(),
            single_module: false,
            aliases: Vec::new(),
            dump_ir: false,
        }
    }
}

impl BuildConfig {
    /// Parse a configuration from JSON text; missing keys take their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: BuildConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for a in &self.aliases {
            if a.alias.is_empty() || a.method.is_empty() || a.type_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "incomplete alias entry for {}.{}::{}",
                    a.namespace, a.type_name, a.method
                )));
            }
        }
        Ok(())
    }

    /// Number of worker threads to run
    pub fn worker_count(&self) -> usize {
        match self.threads {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}
