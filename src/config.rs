//! Configuration loading and validation.
//!
//! A single human-owned `warden.toml` describes kernel limits, Core quotas,
//! the VM link, storage and the ordered list of capability modules every
//! kernel is built with. Module order in the file is installation order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::capabilities::filesystem::FilesystemOptions;
use crate::capabilities::host_rpc::HostRpcOptions;
use crate::capabilities::timers::TimerOptions;
use crate::capabilities::CapabilityModule;
use crate::engine::MAX_CALL_DEPTH;
use crate::kernel::KernelConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    /// Per-kernel execution limits.
    #[serde(default)]
    pub kernel: KernelSettings,

    /// Global resource quotas enforced by the Core.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Host/VM link settings.
    #[serde(default)]
    pub link: LinkConfig,

    /// VM database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log file settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Capability modules, installed in this order.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

/// Per-kernel execution limits.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelSettings {
    /// Maximum number of records kept in the output cache.
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,

    /// Default per-call timeout. Absent means calls may block indefinitely.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// How long an interrupted call may take to unwind before the kernel is poisoned.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Maximum nested guest function calls.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: u32,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            output_capacity: default_output_capacity(),
            call_timeout_ms: None,
            cancel_grace_ms: default_cancel_grace_ms(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

/// Global resource quotas.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Total scoped filesystem bytes across all kernels.
    #[serde(default = "default_storage_bytes")]
    pub storage_bytes: u64,

    /// Total timer facilities across all kernels.
    #[serde(default = "default_slots")]
    pub timer_slots: u64,

    /// Total link RPC channels across all kernels.
    #[serde(default = "default_slots")]
    pub rpc_slots: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            storage_bytes: default_storage_bytes(),
            timer_slots: default_slots(),
            rpc_slots: default_slots(),
        }
    }
}

/// Host/VM link settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Per-request timeout on the link.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Buffered requests before senders wait.
    #[serde(default = "default_link_buffer")]
    pub buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            buffer: default_link_buffer(),
        }
    }
}

/// VM database settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. Without one, entries are kept in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Log file settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Without one, logs go to stderr only.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Declarative form of one capability module.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleSpec {
    /// Console-style output capture.
    Console,
    /// Hashing, randomness and encoding helpers.
    Crypto,
    /// Clock and bounded sleeping.
    Timers(TimerOptions),
    /// Scoped host directory access.
    Filesystem(FilesystemOptions),
    /// Requests forwarded over the VM link.
    HostRpc(HostRpcOptions),
}

impl ModuleSpec {
    /// Module name as it appears in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Crypto => "crypto",
            Self::Timers(_) => "timers",
            Self::Filesystem(_) => "filesystem",
            Self::HostRpc(_) => "host_rpc",
        }
    }
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The output cache must hold at least one record.
    #[error("kernel.output_capacity must be at least 1")]
    ZeroOutputCapacity,
    /// Guest code needs at least one call frame.
    #[error("kernel.max_call_depth must be at least 1")]
    ZeroCallDepth,
    /// Deeper nesting would overflow the execution thread's stack.
    #[error("kernel.max_call_depth {depth} exceeds the limit of {limit}")]
    CallDepthTooLarge {
        /// Configured depth.
        depth: u32,
        /// Largest accepted depth.
        limit: u32,
    },
    /// A module option is unusable.
    #[error("module #{index} ({module}): {reason}")]
    InvalidModule {
        /// Position in the module list.
        index: usize,
        /// Module name.
        module: &'static str,
        /// What is wrong.
        reason: String,
    },
}

impl WardenConfig {
    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel.output_capacity == 0 {
            return Err(ConfigError::ZeroOutputCapacity);
        }
        if self.kernel.max_call_depth == 0 {
            return Err(ConfigError::ZeroCallDepth);
        }
        if self.kernel.max_call_depth > MAX_CALL_DEPTH {
            return Err(ConfigError::CallDepthTooLarge {
                depth: self.kernel.max_call_depth,
                limit: MAX_CALL_DEPTH,
            });
        }
        for (index, module) in self.modules.iter().enumerate() {
            let problem = match module {
                ModuleSpec::Filesystem(opts) if opts.quota_bytes > self.quota.storage_bytes => {
                    Some(format!(
                        "quota_bytes {} exceeds global storage quota {}",
                        opts.quota_bytes, self.quota.storage_bytes
                    ))
                }
                ModuleSpec::Filesystem(opts) if opts.root.as_os_str().is_empty() => {
                    Some("root must not be empty".to_owned())
                }
                ModuleSpec::HostRpc(opts) if opts.methods.iter().any(|m| m.trim().is_empty()) => {
                    Some("method names must not be empty".to_owned())
                }
                _ => None,
            };
            if let Some(reason) = problem {
                return Err(ConfigError::InvalidModule {
                    index,
                    module: module.name(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Build the kernel configuration every new kernel is constructed from.
    pub fn kernel_config(&self) -> KernelConfig {
        let modules = self
            .modules
            .iter()
            .cloned()
            .map(CapabilityModule::from)
            .collect();
        KernelConfig {
            modules,
            output_capacity: self.kernel.output_capacity,
            call_timeout: self.kernel.call_timeout_ms.map(Duration::from_millis),
            cancel_grace: Duration::from_millis(self.kernel.cancel_grace_ms),
            max_call_depth: self.kernel.max_call_depth,
        }
    }

    /// Link request timeout as a [`Duration`].
    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link.request_timeout_ms)
    }
}

// Default value functions for serde

fn default_output_capacity() -> usize {
    512
}
fn default_cancel_grace_ms() -> u64 {
    2_000
}
fn default_max_call_depth() -> u32 {
    64
}
fn default_storage_bytes() -> u64 {
    67_108_864
}
fn default_slots() -> u64 {
    64
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_link_buffer() -> usize {
    64
}

/// Load and validate the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: &Path) -> anyhow::Result<WardenConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: WardenConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve the default config directory (`~/.warden/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".warden"))
}
