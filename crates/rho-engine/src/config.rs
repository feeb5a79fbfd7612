//! Provider configuration built for each backend load

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Context size used when nothing else is configured
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

const GIB: u64 = 1024 * 1024 * 1024;

/// Fallback when total memory cannot be determined
const FALLBACK_MEMORY_BYTES: u64 = 8 * GIB;

/// Loader-level settings the coordinator applies to every load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Context window passed to backends
    pub context_size: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
        }
    }
}

/// Host resources that drive batch size and thread count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemResources {
    /// Total physical memory in bytes
    pub memory_bytes: u64,
    /// Logical processors available to this process
    pub processor_count: usize,
}

impl SystemResources {
    /// Probe the running machine
    pub fn detect() -> Self {
        let processor_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let memory_bytes = read_total_memory().unwrap_or(FALLBACK_MEMORY_BYTES);
        Self {
            memory_bytes,
            processor_count,
        }
    }

    /// Batch size for this much memory, one of 512, 1024, 2048 or 4096
    pub fn batch_size(&self) -> u32 {
        match self.memory_bytes {
            m if m < 8 * GIB => 512,
            m if m < 16 * GIB => 1024,
            m if m < 32 * GIB => 2048,
            _ => 4096,
        }
    }
}

/// Reads `MemTotal` from `/proc/meminfo`. Returns `None` off Linux.
fn read_total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&meminfo)
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line
        .trim_start_matches("MemTotal:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// Everything a backend session needs to become resident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Resolved local path of the weights
    pub model_path: PathBuf,
    pub context_size: u32,
    pub batch_size: u32,
    pub thread_count: usize,
    /// Network credential for remote backends; local loads carry none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}

impl ProviderConfig {
    /// Build the configuration for loading `model_path` on this machine
    pub fn new(model_path: impl AsRef<Path>, loader: &LoaderConfig, system: &SystemResources) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            context_size: loader.context_size,
            batch_size: system.batch_size(),
            thread_count: system.processor_count,
            authentication: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(gib: u64) -> SystemResources {
        SystemResources {
            memory_bytes: gib * GIB,
            processor_count: 8,
        }
    }

    #[test]
    fn test_batch_size_tiers() {
        assert_eq!(system(4).batch_size(), 512);
        assert_eq!(system(8).batch_size(), 1024);
        assert_eq!(system(16).batch_size(), 2048);
        assert_eq!(system(31).batch_size(), 2048);
        assert_eq!(system(64).batch_size(), 4096);
    }

    #[test]
    fn test_provider_config_defaults() {
        let cfg = ProviderConfig::new("/m/a.gguf", &LoaderConfig::default(), &system(16));
        assert_eq!(cfg.context_size, 2048);
        assert_eq!(cfg.batch_size, 2048);
        assert_eq!(cfg.thread_count, 8);
        assert!(cfg.authentication.is_none());
        assert_eq!(cfg.model_path, PathBuf::from("/m/a.gguf"));
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(sample), Some(16318480 * 1024));
        assert_eq!(parse_meminfo_total("garbage"), None);
    }

    #[test]
    fn test_detect_has_processors() {
        assert!(SystemResources::detect().processor_count >= 1);
    }
}
