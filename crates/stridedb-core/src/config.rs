//! Configuration for a StrideDB store

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node::Node;

/// Smallest block size that still yields a degree-3 node.
const MIN_BLOCK_SIZE: u32 = 232;

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of a tree node block on disk; determines the node degree and is
    /// fixed for the lifetime of a store (default: 4096).
    pub block_size: u32,

    /// Maximum number of nodes the cache retains; 0 disables caching
    /// (default: 1 GiB worth of default-size blocks).
    pub cache_size: u64,

    /// Target maximum bytes handed to a single value-log append during a
    /// flush (default: 1 MiB).
    pub write_buffer_size: usize,

    /// Sleep between background flush cycles (default: 1s).
    pub flush_interval: Duration,

    /// Path of the key-index file (default: "db.keys").
    pub key_file: PathBuf,

    /// Path of the value-log file (default: "db.values").
    pub value_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_size: 1024 * 1024 * 1024 / 4096,
            write_buffer_size: 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            key_file: PathBuf::from("db.keys"),
            value_file: PathBuf::from("db.values"),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with both files placed under `dir`.
    pub fn at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            key_file: dir.join("db.keys"),
            value_file: dir.join("db.values"),
            ..Default::default()
        }
    }

    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    pub fn cache_size(mut self, nodes: u64) -> Self {
        self.cache_size = nodes;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = path.into();
        self
    }

    pub fn value_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.value_file = path.into();
        self
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(format!("block_size must be >= {}", MIN_BLOCK_SIZE));
        }
        let degree = Node::calculate_degree(self.block_size);
        if Node::serialized_size(degree) > self.block_size as usize {
            return Err(format!(
                "block_size {} cannot hold a degree-{} node",
                self.block_size, degree
            ));
        }
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be > 0".into());
        }
        if self.flush_interval.as_millis() == 0 {
            return Err("flush_interval must be > 0".into());
        }
        if self.key_file.as_os_str().is_empty() || self.value_file.as_os_str().is_empty() {
            return Err("file paths must not be empty".into());
        }
        if self.key_file == self.value_file {
            return Err("key_file and value_file must differ".into());
        }
        Ok(())
    }
}
