//! The TOML configuration of `blkdio run`.
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use blkdio_engine::{EngineConfig, PoolConfig, MAX_SEGMENT_VECS, PAGE_SIZE};
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub engine: EngineOptions,
    pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub enum DeviceConfig {
    Memory(MemoryDeviceConfig),
    File(FileDeviceConfig),
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryDeviceConfig {
    pub size: ByteSize,
    #[serde_inline_default(ByteSize::b(512))]
    pub logical_block_size: ByteSize,
    /// Number of threads completing requests. Zero completes them inline on submission.
    #[serde_inline_default(1)]
    pub completion_threads: usize,
}

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileDeviceConfig {
    /// A regular file or a block device.
    pub path: PathBuf,
    #[serde_inline_default(ByteSize::b(512))]
    pub logical_block_size: ByteSize,
    /// Open with `O_DIRECT`.
    #[serde_inline_default(false)]
    pub direct: bool,
    #[serde_inline_default(128)]
    pub ring_entries: u32,
    #[serde_inline_default(false)]
    pub read_only: bool,
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineOptions {
    #[serde_inline_default(MAX_SEGMENT_VECS)]
    pub max_segment_vecs: usize,
    #[serde_inline_default(PoolConfig::default().initial)]
    pub pool_initial: usize,
    #[serde_inline_default(PoolConfig::default().cache_size)]
    pub pool_cache_size: usize,
    #[serde_inline_default(PoolConfig::default().limit)]
    pub pool_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_segment_vecs: MAX_SEGMENT_VECS,
            pool_initial: pool.initial,
            pool_cache_size: pool.cache_size,
            pool_limit: pool.limit,
        }
    }
}

impl EngineOptions {
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_segment_vecs: self.max_segment_vecs,
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            initial: self.pool_initial,
            initial_vecs: self.max_segment_vecs,
            cache_size: self.pool_cache_size,
            limit: self.pool_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadOp {
    Read,
    Write,
    /// Write, then read back and compare.
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Sequential,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Each request blocks a thread until it completes.
    Sync,
    /// Requests complete through callbacks.
    Async,
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub op: WorkloadOp,
    #[serde_inline_default(Pattern::Sequential)]
    pub pattern: Pattern,
    pub block_size: ByteSize,
    pub total_size: ByteSize,
    /// Device offset where the workload starts.
    #[serde_inline_default(ByteSize::b(0))]
    pub offset: ByteSize,
    #[serde_inline_default(NonZeroUsize::new(1).unwrap())]
    pub queue_depth: NonZeroUsize,
    #[serde_inline_default(SubmitMode::Async)]
    pub mode: SubmitMode,
    #[serde_inline_default(false)]
    pub nowait: bool,
    #[serde_inline_default(false)]
    pub dsync: bool,
    #[serde_inline_default(false)]
    pub poll: bool,
    #[serde_inline_default(0)]
    pub seed: u64,
    /// Stop issuing requests after this long.
    #[serde(
        default,
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_limit: Option<Duration>,
}

mod serde_duration_opt {
    use std::time::Duration;

    use serde::de::{Deserialize, Deserializer, Error};
    use serde::Serializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let Some(s) = Option::<String>::deserialize(de)? else {
            return Ok(None);
        };
        humantime::parse_duration(&s)
            .map(Some)
            .map_err(|err| D::Error::custom(format_args!("invalid duration {s:?}: {err}")))
    }

    // Required by serde interface.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_str(&humantime::format_duration(*d).to_string()),
            None => ser.serialize_none(),
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn logical_block_size(&self) -> u64 {
        match self {
            DeviceConfig::Memory(c) => c.logical_block_size.0,
            DeviceConfig::File(c) => c.logical_block_size.0,
        }
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        match self {
            DeviceConfig::Memory(_) => false,
            DeviceConfig::File(c) => c.read_only,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&buf).context("failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        let lbs = self.device.logical_block_size();
        ensure!(
            lbs.is_power_of_two() && (512..=PAGE_SIZE as u64).contains(&lbs),
            "logical block size must be a power of two between 512B and the page size ({PAGE_SIZE}B)"
        );
        match &self.device {
            DeviceConfig::Memory(c) => {
                ensure!(
                    c.size.0 != 0 && c.size.0 % lbs == 0,
                    "memory device size must be a non-zero multiple of the logical block size"
                );
            }
            DeviceConfig::File(c) => {
                ensure!(
                    (1..=32768).contains(&c.ring_entries),
                    "`ring_entries` must be in range [1, 32768]"
                );
            }
        }

        let e = &self.engine;
        ensure!(
            (1..=MAX_SEGMENT_VECS).contains(&e.max_segment_vecs),
            "`max_segment_vecs` must be in range [1, {MAX_SEGMENT_VECS}]"
        );
        ensure!(e.pool_limit != 0, "`pool_limit` must not be zero");

        let w = &self.workload;
        ensure!(
            w.block_size.0 != 0 && w.block_size.0 % lbs == 0,
            "`block_size` must be a non-zero multiple of the logical block size"
        );
        ensure!(
            usize::try_from(w.block_size.0).is_ok(),
            "`block_size` is too large"
        );
        ensure!(
            w.total_size.0 != 0 && w.total_size.0 % w.block_size.0 == 0,
            "`total_size` must be a non-zero multiple of `block_size`"
        );
        ensure!(
            w.offset.0 % lbs == 0,
            "`offset` must be a multiple of the logical block size"
        );
        ensure!(
            w.op == WorkloadOp::Read || !self.device.is_read_only(),
            "cannot write to a read-only device"
        );
        if let DeviceConfig::Memory(c) = &self.device {
            ensure!(
                w.offset.0.saturating_add(w.total_size.0) <= c.size.0,
                "workload exceeds the end of device"
            );
        }
        Ok(())
    }
}
