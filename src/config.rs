// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Startup configuration.

Values are read once when an [`crate::Rhi`] is created.  [`Config::from_env`] layers
`BAF_*` environment variables on top of the defaults, in the same spirit as the
`IW_DUMP_FRAMEBUFFER` switch.
*/

use std::str::FromStr;
use std::time::Duration;

/// Default size of the general resource descriptor table, in bytes.
pub const DEFAULT_RESOURCE_HEAP_SIZE: u64 = 2048 * 1024;
/// Default size of the sampler descriptor table, in bytes.
pub const DEFAULT_SAMPLER_HEAP_SIZE: u64 = 64 << 10;

/// Diagnostic behaviors, in increasing order of cost.
///
/// Levels are cumulative: [`DebugLevel::Validation`] also does everything
/// [`DebugLevel::ConditionalSubmit`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DebugLevel {
    #[default]
    Off,
    /// Cheap CPU-side assertions (live descriptor handles, lock bounds).
    FastValidation,
    /// Rebind descriptor heaps on every render pass instead of caching the binding.
    ResetOnBind,
    /// Commit the command buffer every time a compute or blit encoder closes.
    ConditionalSubmit,
    /// Retain references and request per-encoder error reporting.
    Validation,
    /// Block on every commit until the GPU has finished it.
    WaitForComplete,
}

/// How dirty descriptor entries reach the GPU-visible table.
///
/// This is chosen once; nothing switches strategies while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PublishStrategy {
    /// The table lives in CPU-visible memory and is written in place.
    CpuDirect,
    /// A CPU shadow is kept and the dirty sub-range is blitted into the table at each render pass.
    #[default]
    Copy,
    /// Writes accumulate as (entry, index) pairs that a compute pass scatters into the table.
    ComputeScatter,
}

/// What to do when a ring rotation lands on a backing the GPU may still be reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RingHazardPolicy {
    /// Wait (up to [`Config::hazard_wait`]) for the previous use to complete.
    #[default]
    Wait,
    /// Log and continue.
    Warn,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub resource_heap_size: u64,
    pub sampler_heap_size: u64,
    pub debug_level: DebugLevel,
    pub publish_strategy: PublishStrategy,
    /// Backings per Dynamic/Volatile buffer.
    pub buffering_depth: usize,
    /// How many frames old a deletion record must be before the reaper looks at it.
    pub frames_in_flight: u64,
    /// Budget for each fence poll the reaper performs.  Zero means a pure poll.
    pub reaper_wait: Duration,
    pub ring_hazard: RingHazardPolicy,
    pub hazard_wait: Duration,
    pub retain_references: bool,
    /// Run deletion bookkeeping on a dedicated submission thread.
    pub submission_thread: bool,
    /// Back tiny volatile buffers with CPU memory bound through `set_bytes`.
    pub inline_volatile_buffers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            resource_heap_size: DEFAULT_RESOURCE_HEAP_SIZE,
            sampler_heap_size: DEFAULT_SAMPLER_HEAP_SIZE,
            debug_level: DebugLevel::Off,
            publish_strategy: PublishStrategy::Copy,
            buffering_depth: 3,
            frames_in_flight: 2,
            reaper_wait: Duration::ZERO,
            ring_hazard: RingHazardPolicy::Wait,
            hazard_wait: Duration::from_secs(1),
            retain_references: false,
            submission_thread: false,
            inline_volatile_buffers: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("environment variable {name} has unparseable value {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("heap of {bytes} bytes holds fewer than two descriptors")]
    HeapTooSmall { bytes: u64 },
    #[error("buffering depth must be at least 1")]
    BufferingDepth,
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

impl FromStr for DebugLevel {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "off" => Ok(DebugLevel::Off),
            "1" | "fast" | "fastvalidation" => Ok(DebugLevel::FastValidation),
            "2" | "resetonbind" => Ok(DebugLevel::ResetOnBind),
            "3" | "conditionalsubmit" => Ok(DebugLevel::ConditionalSubmit),
            "4" | "validation" => Ok(DebugLevel::Validation),
            "5" | "waitforcomplete" => Ok(DebugLevel::WaitForComplete),
            _ => Err(()),
        }
    }
}

impl FromStr for PublishStrategy {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "cpudirect" => Ok(PublishStrategy::CpuDirect),
            "copy" => Ok(PublishStrategy::Copy),
            "compute" | "computescatter" => Ok(PublishStrategy::ComputeScatter),
            _ => Err(()),
        }
    }
}

impl Config {
    /// Defaults overridden by any `BAF_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(v) = env_parse("BAF_RESOURCE_HEAP_SIZE")? {
            config.resource_heap_size = v;
        }
        if let Some(v) = env_parse("BAF_SAMPLER_HEAP_SIZE")? {
            config.sampler_heap_size = v;
        }
        if let Some(v) = env_parse("BAF_DEBUG_LEVEL")? {
            config.debug_level = v;
        }
        if let Some(v) = env_parse("BAF_PUBLISH_STRATEGY")? {
            config.publish_strategy = v;
        }
        if let Some(v) = env_parse("BAF_BUFFERING_DEPTH")? {
            config.buffering_depth = v;
        }
        if let Some(v) = env_parse("BAF_FRAMES_IN_FLIGHT")? {
            config.frames_in_flight = v;
        }
        if let Some(v) = env_parse::<u64>("BAF_REAPER_WAIT_MS")? {
            config.reaper_wait = Duration::from_millis(v);
        }
        config.submission_thread = std::env::var("BAF_SUBMISSION_THREAD")
            .map(|e| e == "1")
            .unwrap_or(config.submission_thread);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let entry = crate::descriptor::DescriptorEntry::SIZE;
        for bytes in [self.resource_heap_size, self.sampler_heap_size] {
            if bytes / entry < 2 {
                return Err(ConfigError::HeapTooSmall { bytes });
            }
        }
        if self.buffering_depth == 0 {
            return Err(ConfigError::BufferingDepth);
        }
        Ok(())
    }

    pub(crate) fn retains_references(&self) -> bool {
        self.retain_references || self.debug_level >= DebugLevel::Validation
    }
}
