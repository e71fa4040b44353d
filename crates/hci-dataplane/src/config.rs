use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use hci_flow::{
    BufferInfo, ControllerBuffers, RetirementLog, Scheduler, SchedulerConfig, TelemetrySink,
    TokenLedger, TransportSink,
};
use serde::Deserialize;

pub const CONFIG_VERSION: u32 = 1;

// ─── Input (as written in TOML) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfigInput {
    pub version: u32,
    pub buffers: BuffersInput,
    pub scheduler: SchedulerInput,
    pub statistics: StatisticsInput,
    pub runtime: RuntimeInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuffersInput {
    pub classic: Option<BufferInput>,
    pub le: Option<BufferInput>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct BufferInput {
    pub max_packet_size: Option<usize>,
    pub max_credits: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerInput {
    pub overflow_limit: Option<usize>,
    pub telemetry_delay_ms: Option<u64>,
    pub drop_log_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatisticsInput {
    pub min_depth: Option<usize>,
    pub max_depth: Option<usize>,
    pub quantiles: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeInput {
    pub channel_capacity: Option<usize>,
    pub snapshot_interval_ms: Option<u64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Retirement log sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsConfig {
    pub min_depth: usize,
    pub max_depth: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            min_depth: 10,
            max_depth: 1024,
        }
    }
}

/// Worker thread plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Slots in the packet ring between callers and the worker.
    pub channel_capacity: usize,
    /// How often the worker republishes its snapshot.
    pub snapshot_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            snapshot_interval: Duration::from_millis(100),
        }
    }
}

pub const DEFAULT_CLASSIC_BUFFER: BufferInfo = BufferInfo {
    max_packet_size: 1021,
    max_credits: 8,
};

#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    pub version: u32,
    pub buffers: ControllerBuffers,
    pub scheduler: SchedulerConfig,
    pub statistics: StatisticsConfig,
    pub runtime: RuntimeConfig,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            buffers: ControllerBuffers {
                classic: DEFAULT_CLASSIC_BUFFER,
                le: None,
            },
            scheduler: SchedulerConfig::default(),
            statistics: StatisticsConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

fn resolve_buffer(input: BufferInput, defaults: BufferInfo, pool: &str) -> Result<BufferInfo> {
    let buffer = BufferInfo::new(
        input.max_packet_size.unwrap_or(defaults.max_packet_size),
        input.max_credits.unwrap_or(defaults.max_credits),
    );
    ensure!(buffer.max_packet_size > 0, "{pool} buffer: max_packet_size must be non-zero");
    ensure!(
        buffer.max_packet_size <= u16::MAX as usize,
        "{pool} buffer: max_packet_size {} does not fit the ACL length field",
        buffer.max_packet_size
    );
    ensure!(buffer.max_credits > 0, "{pool} buffer: max_credits must be non-zero");
    Ok(buffer)
}

impl DataPlaneConfigInput {
    pub fn resolve(self) -> Result<DataPlaneConfig> {
        let defaults = DataPlaneConfig::default();

        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("Unsupported config version {version}");
        }

        let classic = resolve_buffer(
            self.buffers.classic.unwrap_or_default(),
            DEFAULT_CLASSIC_BUFFER,
            "classic",
        )?;
        // An LE table without sizes inherits the classic geometry.
        let le = self
            .buffers
            .le
            .map(|input| resolve_buffer(input, classic, "le"))
            .transpose()?;

        let sched = defaults.scheduler;
        let overflow_limit = self.scheduler.overflow_limit.unwrap_or(sched.overflow_limit);
        ensure!(overflow_limit > 0, "scheduler: overflow_limit must be non-zero");
        let quantiles = self.statistics.quantiles.unwrap_or(sched.telemetry_quantiles);
        if let Some(bad) = quantiles.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            bail!("statistics: quantile {bad} is outside [0, 1]");
        }
        let scheduler = SchedulerConfig {
            overflow_limit,
            telemetry_delay: self
                .scheduler
                .telemetry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(sched.telemetry_delay),
            drop_log_interval: self
                .scheduler
                .drop_log_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(sched.drop_log_interval),
            telemetry_quantiles: quantiles,
        };

        let statistics = StatisticsConfig {
            min_depth: self
                .statistics
                .min_depth
                .unwrap_or(defaults.statistics.min_depth),
            max_depth: self
                .statistics
                .max_depth
                .unwrap_or(defaults.statistics.max_depth),
        };
        ensure!(statistics.max_depth > 0, "statistics: max_depth must be non-zero");
        ensure!(
            statistics.min_depth <= statistics.max_depth,
            "statistics: min_depth {} exceeds max_depth {}",
            statistics.min_depth,
            statistics.max_depth
        );

        let runtime = RuntimeConfig {
            channel_capacity: self
                .runtime
                .channel_capacity
                .unwrap_or(defaults.runtime.channel_capacity)
                .max(16),
            snapshot_interval: self
                .runtime
                .snapshot_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.runtime.snapshot_interval),
        };

        Ok(DataPlaneConfig {
            version,
            buffers: ControllerBuffers { classic, le },
            scheduler,
            statistics,
            runtime,
        })
    }
}

impl DataPlaneConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(DataPlaneConfig::default());
        }
        let parsed: DataPlaneConfigInput =
            toml::from_str(input).context("Invalid config TOML")?;
        parsed.resolve()
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Build a scheduler (with its ledger and retirement log) from this
    /// configuration. Must run on the thread that will own it.
    pub fn build_scheduler<T, M>(&self, transport: T, telemetry: M) -> Result<Scheduler<T, M>>
    where
        T: TransportSink,
        M: TelemetrySink,
    {
        let log = RetirementLog::new(self.statistics.min_depth, self.statistics.max_depth)?;
        Ok(Scheduler::new(
            self.scheduler.clone(),
            self.buffers,
            TokenLedger::new(log),
            transport,
            telemetry,
        ))
    }
}
