use thiserror::Error;

use crate::eventq::Tick;

/// Fatal simulation errors.  Setup-time problems surface as `Config` before
/// the first tick; runtime problems carry enough context (address, controller
/// id, tick) to reproduce the failing transaction.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "protocol violation at tick {tick}: controller {ctrl} received {event} \
         for line {line_addr:#x} in state {state}"
    )]
    ProtocolViolation {
        tick: Tick,
        ctrl: usize,
        line_addr: u64,
        state: &'static str,
        event: String,
    },

    #[error(
        "deadlock detected at tick {tick}: {outstanding} transaction(s) made no \
         progress since tick {last_progress} (oldest line {line_addr:#x})"
    )]
    Deadlock {
        tick: Tick,
        last_progress: Tick,
        outstanding: usize,
        line_addr: u64,
    },

    #[error("unknown benchmark '{0}'")]
    UnknownBenchmark(String),

    #[error("unknown input size class '{0}' (expected test|simsmall|simmedium|simlarge)")]
    UnknownSizeClass(String),
}

/// Invalid topology or cache parameters.  Always fatal at setup, before the
/// simulation starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache line size {0} is not a power of two")]
    LineSizeNotPow2(u64),

    #[error("memory controller count must be nonzero")]
    NoMemCtrls,

    #[error("core count {cores} is not divisible by cluster size {cluster_size}")]
    UnevenClusters { cores: usize, cluster_size: usize },

    #[error("{level} capacity {capacity} is not divisible by line_size * assoc = {granule}")]
    UnevenSets {
        level: &'static str,
        capacity: u64,
        granule: u64,
    },

    #[error("L3 bank count {0} is not a power of two")]
    BankCountNotPow2(usize),

    #[error("memory ranges leave address {0:#x} without a directory")]
    UncoveredAddress(u64),

    #[error("memory ranges overlap at address {0:#x}")]
    OverlappingRanges(u64),

    #[error("{field} must be nonzero")]
    ZeroField { field: &'static str },
}
