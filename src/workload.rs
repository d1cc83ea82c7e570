/*
Synthetic per-core access streams driving the coherence hierarchy.

Each core owns one stream.  The driver issues the next item only after the
previous access completed, so a stream never has two outstanding accesses
and sharing patterns (ping-pong in particular) serialize naturally through
the protocol.
*/

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::SimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub size: u32,
    /// Value to store; ignored for loads.
    pub value: u64,
    pub op: AccessOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Finished,
    /// The workload runner reported something other than a clean exit.
    /// The driver counts it as a non-fatal anomaly and keeps going.
    Anomaly(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    Access(Access),
    RoiBegin,
    RoiEnd,
    Exit(ExitCause),
}

/// Input-size classes matching the usual benchmark-suite naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    #[default]
    Test,
    SimSmall,
    SimMedium,
    SimLarge,
}

impl SizeClass {
    pub fn accesses_per_core(self) -> u64 {
        match self {
            SizeClass::Test => 1_000,
            SizeClass::SimSmall => 10_000,
            SizeClass::SimMedium => 100_000,
            SizeClass::SimLarge => 1_000_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::Test => "test",
            SizeClass::SimSmall => "simsmall",
            SizeClass::SimMedium => "simmedium",
            SizeClass::SimLarge => "simlarge",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s {
            "test" => Ok(SizeClass::Test),
            "simsmall" => Ok(SizeClass::SimSmall),
            "simmedium" => Ok(SizeClass::SimMedium),
            "simlarge" => Ok(SizeClass::SimLarge),
            _ => Err(SimError::UnknownSizeClass(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PatternSpec {
    /// Each core walks its own region with a fixed stride.
    Strided {
        #[serde(default = "default_stride")]
        stride: u64,
        /// Every nth access is a store; 0 means loads only.
        #[serde(default)]
        store_every: u64,
    },
    /// Uniform random addresses over a per-core region.
    Random {
        #[serde(default = "default_region")]
        region_bytes: u64,
        #[serde(default = "default_store_ratio")]
        store_ratio: f64,
        #[serde(default = "default_seed")]
        seed: u64,
    },
    /// All cores hammer stores at one shared hot line.
    PingPong,
}

fn default_stride() -> u64 {
    64
}
fn default_region() -> u64 {
    1 << 20
}
fn default_store_ratio() -> f64 {
    0.3
}
fn default_seed() -> u64 {
    0xC0FFEE
}

impl Default for PatternSpec {
    fn default() -> Self {
        PatternSpec::Strided {
            stride: default_stride(),
            store_every: 4,
        }
    }
}

/// Pick a named benchmark profile.  The names mirror the PARSEC suite the
/// hierarchy was sized for; each maps to the synthetic pattern closest to
/// its sharing behavior.
pub fn benchmark_pattern(name: &str) -> Result<PatternSpec, SimError> {
    match name {
        // Mostly-private working sets.
        "blackscholes" | "swaptions" | "freqmine" => Ok(PatternSpec::Strided {
            stride: 64,
            store_every: 4,
        }),
        // Irregular pointer chasing.
        "canneal" | "dedup" => Ok(PatternSpec::Random {
            region_bytes: default_region(),
            store_ratio: 0.3,
            seed: default_seed(),
        }),
        // Lock-heavy sharing.
        "fluidanimate" | "streamcluster" | "bodytrack" | "x264" => Ok(PatternSpec::PingPong),
        _ => Err(SimError::UnknownBenchmark(name.to_string())),
    }
}

#[derive(Debug)]
enum StreamKind {
    Strided { stride: u64, store_every: u64 },
    Random { region_bytes: u64, store_ratio: f64, rng: StdRng },
    PingPong { hot_addr: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Running,
    RoiClosed,
    Done,
}

/// One core's access stream.  Yields RoiBegin, `total` accesses, RoiEnd,
/// Exit, then nothing.
#[derive(Debug)]
pub struct CoreStream {
    pub core: usize,
    base: u64,
    issued: u64,
    total: u64,
    phase: Phase,
    exit_cause: ExitCause,
    kind: StreamKind,
}

/// Region of the address space reserved per core for private patterns.
const CORE_REGION: u64 = 1 << 24;
/// Shared hot line for the ping-pong pattern.
const HOT_ADDR: u64 = 0x1000;

impl CoreStream {
    pub fn new(core: usize, spec: &PatternSpec, size: SizeClass) -> Self {
        let base = (core as u64 + 1) * CORE_REGION;
        let kind = match spec {
            PatternSpec::Strided { stride, store_every } => StreamKind::Strided {
                stride: (*stride).max(1),
                store_every: *store_every,
            },
            PatternSpec::Random {
                region_bytes,
                store_ratio,
                seed,
            } => StreamKind::Random {
                region_bytes: (*region_bytes).max(8),
                store_ratio: *store_ratio,
                rng: StdRng::seed_from_u64(seed ^ (core as u64).wrapping_mul(0x9E37_79B9)),
            },
            PatternSpec::PingPong => StreamKind::PingPong { hot_addr: HOT_ADDR },
        };
        Self {
            core,
            base,
            issued: 0,
            total: size.accesses_per_core(),
            phase: Phase::Start,
            exit_cause: ExitCause::Finished,
            kind,
        }
    }

    /// Fixed-length stream for tests and microbenchmarks.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    /// Override the exit cause, for workloads that terminate abnormally.
    pub fn with_exit(mut self, cause: ExitCause) -> Self {
        self.exit_cause = cause;
        self
    }

    pub fn next_item(&mut self) -> Option<WorkItem> {
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Running;
                Some(WorkItem::RoiBegin)
            }
            Phase::Running => {
                if self.issued >= self.total {
                    self.phase = Phase::RoiClosed;
                    return Some(WorkItem::RoiEnd);
                }
                let idx = self.issued;
                self.issued += 1;
                Some(WorkItem::Access(self.gen_access(idx)))
            }
            Phase::RoiClosed => {
                self.phase = Phase::Done;
                Some(WorkItem::Exit(self.exit_cause))
            }
            Phase::Done => None,
        }
    }

    fn gen_access(&mut self, idx: u64) -> Access {
        // Deterministic store values let an end-of-run memory check confirm
        // the last writer won.
        let value = ((self.core as u64) << 32) | idx;
        match &mut self.kind {
            StreamKind::Strided { stride, store_every } => {
                let addr = self.base + idx * *stride;
                let op = if *store_every > 0 && idx % *store_every == 0 {
                    AccessOp::Store
                } else {
                    AccessOp::Load
                };
                Access {
                    addr,
                    size: 8,
                    value,
                    op,
                }
            }
            StreamKind::Random {
                region_bytes,
                store_ratio,
                rng,
            } => {
                let addr = self.base + (rng.gen_range(0..*region_bytes) & !7);
                let op = if rng.gen_bool(*store_ratio) {
                    AccessOp::Store
                } else {
                    AccessOp::Load
                };
                Access {
                    addr,
                    size: 8,
                    value,
                    op,
                }
            }
            StreamKind::PingPong { hot_addr } => Access {
                addr: *hot_addr,
                size: 8,
                value,
                op: AccessOp::Store,
            },
        }
    }
}

/// Build the per-core streams for a run.
pub fn build_streams(num_cores: usize, spec: &PatternSpec, size: SizeClass) -> Vec<CoreStream> {
    (0..num_cores)
        .map(|core| CoreStream::new(core, spec, size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_brackets_roi_around_accesses() {
        let mut stream =
            CoreStream::new(0, &PatternSpec::default(), SizeClass::Test).with_total(3);
        assert_eq!(stream.next_item(), Some(WorkItem::RoiBegin));
        for _ in 0..3 {
            assert!(matches!(stream.next_item(), Some(WorkItem::Access(_))));
        }
        assert_eq!(stream.next_item(), Some(WorkItem::RoiEnd));
        assert_eq!(
            stream.next_item(),
            Some(WorkItem::Exit(ExitCause::Finished))
        );
        assert_eq!(stream.next_item(), None);
    }

    #[test]
    fn strided_addresses_advance_by_stride() {
        let spec = PatternSpec::Strided {
            stride: 64,
            store_every: 0,
        };
        let mut stream = CoreStream::new(1, &spec, SizeClass::Test).with_total(4);
        stream.next_item();
        let mut addrs = Vec::new();
        while let Some(WorkItem::Access(a)) = stream.next_item() {
            assert_eq!(a.op, AccessOp::Load);
            addrs.push(a.addr);
        }
        assert_eq!(addrs.len(), 4);
        assert!(addrs.windows(2).all(|w| w[1] - w[0] == 64));
    }

    #[test]
    fn random_streams_are_reproducible_and_disjoint_per_core() {
        let spec = PatternSpec::Random {
            region_bytes: 1 << 16,
            store_ratio: 0.5,
            seed: 7,
        };
        let collect = |core| {
            let mut s = CoreStream::new(core, &spec, SizeClass::Test).with_total(16);
            s.next_item();
            let mut out = Vec::new();
            while let Some(WorkItem::Access(a)) = s.next_item() {
                out.push((a.addr, a.op));
            }
            out
        };
        assert_eq!(collect(0), collect(0));
        assert_ne!(collect(0), collect(1));
    }

    #[test]
    fn ping_pong_cores_share_one_line() {
        let mut a = CoreStream::new(0, &PatternSpec::PingPong, SizeClass::Test).with_total(2);
        let mut b = CoreStream::new(1, &PatternSpec::PingPong, SizeClass::Test).with_total(2);
        a.next_item();
        b.next_item();
        let (Some(WorkItem::Access(x)), Some(WorkItem::Access(y))) =
            (a.next_item(), b.next_item())
        else {
            panic!("expected accesses");
        };
        assert_eq!(x.addr, y.addr);
        assert_eq!(x.op, AccessOp::Store);
        assert_ne!(x.value, y.value);
    }

    #[test]
    fn exit_cause_override_reaches_the_exit_item() {
        let mut stream = CoreStream::new(0, &PatternSpec::default(), SizeClass::Test)
            .with_total(1)
            .with_exit(ExitCause::Anomaly("page fault"));
        stream.next_item();
        stream.next_item();
        assert_eq!(stream.next_item(), Some(WorkItem::RoiEnd));
        assert_eq!(
            stream.next_item(),
            Some(WorkItem::Exit(ExitCause::Anomaly("page fault")))
        );
    }

    #[test]
    fn unknown_benchmark_is_an_error() {
        assert!(benchmark_pattern("blackscholes").is_ok());
        assert!(benchmark_pattern("doom").is_err());
    }
}
