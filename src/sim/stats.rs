use std::env;
use std::fs;
use std::io::Write;
use std::ops::AddAssign;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::coherence::cache::{CacheStats, TagArrayStats};
use crate::coherence::directory::DirStats;
use crate::eventq::Tick;
use crate::fabric::FabricStats;

static STATS_RUN_DIR: OnceLock<PathBuf> = OnceLock::new();
static RUN_LABEL: OnceLock<String> = OnceLock::new();

/// Tag the run directory with a workload label (benchmark name and size).
/// Must be called before the first stats write; later calls are ignored.
pub fn set_run_label(label: &str) {
    let _ = RUN_LABEL.set(label.to_string());
}

/// Per-run output directory, created lazily under `BETATRON_STATS_DIR`
/// (default `stats_logs/`).  None when the directory cannot be created;
/// stats output is best-effort and never fails the run.
pub fn stats_run_dir() -> Option<PathBuf> {
    if let Some(path) = STATS_RUN_DIR.get() {
        return Some(path.clone());
    }

    let root = env::var("BETATRON_STATS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("stats_logs"));
    if fs::create_dir_all(&root).is_err() {
        return None;
    }

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let pid = std::process::id();
    let run_dir = match RUN_LABEL.get() {
        Some(label) => root.join(format!("run_{label}_{ts}_{pid}")),
        None => root.join(format!("run_{ts}_{pid}")),
    };
    if fs::create_dir_all(&run_dir).is_err() {
        return None;
    }

    let _ = STATS_RUN_DIR.set(run_dir.clone());
    Some(run_dir)
}

#[derive(Debug, Serialize)]
pub struct CoreSummary {
    pub core: usize,
    pub cache: CacheStats,
}

#[derive(Debug, Default, Serialize)]
pub struct AggregateStats {
    pub num_cores: usize,
    pub loads: u64,
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub invalidations_rx: u64,
    pub downgrades_rx: u64,
    pub transitions: u64,
    pub deferred_events: u64,
}

impl AddAssign<&CacheStats> for AggregateStats {
    fn add_assign(&mut self, core: &CacheStats) {
        self.loads += core.loads;
        self.stores += core.stores;
        self.hits += core.hits;
        self.misses += core.misses;
        self.evictions += core.evictions;
        self.writebacks += core.writebacks;
        self.invalidations_rx += core.invalidations_rx;
        self.downgrades_rx += core.downgrades_rx;
        self.transitions += core.transitions;
        self.deferred_events += core.deferred_events;
    }
}

impl AggregateStats {
    /// Counter delta since an earlier snapshot of the same counters.
    pub fn since(&self, earlier: &AggregateStats) -> AggregateStats {
        AggregateStats {
            num_cores: self.num_cores,
            loads: self.loads - earlier.loads,
            stores: self.stores - earlier.stores,
            hits: self.hits - earlier.hits,
            misses: self.misses - earlier.misses,
            evictions: self.evictions - earlier.evictions,
            writebacks: self.writebacks - earlier.writebacks,
            invalidations_rx: self.invalidations_rx - earlier.invalidations_rx,
            downgrades_rx: self.downgrades_rx - earlier.downgrades_rx,
            transitions: self.transitions - earlier.transitions,
            deferred_events: self.deferred_events - earlier.deferred_events,
        }
    }
}

pub fn aggregate(per_core: &[CoreSummary]) -> AggregateStats {
    let mut total = AggregateStats {
        num_cores: per_core.len(),
        ..AggregateStats::default()
    };
    for core in per_core {
        total += &core.cache;
    }
    total
}

/// Stats delta over the region of interest, measured between the first
/// RoiBegin and the last RoiEnd.
#[derive(Debug, Serialize)]
pub struct RoiSummary {
    pub begin_tick: Tick,
    pub end_tick: Tick,
    pub total: AggregateStats,
}

#[derive(Debug, Serialize)]
pub struct MemSummary {
    pub reads: u64,
    pub writebacks: u64,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub ticks: Tick,
    pub wall_ms: u64,
    /// Out-of-range accesses the driver wrapped instead of aborting on.
    pub anomalies: u64,
    pub total: AggregateStats,
    pub roi: Option<RoiSummary>,
    pub per_core: Vec<CoreSummary>,
    pub dirs: Vec<DirStats>,
    pub l2_hubs: Vec<TagArrayStats>,
    pub l3_banks: Vec<TagArrayStats>,
    pub fabric: FabricStats,
    pub mem: MemSummary,
}

/// Dump `summary.json` plus a flat `stats.txt` into the run directory.
pub fn write_summary(summary: &RunSummary) {
    let run_dir = match stats_run_dir() {
        Some(dir) => dir,
        None => return,
    };
    if let Ok(payload) = serde_json::to_string_pretty(summary) {
        let _ = fs::write(run_dir.join("summary.json"), payload);
    }
    if let Ok(mut file) = fs::File::create(run_dir.join("stats.txt")) {
        let _ = write_flat(&mut file, summary);
    }
}

fn write_flat(out: &mut impl Write, s: &RunSummary) -> std::io::Result<()> {
    writeln!(out, "sim.ticks {}", s.ticks)?;
    writeln!(out, "sim.wall_ms {}", s.wall_ms)?;
    writeln!(out, "sim.anomalies {}", s.anomalies)?;
    for (key, val) in aggregate_lines(&s.total) {
        writeln!(out, "sim.{key} {val}")?;
    }
    if let Some(roi) = &s.roi {
        writeln!(out, "roi.begin_tick {}", roi.begin_tick)?;
        writeln!(out, "roi.end_tick {}", roi.end_tick)?;
        for (key, val) in aggregate_lines(&roi.total) {
            writeln!(out, "roi.{key} {val}")?;
        }
    }
    for core in &s.per_core {
        let c = &core.cache;
        let id = core.core;
        for (key, val) in [
            ("loads", c.loads),
            ("stores", c.stores),
            ("hits", c.hits),
            ("misses", c.misses),
            ("evictions", c.evictions),
            ("writebacks", c.writebacks),
            ("invalidations_rx", c.invalidations_rx),
            ("downgrades_rx", c.downgrades_rx),
        ] {
            writeln!(out, "l1_{id}.{key} {val}")?;
        }
    }
    for (id, dir) in s.dirs.iter().enumerate() {
        for (key, val) in [
            ("gets", dir.gets),
            ("getm", dir.getm),
            ("puts", dir.puts),
            ("putm", dir.putm),
            ("stale_puts", dir.stale_puts),
            ("forwards", dir.forwards),
            ("invalidations", dir.invalidations),
            ("queued", dir.queued),
        ] {
            writeln!(out, "dir_{id}.{key} {val}")?;
        }
    }
    for (label, arrays) in [("l2_hub", &s.l2_hubs), ("l3_bank", &s.l3_banks)] {
        for (id, tags) in arrays.iter().enumerate() {
            writeln!(out, "{label}_{id}.hits {}", tags.hits)?;
            writeln!(out, "{label}_{id}.misses {}", tags.misses)?;
            writeln!(out, "{label}_{id}.evictions {}", tags.evictions)?;
            writeln!(out, "{label}_{id}.invalidations {}", tags.invalidations)?;
        }
    }
    for vnet in 0..s.fabric.sent.len() {
        writeln!(out, "fabric.vnet{vnet}.sent {}", s.fabric.sent[vnet])?;
        writeln!(out, "fabric.vnet{vnet}.delivered {}", s.fabric.delivered[vnet])?;
    }
    writeln!(out, "fabric.rejects {}", s.fabric.rejects)?;
    writeln!(out, "mem.reads {}", s.mem.reads)?;
    writeln!(out, "mem.writebacks {}", s.mem.writebacks)?;
    Ok(())
}

fn aggregate_lines(total: &AggregateStats) -> [(&'static str, u64); 9] {
    [
        ("loads", total.loads),
        ("stores", total.stores),
        ("hits", total.hits),
        ("misses", total.misses),
        ("evictions", total.evictions),
        ("writebacks", total.writebacks),
        ("invalidations_rx", total.invalidations_rx),
        ("downgrades_rx", total.downgrades_rx),
        ("transitions", total.transitions),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_per_core_counters() {
        let per_core = vec![
            CoreSummary {
                core: 0,
                cache: CacheStats {
                    loads: 10,
                    hits: 7,
                    misses: 3,
                    ..CacheStats::default()
                },
            },
            CoreSummary {
                core: 1,
                cache: CacheStats {
                    loads: 5,
                    stores: 2,
                    hits: 4,
                    misses: 3,
                    ..CacheStats::default()
                },
            },
        ];
        let total = aggregate(&per_core);
        assert_eq!(total.num_cores, 2);
        assert_eq!(total.loads, 15);
        assert_eq!(total.stores, 2);
        assert_eq!(total.hits, 11);
        assert_eq!(total.misses, 6);
    }

    #[test]
    fn flat_dump_covers_every_section() {
        let summary = RunSummary {
            ticks: 42,
            wall_ms: 5,
            anomalies: 0,
            total: AggregateStats::default(),
            roi: None,
            per_core: vec![CoreSummary {
                core: 0,
                cache: CacheStats::default(),
            }],
            dirs: vec![DirStats::default()],
            l2_hubs: vec![TagArrayStats::default()],
            l3_banks: vec![TagArrayStats::default()],
            fabric: FabricStats::default(),
            mem: MemSummary {
                reads: 1,
                writebacks: 2,
            },
        };
        let mut buf = Vec::new();
        write_flat(&mut buf, &summary).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("sim.ticks 42"));
        assert!(text.contains("l1_0.loads 0"));
        assert!(text.contains("dir_0.gets 0"));
        assert!(text.contains("l2_hub_0.hits 0"));
        assert!(text.contains("mem.writebacks 2"));
    }
}
