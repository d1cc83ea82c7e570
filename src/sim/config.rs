use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::eventq::Tick;
use crate::workload::{PatternSpec, SizeClass};

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub log_level: u64,
    /// Hard tick limit; the run aborts past this even without a deadlock.
    pub timeout: Tick,
    /// Ticks without any transaction completing before the watchdog fires.
    pub deadlock_window: Tick,
    pub stats: bool,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            timeout: 10_000_000,
            deadlock_window: 50_000,
            stats: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct TopologyConfig {
    pub num_cores: usize,
    pub cluster_size: usize,
    pub num_l3_banks: usize,
    pub line_size: u64,
    pub mem_ctrls: usize,
    pub mem_size_mib: u64,
}

impl Config for TopologyConfig {}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            num_cores: 4,
            cluster_size: 4,
            num_l3_banks: 1,
            line_size: 64,
            mem_ctrls: 1,
            mem_size_mib: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_size_kib: u64,
    pub l1_assoc: u32,
    pub l1_transitions_per_cycle: u32,
    pub l2_size_kib: u64,
    pub l2_assoc: u32,
    pub l2_latency: Tick,
    pub l3_size_kib: u64,
    pub l3_assoc: u32,
    pub l3_latency: Tick,
    pub dir_transitions_per_cycle: u32,
}

impl Config for CacheConfig {}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_size_kib: 32,
            l1_assoc: 4,
            l1_transitions_per_cycle: 32,
            l2_size_kib: 256,
            l2_assoc: 4,
            l2_latency: 8,
            l3_size_kib: 4096,
            l3_assoc: 16,
            l3_latency: 30,
            dir_transitions_per_cycle: 4,
        }
    }
}

impl CacheConfig {
    pub fn sets(size_kib: u64, assoc: u32, line_size: u64) -> usize {
        ((size_kib << 10) / (line_size * assoc as u64)) as usize
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct FabricConfig {
    /// Link latency inside a cluster.
    pub intra_latency: Tick,
    /// Link latency on the hub network between clusters.
    pub inter_latency: Tick,
    /// Per-lane FIFO depth before Backpressure.
    pub buffer_entries: usize,
}

impl Config for FabricConfig {}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            intra_latency: 1,
            inter_latency: 12,
            buffer_entries: 16,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemConfig {
    pub latency: Tick,
}

impl Config for MemConfig {}

impl Default for MemConfig {
    fn default() -> Self {
        Self { latency: 100 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Named benchmark profile; overrides `pattern` when set.
    pub benchmark: Option<String>,
    pub pattern: PatternSpec,
    pub size: SizeClass,
    /// Per-core access count override; 0 keeps the size-class default.
    pub accesses: u64,
}

impl Config for WorkloadConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_falls_back_to_defaults() {
        let topo = TopologyConfig::from_section(None);
        assert_eq!(topo.num_cores, 4);
        assert_eq!(topo.line_size, 64);
    }

    #[test]
    fn section_overrides_selected_fields() {
        let doc: Value = "num_cores = 8\ncluster_size = 4\n".parse().unwrap();
        let topo = TopologyConfig::from_section(Some(&doc));
        assert_eq!(topo.num_cores, 8);
        assert_eq!(topo.cluster_size, 4);
        // Untouched fields keep their defaults.
        assert_eq!(topo.mem_ctrls, 1);
    }

    #[test]
    fn workload_pattern_parses_tagged_kind() {
        let doc: Value = "size = \"simsmall\"\n[pattern]\nkind = \"ping_pong\"\n"
            .parse()
            .unwrap();
        let wl = WorkloadConfig::from_section(Some(&doc));
        assert_eq!(wl.size, SizeClass::SimSmall);
        assert!(matches!(wl.pattern, PatternSpec::PingPong));
    }
}
