/*
Shared setup for the end-to-end protocol scenarios: a single-cluster
machine with stats output disabled, and access literals.  Directed
accesses go through `run_access`, which drains events until the access
completes, so each assertion sees a quiesced machine.
*/

use crate::sim::config::{
    CacheConfig, FabricConfig, MemConfig, SimConfig, TopologyConfig, WorkloadConfig,
};
use crate::sim::top::BetatronTop;
use crate::workload::{Access, AccessOp};

pub fn machine(num_cores: usize) -> BetatronTop {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let topo = TopologyConfig {
        num_cores,
        cluster_size: num_cores,
        ..TopologyConfig::default()
    };
    BetatronTop::new(
        sim,
        topo,
        CacheConfig::default(),
        FabricConfig::default(),
        MemConfig::default(),
        WorkloadConfig::default(),
    )
    .expect("valid test configuration")
}

pub fn load(addr: u64) -> Access {
    Access {
        addr,
        size: 8,
        value: 0,
        op: AccessOp::Load,
    }
}

pub fn store(addr: u64, value: u64) -> Access {
    Access {
        addr,
        size: 8,
        value,
        op: AccessOp::Store,
    }
}
