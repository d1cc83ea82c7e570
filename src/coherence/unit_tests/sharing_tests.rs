use super::harness::{load, machine, store};
use crate::sim::config::{
    CacheConfig, FabricConfig, MemConfig, SimConfig, TopologyConfig, WorkloadConfig,
};
use crate::sim::top::BetatronTop;

#[test]
fn cold_load_is_granted_exclusive() {
    let mut top = machine(2);
    top.run_access(0, load(0x8000)).unwrap();
    // Sole requester got E: the following store upgrades silently, with no
    // second request reaching the directory.
    top.run_access(0, store(0x8000, 7)).unwrap();
    assert_eq!(top.l1s[0].stats.misses, 1);
    assert_eq!(top.l1s[0].stats.hits, 1);
    assert_eq!(top.dirs[0].stats.gets, 1);
    assert_eq!(top.dirs[0].stats.getm, 0);
}

#[test]
fn store_load_roundtrip_same_core() {
    let mut top = machine(2);
    top.run_access(0, store(0x4000, 0xDEAD_BEEF)).unwrap();
    let value = top.run_access(0, load(0x4000)).unwrap();
    assert_eq!(value, 0xDEAD_BEEF);
}

#[test]
fn store_load_roundtrip_survives_interleaved_traffic() {
    let mut top = machine(4);
    top.run_access(0, store(0x4000, 0xABCD)).unwrap();
    // Other cores fight over an unrelated shared line in between.
    for i in 0..8u64 {
        top.run_access(2, store(0x9000, i)).unwrap();
        top.run_access(3, store(0x9000, i + 100)).unwrap();
        top.run_access(1, load(0x9000)).unwrap();
    }
    assert_eq!(top.run_access(0, load(0x4000)).unwrap(), 0xABCD);
}

#[test]
fn reader_pulls_dirty_line_from_owner() {
    let mut top = machine(2);
    top.run_access(0, store(0x4000, 42)).unwrap();
    // Owner forwards the line and downgrades; the directory commits the
    // copy so memory is current before the block goes Shared.
    assert_eq!(top.run_access(1, load(0x4000)).unwrap(), 42);
    assert_eq!(top.l1s[0].stats.downgrades_rx, 1);
    assert_eq!(top.dirs[0].stats.forwards, 1);
    top.settle().unwrap();
    assert_eq!(top.mem.peek_word(0x4000), 42);
}

#[test]
fn writer_invalidates_sharers_and_collects_acks() {
    let mut top = machine(2);
    top.run_access(0, load(0x4000)).unwrap();
    top.run_access(1, load(0x4000)).unwrap();
    // Both cores hold S; core 1 upgrades and core 0 must ack the Inv.
    top.run_access(1, store(0x4000, 9)).unwrap();
    assert_eq!(top.l1s[0].stats.invalidations_rx, 1);
    assert_eq!(top.dirs[0].stats.invalidations, 1);
    // Core 0 reads the line back from the new owner.
    assert_eq!(top.run_access(0, load(0x4000)).unwrap(), 9);
}

#[test]
fn cross_cluster_sharing_pays_hub_latency() {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let topo = TopologyConfig {
        num_cores: 8,
        cluster_size: 4,
        ..TopologyConfig::default()
    };
    let mut top = BetatronTop::new(
        sim,
        topo,
        CacheConfig::default(),
        FabricConfig::default(),
        MemConfig::default(),
        WorkloadConfig::default(),
    )
    .unwrap();
    top.run_access(0, store(0x4000, 77)).unwrap();
    // Core 4 lives in the other cluster; the forward crosses both hubs.
    assert_eq!(top.run_access(4, load(0x4000)).unwrap(), 77);
    assert_eq!(top.l1s[0].stats.downgrades_rx, 1);
}
