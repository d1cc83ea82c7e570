use super::harness::{load, machine, store};
use crate::sim::config::{
    CacheConfig, FabricConfig, MemConfig, SimConfig, TopologyConfig, WorkloadConfig,
};
use crate::sim::top::BetatronTop;
use crate::workload::{CoreStream, ExitCause, PatternSpec, SizeClass};

#[test]
fn ping_pong_stores_alternate_ownership() {
    let mut top = machine(4);
    let hot = 0x4000;
    let rounds = 1000u64;
    for i in 0..rounds {
        top.run_access(0, store(hot, i << 1)).unwrap();
        top.run_access(1, store(hot, (i << 1) | 1)).unwrap();
    }
    let stores: u64 = top.l1s.iter().map(|l| l.stats.stores).sum();
    assert_eq!(stores, 2 * rounds);
    // Every store after the first steals ownership from the other core.
    let invalidations: u64 = top.l1s.iter().map(|l| l.stats.invalidations_rx).sum();
    assert!(invalidations >= rounds - 1, "only {invalidations} transfers");
    // Last writer wins in memory once the dirty line is flushed.
    let summary = top.finish().unwrap();
    assert_eq!(top.mem.peek_word(hot), ((rounds - 1) << 1) | 1);
    assert_eq!(summary.total.stores, 2 * rounds);
}

#[test]
fn second_reader_hits_the_shared_l2_tags() {
    let mut top = machine(2);
    top.run_access(0, load(0x4000)).unwrap();
    // Core 1 GetS probes the cluster hub on the way out and finds the tag
    // the first fill left behind.
    top.run_access(1, load(0x4000)).unwrap();
    assert_eq!(top.l2_tags[0].stats.misses, 1);
    assert_eq!(top.l2_tags[0].stats.hits, 1);
}

#[test]
fn exclusive_request_flushes_shared_tags() {
    let mut top = machine(2);
    top.run_access(0, load(0x4000)).unwrap();
    top.run_access(1, store(0x4000, 1)).unwrap();
    assert!(top.l2_tags[0].stats.invalidations >= 1);
    // The next reader misses the shared levels again.
    top.run_access(0, load(0x4000)).unwrap();
    assert_eq!(top.l2_tags[0].stats.misses, 2);
}

#[test]
fn full_run_retires_every_stream_item() {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let workload = WorkloadConfig {
        pattern: PatternSpec::Strided {
            stride: 64,
            store_every: 4,
        },
        size: SizeClass::Test,
        accesses: 40,
        ..WorkloadConfig::default()
    };
    let mut top = BetatronTop::new(
        sim,
        TopologyConfig::default(),
        CacheConfig::default(),
        FabricConfig::default(),
        MemConfig::default(),
        workload,
    )
    .unwrap();
    let summary = top.run().unwrap();
    assert_eq!(summary.total.loads + summary.total.stores, 4 * 40);
    assert!(summary.ticks > 0);
    let roi = summary.roi.expect("all cores bracket the roi");
    assert_eq!(roi.total.loads + roi.total.stores, 4 * 40);
    // Nothing left on the wire.
    let sent: u64 = summary.fabric.sent.iter().sum();
    let delivered: u64 = summary.fabric.delivered.iter().sum();
    assert_eq!(sent, delivered);
}

#[test]
fn tiny_buffers_and_budgets_stall_but_never_drop() {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let cache = CacheConfig {
        l1_transitions_per_cycle: 1,
        dir_transitions_per_cycle: 1,
        ..CacheConfig::default()
    };
    let fabric = FabricConfig {
        buffer_entries: 1,
        ..FabricConfig::default()
    };
    // Every access is a store to a fresh line of one set, so each miss past
    // the fourth evicts a dirty victim and bursts PutM + GetM onto the same
    // one-entry request lane.
    let workload = WorkloadConfig {
        pattern: PatternSpec::Strided {
            stride: 128 * 64,
            store_every: 1,
        },
        size: SizeClass::Test,
        accesses: 200,
        ..WorkloadConfig::default()
    };
    let mut top = BetatronTop::new(
        sim,
        TopologyConfig::default(),
        cache,
        fabric,
        MemConfig::default(),
        workload,
    )
    .unwrap();
    let summary = top.run().unwrap();
    // Backpressure stalls the senders but every access still retires.
    assert_eq!(summary.total.stores, 4 * 200);
    assert!(summary.fabric.rejects > 0);
    // Four first requests land on the directory in the same cycle; a budget
    // of one forces the rest to defer to later ticks.
    assert!(summary.dirs[0].deferred_events > 0);
    // Nothing was dropped on the wire.
    let sent: u64 = summary.fabric.sent.iter().sum();
    let delivered: u64 = summary.fabric.delivered.iter().sum();
    assert_eq!(sent, delivered);
}

#[test]
fn abnormal_exit_still_completes_and_is_counted() {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let workload = WorkloadConfig {
        accesses: 10,
        ..WorkloadConfig::default()
    };
    let mut top = BetatronTop::new(
        sim,
        TopologyConfig::default(),
        CacheConfig::default(),
        FabricConfig::default(),
        MemConfig::default(),
        workload,
    )
    .unwrap();
    // One core's runner dies with an unexpected cause; the run must still
    // retire every stream and flush statistics, surfacing the anomaly.
    top.streams[2] = CoreStream::new(2, &PatternSpec::default(), SizeClass::Test)
        .with_total(10)
        .with_exit(ExitCause::Anomaly("unexpected syscall"));
    let summary = top.run().unwrap();
    assert_eq!(summary.anomalies, 1);
    assert_eq!(summary.total.loads + summary.total.stores, 4 * 10);
}

#[test]
fn contended_run_with_blocking_directory_queueing() {
    let sim = SimConfig {
        stats: false,
        ..SimConfig::default()
    };
    let topo = TopologyConfig {
        num_cores: 2,
        cluster_size: 2,
        ..TopologyConfig::default()
    };
    let workload = WorkloadConfig {
        pattern: PatternSpec::PingPong,
        size: SizeClass::Test,
        accesses: 50,
        ..WorkloadConfig::default()
    };
    let mut top = BetatronTop::new(
        sim,
        topo,
        CacheConfig::default(),
        FabricConfig::default(),
        MemConfig::default(),
        workload,
    )
    .unwrap();
    // Concurrent GetMs for the hot line force the directory to queue the
    // loser behind the open transaction.
    let summary = top.run().unwrap();
    assert_eq!(summary.total.stores, 100);
    assert!(summary.dirs[0].queued > 0);
    assert_eq!(summary.dirs[0].forwards, summary.dirs[0].getm - 1);
}
