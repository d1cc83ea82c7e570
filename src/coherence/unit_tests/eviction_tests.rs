use super::harness::{load, machine, store};

#[test]
fn modified_eviction_writes_back_before_reuse() {
    let mut top = machine(2);
    // 32 KiB 4-way with 64 B lines: 128 sets, so 8 KiB stride stays in one
    // set.  Fill the set with a dirty line plus four more to force it out.
    let stride = 128 * 64;
    let base = 0x10_0000;
    top.run_access(0, store(base, 0x51)).unwrap();
    for i in 1..=4u64 {
        top.run_access(0, load(base + i * stride)).unwrap();
    }
    top.settle().unwrap();
    assert!(top.l1s[0].stats.writebacks >= 1);
    assert!(top.mem.writebacks >= 1);
    assert_eq!(top.mem.peek_word(base), 0x51);
}

#[test]
fn lru_eviction_over_ten_disjoint_lines() {
    let mut top = machine(2);
    let stride = 128 * 64;
    let base = 0x10_0000;
    for i in 0..10u64 {
        top.run_access(0, load(base + i * stride)).unwrap();
    }
    let stats = &top.l1s[0].stats;
    assert_eq!(stats.misses, 10);
    assert_eq!(stats.hits, 0);
    // 4 ways fill cold; the remaining 6 fills each displace the LRU line.
    assert_eq!(stats.evictions, 6);
}
