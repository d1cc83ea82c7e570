/*
Topology builder.

Constructs the controller arena and the static link graph in a single pass:
one L1 per core, one shared L2 hub per cluster, one or more L3 banks, one
directory per memory-controller range.  Controllers inside a cluster are
fully connected point-to-point; clusters reach the rest of the machine only
through their hub, so the link count stays O(n^2 / k) local plus O(c^2) hub
instead of O(n^2) global.

The graph never mutates after build.  Protocol endpoints (L1s and
directories) get a fabric channel per ordered pair, with the channel latency
and hop count taken from the cheapest path through the link graph.  All
parameter validation happens here, eagerly: a request for an address with no
directory, or a cluster partition that does not divide the core count, is a
ConfigError before the first tick, never a runtime panic.
*/

use std::collections::BinaryHeap;

use log::debug;

use crate::error::ConfigError;
use crate::eventq::Tick;
use crate::fabric::Fabric;
use crate::sim::config::{CacheConfig, FabricConfig, TopologyConfig};

pub type CtrlId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    L1 { core: usize },
    L2Hub,
    L3Bank { bank: usize },
    Directory { range_start: u64, range_end: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerInfo {
    pub id: CtrlId,
    pub kind: ControllerKind,
    /// Cluster membership; directories and L3 banks sit outside clusters.
    pub cluster: Option<usize>,
}

#[derive(Debug)]
pub struct Topology {
    pub controllers: Vec<ControllerInfo>,
    pub l1s: Vec<CtrlId>,
    pub hubs: Vec<CtrlId>,
    pub l3_banks: Vec<CtrlId>,
    pub dirs: Vec<CtrlId>,
    pub line_size: u64,
    pub cluster_size: usize,
    /// `ranges[i]` is the half-open address range served by `dirs[i]`.
    ranges: Vec<(u64, u64)>,
    /// Adjacency list: (neighbor, link latency).
    links: Vec<Vec<(CtrlId, Tick)>>,
}

impl Topology {
    pub fn build(
        topo: &TopologyConfig,
        cache: &CacheConfig,
        fabric_cfg: &FabricConfig,
        fabric: &mut Fabric,
    ) -> Result<Self, ConfigError> {
        validate(topo, cache)?;

        let num_clusters = topo.num_cores / topo.cluster_size;
        let mut controllers = Vec::new();
        let mut push = |kind, cluster| {
            let id = controllers.len();
            controllers.push(ControllerInfo { id, kind, cluster });
            id
        };

        let l1s: Vec<CtrlId> = (0..topo.num_cores)
            .map(|core| push(ControllerKind::L1 { core }, Some(core / topo.cluster_size)))
            .collect();
        let hubs: Vec<CtrlId> = (0..num_clusters)
            .map(|c| push(ControllerKind::L2Hub, Some(c)))
            .collect();
        let l3_banks: Vec<CtrlId> = (0..topo.num_l3_banks)
            .map(|bank| push(ControllerKind::L3Bank { bank }, None))
            .collect();

        let ranges = partition_ranges(topo.mem_size_mib << 20, topo.mem_ctrls);
        let dirs: Vec<CtrlId> = ranges
            .iter()
            .map(|&(range_start, range_end)| {
                push(
                    ControllerKind::Directory {
                        range_start,
                        range_end,
                    },
                    None,
                )
            })
            .collect();

        let mut links = vec![Vec::new(); controllers.len()];
        let mut connect = |a: CtrlId, b: CtrlId, latency: Tick| {
            links[a].push((b, latency));
            links[b].push((a, latency));
        };

        // Intra-cluster: L1s and the hub of one cluster, fully connected.
        for c in 0..num_clusters {
            let members: Vec<CtrlId> = l1s[c * topo.cluster_size..(c + 1) * topo.cluster_size]
                .iter()
                .copied()
                .chain(std::iter::once(hubs[c]))
                .collect();
            for (i, &a) in members.iter().enumerate() {
                for &b in &members[i + 1..] {
                    connect(a, b, fabric_cfg.intra_latency);
                }
            }
        }

        // Inter-cluster: hubs, L3 banks and directories on the hub network.
        let inter: Vec<CtrlId> = hubs
            .iter()
            .chain(l3_banks.iter())
            .chain(dirs.iter())
            .copied()
            .collect();
        for (i, &a) in inter.iter().enumerate() {
            for &b in &inter[i + 1..] {
                connect(a, b, fabric_cfg.inter_latency);
            }
        }

        let topology = Self {
            controllers,
            l1s,
            hubs,
            l3_banks,
            dirs,
            line_size: topo.line_size,
            cluster_size: topo.cluster_size,
            ranges,
            links,
        };
        topology.validate_ranges(topo.mem_size_mib << 20)?;
        topology.build_channels(fabric_cfg, fabric);
        Ok(topology)
    }

    /// One channel per ordered endpoint pair: L1 <-> directory for the
    /// request/response path, L1 <-> L1 for forwards and InvAcks.
    fn build_channels(&self, fabric_cfg: &FabricConfig, fabric: &mut Fabric) {
        let endpoints: Vec<CtrlId> = self.l1s.iter().chain(self.dirs.iter()).copied().collect();
        for &src in &endpoints {
            for &dst in &endpoints {
                if src == dst {
                    continue;
                }
                let (latency, hops) = self.cheapest_path(src, dst);
                debug!(
                    "channel {src}->{dst}: latency {latency}, {hops} hop(s)"
                );
                fabric.add_channel(src, dst, latency, hops, fabric_cfg.buffer_entries);
            }
        }
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        addr & !(self.line_size - 1)
    }

    /// The directory bank owning `addr`.  Infallible: range coverage was
    /// validated at build time.
    pub fn dir_for_addr(&self, addr: u64) -> CtrlId {
        let idx = self
            .ranges
            .iter()
            .position(|&(start, end)| addr >= start && addr < end)
            .expect("address outside validated memory ranges");
        self.dirs[idx]
    }

    pub fn l3_bank_for(&self, line_addr: u64) -> usize {
        let line_bits = self.line_size.trailing_zeros();
        ((line_addr >> line_bits) as usize) & (self.l3_banks.len() - 1)
    }

    pub fn cluster_of(&self, ctrl: CtrlId) -> Option<usize> {
        self.controllers[ctrl].cluster
    }

    pub fn num_clusters(&self) -> usize {
        self.hubs.len()
    }

    fn validate_ranges(&self, mem_size: u64) -> Result<(), ConfigError> {
        let mut expected = 0u64;
        for &(start, end) in &self.ranges {
            if start > expected {
                return Err(ConfigError::UncoveredAddress(expected));
            }
            if start < expected {
                return Err(ConfigError::OverlappingRanges(start));
            }
            expected = end;
        }
        if expected < mem_size {
            return Err(ConfigError::UncoveredAddress(expected));
        }
        Ok(())
    }

    /// Dijkstra over the static link graph.  Returns (latency, hops).
    fn cheapest_path(&self, src: CtrlId, dst: CtrlId) -> (Tick, u32) {
        let mut best: Vec<Option<(Tick, u32)>> = vec![None; self.links.len()];
        let mut heap: BinaryHeap<std::cmp::Reverse<(Tick, u32, CtrlId)>> = BinaryHeap::new();
        heap.push(std::cmp::Reverse((0, 0, src)));
        while let Some(std::cmp::Reverse((cost, hops, node))) = heap.pop() {
            if let Some((seen, _)) = best[node] {
                if seen <= cost {
                    continue;
                }
            }
            best[node] = Some((cost, hops));
            if node == dst {
                return (cost, hops);
            }
            for &(next, latency) in &self.links[node] {
                heap.push(std::cmp::Reverse((cost + latency, hops + 1, next)));
            }
        }
        panic!("no path {}->{} in link graph", src, dst);
    }
}

fn partition_ranges(mem_size: u64, mem_ctrls: usize) -> Vec<(u64, u64)> {
    let chunk = mem_size / mem_ctrls as u64;
    (0..mem_ctrls as u64)
        .map(|i| {
            let start = i * chunk;
            let end = if i == mem_ctrls as u64 - 1 {
                mem_size
            } else {
                start + chunk
            };
            (start, end)
        })
        .collect()
}

fn validate(topo: &TopologyConfig, cache: &CacheConfig) -> Result<(), ConfigError> {
    if !topo.line_size.is_power_of_two() {
        return Err(ConfigError::LineSizeNotPow2(topo.line_size));
    }
    if topo.mem_ctrls == 0 {
        return Err(ConfigError::NoMemCtrls);
    }
    if topo.num_cores == 0 {
        return Err(ConfigError::ZeroField { field: "num_cores" });
    }
    if topo.cluster_size == 0 {
        return Err(ConfigError::ZeroField {
            field: "cluster_size",
        });
    }
    if topo.mem_size_mib == 0 {
        return Err(ConfigError::ZeroField {
            field: "mem_size_mib",
        });
    }
    // Cluster id is core_id / cluster_size; reject configurations where
    // that division would truncate instead of silently dropping cores.
    if topo.num_cores % topo.cluster_size != 0 {
        return Err(ConfigError::UnevenClusters {
            cores: topo.num_cores,
            cluster_size: topo.cluster_size,
        });
    }
    if !topo.num_l3_banks.is_power_of_two() {
        return Err(ConfigError::BankCountNotPow2(topo.num_l3_banks));
    }
    for (level, size_kib, assoc) in [
        ("L1", cache.l1_size_kib, cache.l1_assoc),
        ("L2", cache.l2_size_kib, cache.l2_assoc),
        ("L3", cache.l3_size_kib, cache.l3_assoc),
    ] {
        if assoc == 0 {
            return Err(ConfigError::ZeroField { field: "assoc" });
        }
        let capacity = size_kib << 10;
        let granule = topo.line_size * assoc as u64;
        if capacity == 0 || capacity % granule != 0 {
            return Err(ConfigError::UnevenSets {
                level,
                capacity,
                granule,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::config::{CacheConfig, FabricConfig, TopologyConfig};

    fn build(topo: &TopologyConfig) -> Result<(Topology, Fabric), ConfigError> {
        let mut fabric = Fabric::new();
        let t = Topology::build(topo, &CacheConfig::default(), &FabricConfig::default(), &mut fabric)?;
        Ok((t, fabric))
    }

    #[test]
    fn default_topology_counts() {
        let (topo, _) = build(&TopologyConfig::default()).unwrap();
        assert_eq!(topo.l1s.len(), 4);
        assert_eq!(topo.hubs.len(), 1);
        assert_eq!(topo.l3_banks.len(), 1);
        assert_eq!(topo.dirs.len(), 1);
        // Ids are arena-assigned in one pass, densely.
        assert_eq!(topo.controllers.len(), 7);
        for (i, info) in topo.controllers.iter().enumerate() {
            assert_eq!(info.id, i);
        }
    }

    #[test]
    fn two_cluster_topology_routes_through_hubs() {
        let config = TopologyConfig {
            num_cores: 8,
            cluster_size: 4,
            ..TopologyConfig::default()
        };
        let (topo, fabric) = build(&config).unwrap();
        assert_eq!(topo.num_clusters(), 2);
        // Cross-cluster L1 pairs must take at least 3 hops (L1 -> hub ->
        // hub -> L1) and pay the hub latency.
        let chan = fabric.channel_for(topo.l1s[0], topo.l1s[7]).unwrap();
        assert!(fabric.hops(chan) >= 3);
        // Same-cluster pairs are a single point-to-point hop.
        let chan = fabric.channel_for(topo.l1s[0], topo.l1s[1]).unwrap();
        assert_eq!(fabric.hops(chan), 1);
    }

    #[test]
    fn rejects_non_pow2_line_size() {
        let config = TopologyConfig {
            line_size: 48,
            ..TopologyConfig::default()
        };
        assert!(matches!(
            build(&config),
            Err(ConfigError::LineSizeNotPow2(48))
        ));
    }

    #[test]
    fn rejects_zero_mem_ctrls() {
        let config = TopologyConfig {
            mem_ctrls: 0,
            ..TopologyConfig::default()
        };
        assert!(matches!(build(&config), Err(ConfigError::NoMemCtrls)));
    }

    #[test]
    fn rejects_uneven_cluster_partition() {
        let config = TopologyConfig {
            num_cores: 6,
            cluster_size: 4,
            ..TopologyConfig::default()
        };
        assert!(matches!(
            build(&config),
            Err(ConfigError::UnevenClusters {
                cores: 6,
                cluster_size: 4
            })
        ));
    }

    #[test]
    fn rejects_non_pow2_l3_banks() {
        let config = TopologyConfig {
            num_l3_banks: 3,
            ..TopologyConfig::default()
        };
        assert!(matches!(build(&config), Err(ConfigError::BankCountNotPow2(3))));
    }

    #[test]
    fn every_address_maps_to_one_directory() {
        let config = TopologyConfig {
            mem_ctrls: 2,
            ..TopologyConfig::default()
        };
        let (topo, _) = build(&config).unwrap();
        assert_eq!(topo.dirs.len(), 2);
        let low = topo.dir_for_addr(0);
        let high = topo.dir_for_addr((config.mem_size_mib << 20) - 8);
        assert_ne!(low, high);
    }

    #[test]
    fn l3_bank_selection_uses_line_bits() {
        let config = TopologyConfig {
            num_l3_banks: 4,
            ..TopologyConfig::default()
        };
        let (topo, _) = build(&config).unwrap();
        assert_eq!(topo.l3_bank_for(0x000), 0);
        assert_eq!(topo.l3_bank_for(0x040), 1);
        assert_eq!(topo.l3_bank_for(0x080), 2);
        assert_eq!(topo.l3_bank_for(0x100), 0);
    }
}
