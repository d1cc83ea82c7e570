/*
Top-level discrete-event driver.

Owns every component of one simulated machine and advances logical time by
draining the event queue: workload items issue into the L1s, protocol
messages ride the fabric, and controllers that ran out of transition budget
or hit a full buffer get woken a tick later.  The loop ends when every core
has retired its stream and the last in-flight transaction has settled.
*/

use std::collections::VecDeque;

use log::{info, warn};

use crate::coherence::cache::{
    CacheController, CompletedAccess, CpuOutcome, OutDst, OutMsg, Outcome, TagArray,
};
use crate::coherence::directory::{DirOuts, DirectoryController, FillLatency};
use crate::coherence::protocol::CacheState;
use crate::error::SimError;
use crate::eventq::{Event, EventQueue, Tick};
use crate::fabric::{Fabric, FillLevel, Message, MsgKind};
use crate::mem::MainMemory;
use crate::sim::config::{
    CacheConfig, FabricConfig, MemConfig, SimConfig, TopologyConfig, WorkloadConfig,
};
use crate::sim::stats::{
    self, aggregate, AggregateStats, CoreSummary, MemSummary, RoiSummary, RunSummary,
};
use crate::topology::{ControllerKind, CtrlId, Topology};
use crate::workload::{benchmark_pattern, build_streams, Access, CoreStream, ExitCause, WorkItem};

/// What a controller id dispatches to.
#[derive(Debug, Clone, Copy)]
enum Role {
    L1(usize),
    Dir(usize),
    Passive,
}

#[derive(Debug, Default)]
struct RoiTrack {
    begun: usize,
    ended: usize,
    begin_tick: Tick,
    snapshot: Option<AggregateStats>,
    summary: Option<RoiSummary>,
}

pub struct BetatronTop {
    sim_cfg: SimConfig,
    pub topo: Topology,
    pub fabric: Fabric,
    pub l1s: Vec<CacheController>,
    pub dirs: Vec<DirectoryController>,
    pub l2_tags: Vec<TagArray>,
    pub l3_tags: Vec<TagArray>,
    pub mem: MainMemory,
    pub streams: Vec<CoreStream>,
    eventq: EventQueue,
    roles: Vec<Role>,
    /// Messages a full lane pushed back, per source controller.
    outbox: Vec<VecDeque<(Tick, Message)>>,
    completions: Vec<CompletedAccess>,
    now: Tick,
    last_progress: Tick,
    cores_done: usize,
    roi: RoiTrack,
    anomalies: u64,
    mem_bytes: u64,
    started: std::time::Instant,
}

impl BetatronTop {
    pub fn new(
        sim_cfg: SimConfig,
        topo_cfg: TopologyConfig,
        cache_cfg: CacheConfig,
        fabric_cfg: FabricConfig,
        mem_cfg: MemConfig,
        workload_cfg: WorkloadConfig,
    ) -> Result<Self, SimError> {
        let mut fabric = Fabric::new();
        let topo = Topology::build(&topo_cfg, &cache_cfg, &fabric_cfg, &mut fabric)?;
        let line_size = topo.line_size;

        let l1_sets = CacheConfig::sets(cache_cfg.l1_size_kib, cache_cfg.l1_assoc, line_size);
        let l1s: Vec<CacheController> = topo
            .l1s
            .iter()
            .enumerate()
            .map(|(core, &id)| {
                CacheController::new(
                    id,
                    core,
                    l1_sets,
                    cache_cfg.l1_assoc as usize,
                    line_size,
                    cache_cfg.l1_transitions_per_cycle,
                )
            })
            .collect();

        let mem = MainMemory::new(line_size as usize, mem_cfg.latency);
        let fill = FillLatency {
            l2: cache_cfg.l2_latency,
            l3: cache_cfg.l3_latency,
            mem: mem.latency(),
        };
        let dirs: Vec<DirectoryController> = topo
            .dirs
            .iter()
            .map(|&id| DirectoryController::new(id, fill, cache_cfg.dir_transitions_per_cycle))
            .collect();

        let l2_sets = CacheConfig::sets(cache_cfg.l2_size_kib, cache_cfg.l2_assoc, line_size);
        let l2_tags = (0..topo.num_clusters())
            .map(|_| TagArray::new(l2_sets, cache_cfg.l2_assoc as usize, line_size))
            .collect();
        let l3_sets = CacheConfig::sets(cache_cfg.l3_size_kib, cache_cfg.l3_assoc, line_size)
            / topo.l3_banks.len();
        let l3_tags = (0..topo.l3_banks.len())
            .map(|_| TagArray::new(l3_sets, cache_cfg.l3_assoc as usize, line_size))
            .collect();

        let roles = topo
            .controllers
            .iter()
            .map(|info| match info.kind {
                ControllerKind::L1 { core } => Role::L1(core),
                ControllerKind::Directory { .. } => {
                    let idx = topo
                        .dirs
                        .iter()
                        .position(|&d| d == info.id)
                        .expect("directory id registered");
                    Role::Dir(idx)
                }
                _ => Role::Passive,
            })
            .collect::<Vec<_>>();

        let pattern = match &workload_cfg.benchmark {
            Some(name) => benchmark_pattern(name)?,
            None => workload_cfg.pattern.clone(),
        };
        let mut streams = build_streams(topo_cfg.num_cores, &pattern, workload_cfg.size);
        if workload_cfg.accesses > 0 {
            streams = streams
                .into_iter()
                .map(|s| s.with_total(workload_cfg.accesses))
                .collect();
        }

        let outbox = (0..topo.controllers.len()).map(|_| VecDeque::new()).collect();
        let mem_bytes = topo_cfg.mem_size_mib << 20;
        Ok(Self {
            sim_cfg,
            topo,
            fabric,
            l1s,
            dirs,
            l2_tags,
            l3_tags,
            mem,
            streams,
            eventq: EventQueue::new(),
            roles,
            outbox,
            completions: Vec::new(),
            now: 0,
            last_progress: 0,
            cores_done: 0,
            roi: RoiTrack::default(),
            anomalies: 0,
            mem_bytes,
            started: std::time::Instant::now(),
        })
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    /// Run the configured workload to completion.
    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        for core in 0..self.streams.len() {
            self.schedule_stream(core, 0);
        }
        while let Some((tick, event)) = self.eventq.pop() {
            self.now = tick;
            self.check_watchdog()?;
            self.dispatch(event)?;
            self.service_completions()?;
        }
        self.finish()
    }

    /// Issue one access on `core` and drain events until it completes.
    /// Directed-test entry point; the configured streams are not consulted.
    pub fn run_access(&mut self, core: usize, access: Access) -> Result<u64, SimError> {
        let at = self.now + 1;
        self.eventq.push(
            at,
            Event::Issue {
                core,
                item: WorkItem::Access(access),
            },
        );
        while let Some((tick, event)) = self.eventq.pop() {
            self.now = tick;
            self.check_watchdog()?;
            self.dispatch(event)?;
            if let Some(pos) = self.completions.iter().position(|c| c.core == core) {
                let done = self.completions.swap_remove(pos);
                self.audit()?;
                return Ok(done.value);
            }
        }
        Err(self.deadlock_error())
    }

    /// Drain every remaining event (in-flight writebacks, acks) without
    /// issuing new work.
    pub fn settle(&mut self) -> Result<(), SimError> {
        while let Some((tick, event)) = self.eventq.pop() {
            self.now = tick;
            self.check_watchdog()?;
            self.dispatch(event)?;
        }
        self.completions.clear();
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<(), SimError> {
        match event {
            Event::Issue { core, item } => self.issue(core, item),
            Event::Deliver { channel } => {
                let msgs = self.fabric.deliver_ready(channel, self.now);
                for msg in msgs {
                    self.dispatch_msg(msg)?;
                }
                Ok(())
            }
            Event::Wake { ctrl } => self.wake(ctrl),
        }
    }

    fn issue(&mut self, core: usize, item: WorkItem) -> Result<(), SimError> {
        match item {
            WorkItem::Access(mut access) => {
                if access.addr >= self.mem_bytes {
                    // Workload anomaly: out-of-range address.  Wrap it and
                    // keep going rather than killing a long run.
                    self.anomalies += 1;
                    warn!(
                        "core {}: access {:#x} beyond memory, wrapping",
                        core, access.addr
                    );
                    access.addr %= self.mem_bytes;
                }
                let outcome = self.l1s[core].cpu_access(self.now, access)?;
                match outcome {
                    CpuOutcome::Hit { value } => {
                        self.completions.push(CompletedAccess { core, value });
                        self.progress();
                    }
                    CpuOutcome::Miss { msgs } => self.route_l1(core, msgs),
                    CpuOutcome::Blocked => {
                        self.eventq.push(
                            self.now + 1,
                            Event::Issue {
                                core,
                                item: WorkItem::Access(access),
                            },
                        );
                    }
                }
                Ok(())
            }
            WorkItem::RoiBegin => {
                if self.roi.begun == 0 {
                    self.roi.begin_tick = self.now;
                    self.roi.snapshot = Some(self.aggregate_now());
                    info!("roi begin at tick {}", self.now);
                }
                self.roi.begun += 1;
                self.schedule_stream(core, self.now);
                Ok(())
            }
            WorkItem::RoiEnd => {
                self.roi.ended += 1;
                if self.roi.ended == self.streams.len() {
                    let snapshot = self.roi.snapshot.take().unwrap_or_default();
                    self.roi.summary = Some(RoiSummary {
                        begin_tick: self.roi.begin_tick,
                        end_tick: self.now,
                        total: self.aggregate_now().since(&snapshot),
                    });
                    info!("roi end at tick {}", self.now);
                }
                self.schedule_stream(core, self.now);
                Ok(())
            }
            WorkItem::Exit(cause) => {
                self.cores_done += 1;
                if let ExitCause::Anomaly(reason) = cause {
                    self.anomalies += 1;
                    warn!(
                        "core {} exited abnormally at tick {}: {}",
                        core, self.now, reason
                    );
                } else {
                    info!("core {} exited at tick {}", core, self.now);
                }
                Ok(())
            }
        }
    }

    fn dispatch_msg(&mut self, msg: Message) -> Result<(), SimError> {
        match self.roles[msg.dst] {
            Role::L1(core) => {
                let ctrl = self.l1s[core].id;
                let outcome = self.l1s[core].handle_message(self.now, msg)?;
                self.absorb_l1_outcome(core, ctrl, outcome);
            }
            Role::Dir(idx) => {
                let ctrl = self.dirs[idx].id;
                let (outs, deferred) = self.dirs[idx].handle_message(self.now, msg, &mut self.mem)?;
                self.route_dir(outs);
                if deferred {
                    self.eventq.push(self.now + 1, Event::Wake { ctrl });
                }
            }
            Role::Passive => unreachable!("message addressed to a passive controller"),
        }
        self.progress();
        Ok(())
    }

    fn wake(&mut self, ctrl: CtrlId) -> Result<(), SimError> {
        // Retry sends the fabric pushed back first, oldest in front.
        while let Some((extra, msg)) = self.outbox[ctrl].pop_front() {
            match self.fabric.send_delayed(self.now, extra, msg) {
                Ok((ready, channel)) => self.eventq.push(ready, Event::Deliver { channel }),
                Err(bp) => {
                    self.outbox[ctrl].push_front((extra, bp.into_message()));
                    self.eventq.push(self.now + 1, Event::Wake { ctrl });
                    break;
                }
            }
        }

        match self.roles[ctrl] {
            Role::L1(core) => {
                let outcomes = self.l1s[core].drain(self.now)?;
                for outcome in outcomes {
                    self.absorb_l1_outcome(core, ctrl, outcome);
                }
            }
            Role::Dir(idx) => {
                let (outs, more) = self.dirs[idx].drain(self.now, &mut self.mem)?;
                self.route_dir(outs);
                if more {
                    self.eventq.push(self.now + 1, Event::Wake { ctrl });
                }
            }
            Role::Passive => {}
        }
        Ok(())
    }

    fn absorb_l1_outcome(&mut self, core: usize, ctrl: CtrlId, outcome: Outcome) {
        let Outcome {
            msgs,
            completed,
            deferred,
        } = outcome;
        self.route_l1(core, msgs);
        if let Some(done) = completed {
            self.completions.push(done);
            self.progress();
        }
        if deferred {
            self.eventq.push(self.now + 1, Event::Wake { ctrl });
        }
    }

    /// Convert controller-relative outgoing messages into fabric sends.
    fn route_l1(&mut self, core: usize, msgs: impl IntoIterator<Item = OutMsg>) {
        let src = self.l1s[core].id;
        let cluster = self
            .topo
            .cluster_of(src)
            .expect("l1 belongs to a cluster");
        for out in msgs {
            let dst = match out.dst {
                OutDst::Dir => self.topo.dir_for_addr(out.line_addr),
                OutDst::Ctrl(id) => id,
            };
            let mut msg = Message::new(out.kind, src, dst, out.line_addr);
            msg.data = out.data;
            match out.kind {
                MsgKind::Data => {
                    // Cache-to-cache supply on the forward path.
                    if matches!(self.roles[dst], Role::L1(_)) {
                        msg.from_owner = true;
                    }
                }
                MsgKind::GetS => msg.fill = self.probe_fill(cluster, out.line_addr, false),
                MsgKind::GetM => msg.fill = self.probe_fill(cluster, out.line_addr, true),
                _ => {}
            }
            self.send(0, msg);
        }
    }

    fn route_dir(&mut self, outs: DirOuts) {
        for out in outs {
            self.send(out.extra, out.msg);
        }
    }

    fn send(&mut self, extra: Tick, msg: Message) {
        let src = msg.src;
        if !self.outbox[src].is_empty() {
            // Keep per-source order behind earlier rejected sends.
            self.outbox[src].push_back((extra, msg));
            self.eventq.push(self.now + 1, Event::Wake { ctrl: src });
            return;
        }
        match self.fabric.send_delayed(self.now, extra, msg) {
            Ok((ready, channel)) => self.eventq.push(ready, Event::Deliver { channel }),
            Err(bp) => {
                self.outbox[src].push_back((extra, bp.into_message()));
                self.eventq.push(self.now + 1, Event::Wake { ctrl: src });
            }
        }
    }

    /// Probe the shared levels on the request path.  The answer rides in the
    /// message and sets the Data latency at the directory.  Shared tags only
    /// ever hold clean lines, so an exclusive request flushes them.
    fn probe_fill(&mut self, cluster: usize, line_addr: u64, exclusive: bool) -> FillLevel {
        let bank = self.topo.l3_bank_for(line_addr);
        let level = if self.l2_tags[cluster].probe(line_addr) {
            FillLevel::L2
        } else if self.l3_tags[bank].probe(line_addr) {
            FillLevel::L3
        } else {
            FillLevel::Mem
        };
        if exclusive {
            for tags in &mut self.l2_tags {
                tags.invalidate(line_addr);
            }
            self.l3_tags[bank].invalidate(line_addr);
        } else {
            // Refill path: the shared levels keep a clean copy.
            if level != FillLevel::L2 {
                self.l2_tags[cluster].fill(line_addr);
            }
            if level == FillLevel::Mem {
                self.l3_tags[bank].fill(line_addr);
            }
        }
        level
    }

    fn service_completions(&mut self) -> Result<(), SimError> {
        let completed: Vec<CompletedAccess> = self.completions.drain(..).collect();
        for done in completed {
            if cfg!(debug_assertions) {
                self.audit()?;
            }
            self.schedule_stream(done.core, self.now + 1);
        }
        Ok(())
    }

    fn schedule_stream(&mut self, core: usize, at: Tick) {
        if let Some(item) = self.streams[core].next_item() {
            self.eventq.push(at, Event::Issue { core, item });
        }
    }

    fn progress(&mut self) {
        self.last_progress = self.now;
    }

    fn outstanding(&self) -> usize {
        let l1: usize = self.l1s.iter().map(|l| l.outstanding()).sum();
        let dir: usize = self.dirs.iter().map(|d| d.outstanding()).sum();
        l1 + dir
    }

    fn check_watchdog(&self) -> Result<(), SimError> {
        let stalled = self.now.saturating_sub(self.last_progress) > self.sim_cfg.deadlock_window;
        if (stalled && self.outstanding() > 0) || self.now > self.sim_cfg.timeout {
            return Err(self.deadlock_error());
        }
        Ok(())
    }

    fn deadlock_error(&self) -> SimError {
        let oldest = self
            .l1s
            .iter()
            .filter_map(|l| l.oldest_transaction())
            .chain(self.dirs.iter().filter_map(|d| d.oldest_transaction()))
            .min_by_key(|&(_, started)| started)
            .map(|(addr, _)| addr)
            .or_else(|| self.fabric.inflight().1)
            .unwrap_or(0);
        SimError::Deadlock {
            tick: self.now,
            last_progress: self.last_progress,
            outstanding: self.outstanding(),
            line_addr: oldest,
        }
    }

    /// At most one writer per line across all L1s, and no sharer while a
    /// writer exists.
    pub fn audit(&self) -> Result<(), SimError> {
        use std::collections::HashMap;
        let mut holders: HashMap<u64, (usize, usize, CtrlId)> = HashMap::new();
        for l1 in &self.l1s {
            for (line_addr, state) in l1.resident() {
                let entry = holders.entry(line_addr).or_insert((0, 0, l1.id));
                match state {
                    CacheState::Exclusive | CacheState::Modified => {
                        entry.0 += 1;
                        entry.2 = l1.id;
                    }
                    CacheState::Shared => entry.1 += 1,
                }
            }
        }
        for (line_addr, (owners, sharers, ctrl)) in holders {
            if owners > 1 || (owners == 1 && sharers > 0) {
                return Err(SimError::ProtocolViolation {
                    tick: self.now,
                    ctrl,
                    line_addr,
                    state: "Owned",
                    event: format!("audit: {owners} owner(s), {sharers} sharer(s)"),
                });
            }
        }
        Ok(())
    }

    fn aggregate_now(&self) -> AggregateStats {
        aggregate(&self.per_core_summaries())
    }

    fn per_core_summaries(&self) -> Vec<CoreSummary> {
        self.l1s
            .iter()
            .map(|l1| CoreSummary {
                core: l1.core,
                cache: l1.stats,
            })
            .collect()
    }

    /// Drain dirty lines, audit, assemble the run summary.
    pub fn finish(&mut self) -> Result<RunSummary, SimError> {
        self.audit()?;
        for core in 0..self.l1s.len() {
            for (line_addr, data) in self.l1s[core].flush_dirty() {
                self.mem.write_line(line_addr, &data);
            }
        }
        if self.anomalies > 0 {
            warn!("{} out-of-range accesses were wrapped", self.anomalies);
        }

        let per_core = self.per_core_summaries();
        let total = aggregate(&per_core);
        info!(
            "done at tick {}: {} loads, {} stores, {} misses",
            self.now, total.loads, total.stores, total.misses
        );
        let summary = RunSummary {
            ticks: self.now,
            wall_ms: self.started.elapsed().as_millis() as u64,
            anomalies: self.anomalies,
            total,
            roi: self.roi.summary.take(),
            per_core,
            dirs: self.dirs.iter().map(|d| d.stats).collect(),
            l2_hubs: self.l2_tags.iter().map(|t| t.stats).collect(),
            l3_banks: self.l3_tags.iter().map(|t| t.stats).collect(),
            fabric: self.fabric.stats.clone(),
            mem: MemSummary {
                reads: self.mem.reads,
                writebacks: self.mem.writebacks,
            },
        };
        if self.sim_cfg.stats {
            stats::write_summary(&summary);
        }
        Ok(summary)
    }
}
