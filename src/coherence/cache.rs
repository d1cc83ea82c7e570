use std::collections::{HashMap, VecDeque};

use log::{debug, trace};
use serde::Serialize;
use smallvec::SmallVec;

use crate::coherence::protocol::{
    l1_transition, CacheState, LineState, ProtocolAction, ProtocolEvent, TransientState,
};
use crate::error::SimError;
use crate::eventq::Tick;
use crate::fabric::{Message, MsgKind};
use crate::topology::CtrlId;
use crate::workload::{Access, AccessOp};

/// A resident line.  Data is the full line; `dirty` distinguishes M from E
/// at writeback time.
#[derive(Debug)]
pub struct Line {
    pub line_addr: u64,
    pub state: CacheState,
    pub data: Box<[u8]>,
    pub dirty: bool,
}

/// Set-associative array holding resident lines, LRU-ordered per set.
#[derive(Debug)]
pub struct DataArray {
    sets: usize,
    line_bits: u32,
    lines: Vec<Vec<Option<Line>>>,
    lru: Vec<Vec<usize>>,
}

impl DataArray {
    pub fn new(sets: usize, ways: usize, line_size: u64) -> Self {
        let sets = sets.max(1);
        let ways = ways.max(1);
        Self {
            sets,
            line_bits: line_size.trailing_zeros(),
            lines: (0..sets).map(|_| (0..ways).map(|_| None).collect()).collect(),
            lru: (0..sets).map(|_| (0..ways).collect()).collect(),
        }
    }

    fn set_of(&self, line_addr: u64) -> usize {
        ((line_addr >> self.line_bits) as usize) % self.sets
    }

    pub fn get_mut(&mut self, line_addr: u64) -> Option<&mut Line> {
        let set_idx = self.set_of(line_addr);
        let way = self.lines[set_idx]
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |l| l.line_addr == line_addr))?;
        self.touch(set_idx, way);
        self.lines[set_idx][way].as_mut()
    }

    pub fn peek_data(&self, line_addr: u64) -> Option<Box<[u8]>> {
        let set_idx = self.set_of(line_addr);
        self.lines[set_idx]
            .iter()
            .flatten()
            .find(|l| l.line_addr == line_addr)
            .map(|l| l.data.clone())
    }

    pub fn state_of(&self, line_addr: u64) -> LineState {
        let set_idx = self.set_of(line_addr);
        self.lines[set_idx]
            .iter()
            .flatten()
            .find(|l| l.line_addr == line_addr)
            .map_or(LineState::Invalid, |l| LineState::Stable(l.state))
    }

    pub fn remove(&mut self, line_addr: u64) -> Option<Line> {
        let set_idx = self.set_of(line_addr);
        let way = self.lines[set_idx]
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |l| l.line_addr == line_addr))?;
        self.lines[set_idx][way].take()
    }

    pub fn has_free_way(&self, line_addr: u64) -> bool {
        let set_idx = self.set_of(line_addr);
        self.lines[set_idx].iter().any(|slot| slot.is_none())
    }

    /// Least-recently-used resident line of the victim set, skipping lines
    /// the caller marked untouchable (in-flight upgrades).
    pub fn pick_victim(&self, line_addr: u64, skip: impl Fn(u64) -> bool) -> Option<u64> {
        let set_idx = self.set_of(line_addr);
        self.lru[set_idx]
            .iter()
            .rev()
            .filter_map(|&way| self.lines[set_idx][way].as_ref())
            .map(|l| l.line_addr)
            .find(|&addr| !skip(addr))
    }

    /// Install into a free way.  The caller must have made room first.
    pub fn install(&mut self, line: Line) {
        let set_idx = self.set_of(line.line_addr);
        let way = self.lines[set_idx]
            .iter()
            .position(|slot| slot.is_none())
            .expect("install requires a free way");
        self.lines[set_idx][way] = Some(line);
        self.touch(set_idx, way);
    }

    pub fn resident(&self) -> impl Iterator<Item = (u64, CacheState)> + '_ {
        self.lines
            .iter()
            .flatten()
            .flatten()
            .map(|l| (l.line_addr, l.state))
    }

    fn touch(&mut self, set_idx: usize, way: usize) {
        let order = &mut self.lru[set_idx];
        if let Some(pos) = order.iter().position(|&idx| idx == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }
}

/// Tag-only LRU array for the shared L2/L3 levels.  These levels sit on the
/// refill path for latency and hit accounting; MESI ownership lives in the
/// L1s and the directory, so they only ever cache clean lines and are
/// invalidated whenever a block is granted exclusively.
#[derive(Debug)]
pub struct TagArray {
    sets: usize,
    line_bits: u32,
    tags: Vec<Vec<Option<u64>>>,
    lru: Vec<Vec<usize>>,
    pub stats: TagArrayStats,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TagArrayStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl TagArray {
    pub fn new(sets: usize, ways: usize, line_size: u64) -> Self {
        let sets = sets.max(1);
        let ways = ways.max(1);
        Self {
            sets,
            line_bits: line_size.trailing_zeros(),
            tags: (0..sets).map(|_| vec![None; ways]).collect(),
            lru: (0..sets).map(|_| (0..ways).collect()).collect(),
            stats: TagArrayStats::default(),
        }
    }

    fn set_of(&self, line_addr: u64) -> usize {
        ((line_addr >> self.line_bits) as usize) % self.sets
    }

    pub fn probe(&mut self, line_addr: u64) -> bool {
        let set_idx = self.set_of(line_addr);
        if let Some(way) = self.tags[set_idx]
            .iter()
            .position(|tag| *tag == Some(line_addr))
        {
            self.stats.hits += 1;
            self.touch(set_idx, way);
            true
        } else {
            self.stats.misses += 1;
            false
        }
    }

    pub fn fill(&mut self, line_addr: u64) {
        let set_idx = self.set_of(line_addr);
        if let Some(way) = self.tags[set_idx]
            .iter()
            .position(|tag| *tag == Some(line_addr))
        {
            self.touch(set_idx, way);
            return;
        }
        let way = match self.tags[set_idx].iter().position(|tag| tag.is_none()) {
            Some(idx) => idx,
            None => {
                self.stats.evictions += 1;
                *self.lru[set_idx].last().unwrap_or(&0)
            }
        };
        self.tags[set_idx][way] = Some(line_addr);
        self.touch(set_idx, way);
    }

    pub fn invalidate(&mut self, line_addr: u64) {
        let set_idx = self.set_of(line_addr);
        if let Some(way) = self.tags[set_idx]
            .iter()
            .position(|tag| *tag == Some(line_addr))
        {
            self.tags[set_idx][way] = None;
            self.stats.invalidations += 1;
        }
    }

    fn touch(&mut self, set_idx: usize, way: usize) {
        let order = &mut self.lru[set_idx];
        if let Some(pos) = order.iter().position(|&idx| idx == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }
}

/// An in-flight coherence transaction.  At most one per block per
/// controller; a second local access to the block stalls behind it.
#[derive(Debug)]
struct Transaction {
    state: TransientState,
    pending: Option<Access>,
    data: Option<Box<[u8]>>,
    /// Known once the directory Data arrives.
    acks_needed: Option<u32>,
    acks_got: u32,
    started: Tick,
}

impl Transaction {
    fn new(state: TransientState, pending: Option<Access>, started: Tick) -> Self {
        Self {
            state,
            pending,
            data: None,
            acks_needed: None,
            acks_got: 0,
            started,
        }
    }

    fn acks_settled(&self) -> bool {
        self.acks_needed.map_or(false, |need| self.acks_got >= need)
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CacheStats {
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

/// Where an outgoing message should go; the driver resolves `Dir` to the
/// directory bank owning the line address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutDst {
    Dir,
    Ctrl(CtrlId),
}

#[derive(Debug)]
pub struct OutMsg {
    pub kind: MsgKind,
    pub dst: OutDst,
    pub line_addr: u64,
    pub data: Option<Box<[u8]>>,
}

pub type OutMsgs = SmallVec<[OutMsg; 2]>;

/// A CPU access that finished, with the loaded (or stored) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedAccess {
    pub core: usize,
    pub value: u64,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub msgs: OutMsgs,
    pub completed: Option<CompletedAccess>,
    /// The event was not processed (transition budget exhausted); the
    /// caller should wake this controller next tick.
    pub deferred: bool,
}

/// What a CPU-side access produced.
#[derive(Debug)]
pub enum CpuOutcome {
    Hit { value: u64 },
    Miss { msgs: OutMsgs },
    /// The block already has a transaction in flight; retry next tick.
    Blocked,
}

/// Private L1 cache controller: the MESI protocol endpoint for one core.
#[derive(Debug)]
pub struct CacheController {
    pub id: CtrlId,
    pub core: usize,
    line_size: u64,
    array: DataArray,
    transactions: HashMap<u64, Transaction>,
    pend: VecDeque<Message>,
    transitions_per_cycle: u32,
    transitions_this_tick: u32,
    budget_tick: Tick,
    pub stats: CacheStats,
}

impl CacheController {
    pub fn new(
        id: CtrlId,
        core: usize,
        sets: usize,
        ways: usize,
        line_size: u64,
        transitions_per_cycle: u32,
    ) -> Self {
        Self {
            id,
            core,
            line_size,
            array: DataArray::new(sets, ways, line_size),
            transactions: HashMap::new(),
            pend: VecDeque::new(),
            transitions_per_cycle,
            transitions_this_tick: 0,
            budget_tick: 0,
            stats: CacheStats::default(),
        }
    }

    fn effective_state(&self, line_addr: u64) -> LineState {
        match self.transactions.get(&line_addr) {
            Some(tx) => LineState::Transient(tx.state),
            None => self.array.state_of(line_addr),
        }
    }

    pub fn has_transaction(&self, line_addr: u64) -> bool {
        self.transactions.contains_key(&line_addr)
    }

    pub fn outstanding(&self) -> usize {
        self.transactions.len()
    }

    pub fn oldest_transaction(&self) -> Option<(u64, Tick)> {
        self.transactions
            .iter()
            .map(|(&addr, tx)| (addr, tx.started))
            .min_by_key(|&(_, started)| started)
    }

    /// Resident lines and their states, for the single-writer audit.
    pub fn resident(&self) -> impl Iterator<Item = (u64, CacheState)> + '_ {
        self.array.resident()
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        addr & !(self.line_size - 1)
    }

    /// Handle a Load or Store from this controller's core.
    pub fn cpu_access(&mut self, now: Tick, access: Access) -> Result<CpuOutcome, SimError> {
        let line_addr = self.line_addr(access.addr);
        if self.transactions.contains_key(&line_addr) {
            return Ok(CpuOutcome::Blocked);
        }
        // CPU transitions share the per-cycle budget with network events.
        if !self.budget_ok(now) {
            self.stats.deferred_events += 1;
            return Ok(CpuOutcome::Blocked);
        }

        let event = match access.op {
            AccessOp::Load => {
                self.stats.loads += 1;
                ProtocolEvent::Load
            }
            AccessOp::Store => {
                self.stats.stores += 1;
                ProtocolEvent::Store
            }
        };

        let state = self.effective_state(line_addr);
        let transition = match l1_transition(state, &event) {
            Some(t) => t,
            None => return Err(self.violation(now, line_addr, state, event.name())),
        };
        self.stats.transitions += 1;

        if transition.actions.contains(&ProtocolAction::Hit) {
            self.stats.hits += 1;
            let next = match transition.next {
                LineState::Stable(next) => next,
                other => unreachable!("hit lands in a stable state, got {}", other.name()),
            };
            let line = self.array.get_mut(line_addr).expect("hit on absent line");
            line.state = next;
            let value = apply_access(line, &access);
            trace!(
                "l1 {}: {} {:#x} hit in {}",
                self.id,
                event.name(),
                access.addr,
                state.name()
            );
            return Ok(CpuOutcome::Hit {
                value: value.unwrap_or(access.value),
            });
        }

        // Miss path: make room first, then open the transaction.
        self.stats.misses += 1;
        let mut msgs = OutMsgs::new();
        if state == LineState::Invalid && !self.array.has_free_way(line_addr) {
            self.evict_for(now, line_addr, &mut msgs)?;
        }

        let next = match transition.next {
            LineState::Transient(t) => t,
            other => unreachable!("miss must enter a transient state, got {}", other.name()),
        };
        self.transactions
            .insert(line_addr, Transaction::new(next, Some(access), now));
        for action in &transition.actions {
            self.emit(action, line_addr, None, &mut msgs);
        }
        debug!(
            "l1 {}: {} {:#x} miss, {} -> {}",
            self.id,
            event.name(),
            access.addr,
            state.name(),
            LineState::Transient(next).name()
        );
        Ok(CpuOutcome::Miss { msgs })
    }

    /// Victimize the LRU line of the target set.  Opens an eviction
    /// transaction for the victim; the freed frame is available at once.
    fn evict_for(&mut self, now: Tick, incoming: u64, msgs: &mut OutMsgs) -> Result<(), SimError> {
        let txs = &self.transactions;
        let victim_addr = self
            .array
            .pick_victim(incoming, |addr| txs.contains_key(&addr))
            .expect("full set must hold a victimizable line");
        let state = self.array.state_of(victim_addr);
        let transition = match l1_transition(state, &ProtocolEvent::Replacement) {
            Some(t) => t,
            None => return Err(self.violation(now, victim_addr, state, "Replacement")),
        };
        self.stats.transitions += 1;
        self.stats.evictions += 1;

        let victim = self.array.remove(victim_addr).expect("victim resident");
        let next = match transition.next {
            LineState::Transient(t) => t,
            other => unreachable!("replacement enters a transient state, got {}", other.name()),
        };
        let mut tx = Transaction::new(next, None, now);
        tx.data = Some(victim.data);
        self.transactions.insert(victim_addr, tx);
        for action in &transition.actions {
            self.emit(action, victim_addr, None, msgs);
        }
        Ok(())
    }

    /// Handle a protocol message from the fabric.
    pub fn handle_message(&mut self, now: Tick, msg: Message) -> Result<Outcome, SimError> {
        if !self.budget_ok(now) {
            self.stats.deferred_events += 1;
            self.pend.push_back(msg);
            return Ok(Outcome {
                deferred: true,
                ..Outcome::default()
            });
        }
        self.process_message(now, msg)
    }

    /// Re-run events parked by the transition budget.  Returns one outcome
    /// per processed message; stops when the budget runs out again.
    pub fn drain(&mut self, now: Tick) -> Result<Vec<Outcome>, SimError> {
        let mut outcomes = Vec::new();
        while !self.pend.is_empty() && self.budget_ok(now) {
            let msg = self.pend.pop_front().expect("pend nonempty");
            outcomes.push(self.process_message(now, msg)?);
        }
        if !self.pend.is_empty() {
            outcomes.push(Outcome {
                deferred: true,
                ..Outcome::default()
            });
        }
        Ok(outcomes)
    }

    fn budget_ok(&mut self, now: Tick) -> bool {
        if self.transitions_per_cycle == 0 {
            return true;
        }
        if now != self.budget_tick {
            self.budget_tick = now;
            self.transitions_this_tick = 0;
        }
        if self.transitions_this_tick < self.transitions_per_cycle {
            self.transitions_this_tick += 1;
            true
        } else {
            false
        }
    }

    fn process_message(&mut self, now: Tick, msg: Message) -> Result<Outcome, SimError> {
        let line_addr = msg.line_addr;
        let state = self.effective_state(line_addr);

        // Resolve the counter-dependent predicates before consulting the
        // table, so the table itself stays pure.
        let event = match msg.kind {
            MsgKind::FwdGetS => {
                self.stats.downgrades_rx += 1;
                ProtocolEvent::FwdGetS { req: msg.requestor }
            }
            MsgKind::FwdGetM => {
                self.stats.invalidations_rx += 1;
                ProtocolEvent::FwdGetM { req: msg.requestor }
            }
            MsgKind::Inv => {
                self.stats.invalidations_rx += 1;
                ProtocolEvent::Inv { req: msg.requestor }
            }
            MsgKind::PutAck => ProtocolEvent::PutAck,
            MsgKind::Data if msg.from_owner => {
                let tx = match self.transactions.get_mut(&line_addr) {
                    Some(tx) => tx,
                    None => return Err(self.violation(now, line_addr, state, "Data(owner)")),
                };
                tx.acks_needed = Some(0);
                tx.data = msg.data.clone();
                ProtocolEvent::DataFromOwner
            }
            MsgKind::Data => {
                let tx = match self.transactions.get_mut(&line_addr) {
                    Some(tx) => tx,
                    None => return Err(self.violation(now, line_addr, state, "Data(dir)")),
                };
                tx.acks_needed = Some(msg.ack_count);
                tx.data = msg.data.clone();
                ProtocolEvent::DataFromDir {
                    all_acks: tx.acks_settled(),
                    exclusive: msg.exclusive,
                }
            }
            MsgKind::InvAck => {
                let tx = match self.transactions.get_mut(&line_addr) {
                    Some(tx) => tx,
                    None => return Err(self.violation(now, line_addr, state, "InvAck")),
                };
                tx.acks_got += 1;
                ProtocolEvent::InvAck {
                    last: tx.acks_settled(),
                }
            }
            other => return Err(self.violation(now, line_addr, state, other.name())),
        };

        let transition = match l1_transition(state, &event) {
            Some(t) => t,
            None => return Err(self.violation(now, line_addr, state, event.name())),
        };
        self.stats.transitions += 1;
        trace!(
            "l1 {}: {} {:#x}: {} -> {}",
            self.id,
            event.name(),
            line_addr,
            state.name(),
            transition.next.name()
        );

        // Snapshot the line before any state mutation: forward responses
        // must carry the pre-transition data.
        let snapshot = self.line_data(line_addr);

        // Invalidation drops the resident copy whatever state the block
        // is in.
        if matches!(event, ProtocolEvent::Inv { .. }) {
            let _ = self.array.remove(line_addr);
        }

        match transition.next {
            LineState::Transient(next) => {
                let tx = self
                    .transactions
                    .entry(line_addr)
                    .or_insert_with(|| Transaction::new(next, None, now));
                tx.state = next;
            }
            LineState::Stable(next) => {
                // Stable-to-stable moves (forward downgrades) act on the
                // resident line directly; fills go through Complete.
                if !self.transactions.contains_key(&line_addr) {
                    if let Some(line) = self.array.get_mut(line_addr) {
                        line.state = next;
                        if next == CacheState::Shared {
                            line.dirty = false;
                        }
                    }
                }
            }
            LineState::Invalid => {
                if !self.transactions.contains_key(&line_addr) {
                    let _ = self.array.remove(line_addr);
                }
            }
        }

        let mut outcome = Outcome::default();
        for action in &transition.actions {
            if let ProtocolAction::Complete { install } = *action {
                outcome.completed = Some(self.complete(now, line_addr, install, &mut outcome.msgs)?);
            } else {
                self.emit(action, line_addr, snapshot.as_deref(), &mut outcome.msgs);
            }
        }
        Ok(outcome)
    }

    fn emit(
        &mut self,
        action: &ProtocolAction,
        line_addr: u64,
        snapshot: Option<&[u8]>,
        msgs: &mut OutMsgs,
    ) {
        match *action {
            ProtocolAction::Hit | ProtocolAction::Complete { .. } => {
                unreachable!("handled by the caller")
            }
            ProtocolAction::IssueGetS => msgs.push(OutMsg {
                kind: MsgKind::GetS,
                dst: OutDst::Dir,
                line_addr,
                data: None,
            }),
            ProtocolAction::IssueGetM => msgs.push(OutMsg {
                kind: MsgKind::GetM,
                dst: OutDst::Dir,
                line_addr,
                data: None,
            }),
            ProtocolAction::IssuePutS => msgs.push(OutMsg {
                kind: MsgKind::PutS,
                dst: OutDst::Dir,
                line_addr,
                data: None,
            }),
            ProtocolAction::IssuePutM => {
                self.stats.writebacks += 1;
                let data = self
                    .transactions
                    .get(&line_addr)
                    .and_then(|tx| tx.data.clone());
                msgs.push(OutMsg {
                    kind: MsgKind::PutM,
                    dst: OutDst::Dir,
                    line_addr,
                    data,
                });
            }
            ProtocolAction::SendDataToReq { req } => msgs.push(OutMsg {
                kind: MsgKind::Data,
                dst: OutDst::Ctrl(req),
                line_addr,
                data: snapshot.map(Box::from),
            }),
            ProtocolAction::CopyDataToDir => msgs.push(OutMsg {
                kind: MsgKind::Data,
                dst: OutDst::Dir,
                line_addr,
                data: snapshot.map(Box::from),
            }),
            ProtocolAction::SendInvAck { req } => msgs.push(OutMsg {
                kind: MsgKind::InvAck,
                dst: OutDst::Ctrl(req),
                line_addr,
                data: None,
            }),
            ProtocolAction::EvictDone => {
                let _ = self.transactions.remove(&line_addr);
            }
        }
    }

    /// Install the fill, apply the stalled access, release the directory.
    fn complete(
        &mut self,
        now: Tick,
        line_addr: u64,
        install: CacheState,
        msgs: &mut OutMsgs,
    ) -> Result<CompletedAccess, SimError> {
        let tx = self
            .transactions
            .remove(&line_addr)
            .expect("completing transaction exists");
        let data = tx
            .data
            .unwrap_or_else(|| vec![0u8; self.line_size as usize].into_boxed_slice());

        if self.array.state_of(line_addr) == LineState::Invalid {
            // The frame freed at miss time may have been taken by a later
            // fill to the same set; make room again if so.
            if !self.array.has_free_way(line_addr) {
                self.evict_for(now, line_addr, msgs)?;
            }
            self.array.install(Line {
                line_addr,
                state: install,
                data,
                dirty: false,
            });
        } else {
            // An upgrade still holding its S copy refreshes in place.
            let line = self.array.get_mut(line_addr).expect("resident line");
            line.state = install;
            line.data = data;
        }

        let access = tx.pending.expect("fill transaction has a pending access");
        let line = self.array.get_mut(line_addr).expect("just installed");
        let value = apply_access(line, &access).unwrap_or(access.value);

        msgs.push(OutMsg {
            kind: MsgKind::Unblock,
            dst: OutDst::Dir,
            line_addr,
            data: None,
        });
        Ok(CompletedAccess {
            core: self.core,
            value,
        })
    }

    fn line_data(&self, line_addr: u64) -> Option<Box<[u8]>> {
        self.array.peek_data(line_addr).or_else(|| {
            self.transactions
                .get(&line_addr)
                .and_then(|tx| tx.data.clone())
        })
    }

    /// Flush every dirty resident line at end of simulation.  Returns the
    /// (line_addr, data) writebacks for the driver to commit to memory.
    pub fn flush_dirty(&mut self) -> Vec<(u64, Box<[u8]>)> {
        let dirty_addrs: Vec<u64> = self
            .array
            .resident()
            .filter(|&(_, state)| state == CacheState::Modified)
            .map(|(addr, _)| addr)
            .collect();
        let mut out = Vec::new();
        for addr in dirty_addrs {
            if let Some(line) = self.array.remove(addr) {
                self.stats.writebacks += 1;
                out.push((addr, line.data));
            }
        }
        out
    }

    fn violation(&self, tick: Tick, line_addr: u64, state: LineState, event: &str) -> SimError {
        SimError::ProtocolViolation {
            tick,
            ctrl: self.id,
            line_addr,
            state: state.name(),
            event: event.to_string(),
        }
    }
}

fn apply_access(line: &mut Line, access: &Access) -> Option<u64> {
    let line_size = line.data.len() as u64;
    let offset = (access.addr & (line_size - 1)) as usize;
    let size = (access.size as usize).min(8).min(line.data.len() - offset);
    match access.op {
        AccessOp::Load => {
            let mut buf = [0u8; 8];
            buf[..size].copy_from_slice(&line.data[offset..offset + size]);
            Some(u64::from_le_bytes(buf))
        }
        AccessOp::Store => {
            line.data[offset..offset + size].copy_from_slice(&access.value.to_le_bytes()[..size]);
            line.dirty = true;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(addr: u64) -> Access {
        Access {
            addr,
            size: 8,
            value: 0,
            op: AccessOp::Load,
        }
    }

    #[test]
    fn cpu_transitions_consume_the_cycle_budget() {
        let mut l1 = CacheController::new(0, 0, 128, 4, 64, 1);
        assert!(matches!(
            l1.cpu_access(5, load(0x40)).unwrap(),
            CpuOutcome::Miss { .. }
        ));
        // Second access in the same cycle exceeds the budget of one.
        assert!(matches!(
            l1.cpu_access(5, load(0x80)).unwrap(),
            CpuOutcome::Blocked
        ));
        assert_eq!(l1.stats.deferred_events, 1);
        // The budget refills on the next tick.
        assert!(matches!(
            l1.cpu_access(6, load(0x80)).unwrap(),
            CpuOutcome::Miss { .. }
        ));
    }

    #[test]
    fn zero_budget_means_unlimited() {
        let mut l1 = CacheController::new(0, 0, 128, 4, 64, 0);
        for i in 0..16u64 {
            assert!(matches!(
                l1.cpu_access(1, load(i * 0x40)).unwrap(),
                CpuOutcome::Miss { .. }
            ));
        }
        assert_eq!(l1.stats.deferred_events, 0);
    }
}
