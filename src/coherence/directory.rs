use std::collections::{HashMap, VecDeque};

use log::{debug, trace};
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::SimError;
use crate::eventq::Tick;
use crate::fabric::{FillLevel, Message, MsgKind};
use crate::mem::MainMemory;
use crate::topology::CtrlId;

/// Stable directory-side state of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DirState {
    Uncached,
    Shared { sharers: SmallVec<[CtrlId; 8]> },
    /// One cache holds the block in E or M; the directory does not track
    /// which, the owner tells it at writeback time.
    Owned { owner: CtrlId },
}

impl DirState {
    fn name(&self) -> &'static str {
        match self {
            DirState::Uncached => "Uncached",
            DirState::Shared { .. } => "Shared",
            DirState::Owned { .. } => "Owned",
        }
    }
}

/// In-flight transaction on a block.  The directory is blocking: while a
/// transaction is open, new requests for the block queue here and the next
/// one starts only after completion.
#[derive(Debug)]
struct Busy {
    next: DirState,
    /// Still waiting for the old owner's data copy (FwdGetS path).
    need_data: bool,
    /// Still waiting for the requester's Unblock.
    need_unblock: bool,
    started: Tick,
    queue: VecDeque<Message>,
}

#[derive(Debug)]
struct Entry {
    state: DirState,
    busy: Option<Busy>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: DirState::Uncached,
            busy: None,
        }
    }
}

/// Latency charged for a Data fill, by the hierarchy level that can supply
/// it.  The requester probed the shared levels on the way in and recorded
/// the answer in the message.
#[derive(Debug, Clone, Copy)]
pub struct FillLatency {
    pub l2: Tick,
    pub l3: Tick,
    pub mem: Tick,
}

impl FillLatency {
    fn for_level(&self, level: FillLevel) -> Tick {
        match level {
            FillLevel::L2 => self.l2,
            FillLevel::L3 => self.l3,
            FillLevel::Mem => self.mem,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DirStats {
    pub gets: u64,
    pub getm: u64,
    pub puts: u64,
    pub putm: u64,
    pub stale_puts: u64,
    pub forwards: u64,
    pub invalidations: u64,
    pub queued: u64,
    pub transitions: u64,
    pub deferred_events: u64,
}

/// An outgoing directory message and the extra delay (memory or shared-cache
/// fill latency) it should spend before entering the wire.
#[derive(Debug)]
pub struct DirOut {
    pub msg: Message,
    pub extra: Tick,
}

pub type DirOuts = SmallVec<[DirOut; 4]>;

/// One directory bank.  Owns the coherence state for the line addresses the
/// topology maps to it and serializes transactions per block.
#[derive(Debug)]
pub struct DirectoryController {
    pub id: CtrlId,
    entries: HashMap<u64, Entry>,
    fill: FillLatency,
    pend: VecDeque<Message>,
    transitions_per_cycle: u32,
    transitions_this_tick: u32,
    budget_tick: Tick,
    pub stats: DirStats,
}

impl DirectoryController {
    pub fn new(id: CtrlId, fill: FillLatency, transitions_per_cycle: u32) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            fill,
            pend: VecDeque::new(),
            transitions_per_cycle,
            transitions_this_tick: 0,
            budget_tick: 0,
            stats: DirStats::default(),
        }
    }

    /// Open transactions, for deadlock diagnostics.
    pub fn outstanding(&self) -> usize {
        self.entries.values().filter(|e| e.busy.is_some()).count()
    }

    pub fn oldest_transaction(&self) -> Option<(u64, Tick)> {
        self.entries
            .iter()
            .filter_map(|(&addr, e)| e.busy.as_ref().map(|b| (addr, b.started)))
            .min_by_key(|&(_, started)| started)
    }

    /// Handle one protocol message.  Returns the outgoing messages; the
    /// caller forwards each through the fabric with its extra delay.
    /// `deferred` in the result means the transition budget ran out and the
    /// caller should wake this bank next tick.
    pub fn handle_message(
        &mut self,
        now: Tick,
        msg: Message,
        mem: &mut MainMemory,
    ) -> Result<(DirOuts, bool), SimError> {
        if !self.budget_ok(now) {
            self.stats.deferred_events += 1;
            self.pend.push_back(msg);
            return Ok((DirOuts::new(), true));
        }
        let outs = self.process(now, msg, mem)?;
        Ok((outs, false))
    }

    pub fn drain(&mut self, now: Tick, mem: &mut MainMemory) -> Result<(DirOuts, bool), SimError> {
        let mut outs = DirOuts::new();
        while !self.pend.is_empty() && self.budget_ok(now) {
            let msg = self.pend.pop_front().expect("pend nonempty");
            outs.extend(self.process(now, msg, mem)?);
        }
        Ok((outs, !self.pend.is_empty()))
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

    fn process(
        &mut self,
        now: Tick,
        msg: Message,
        mem: &mut MainMemory,
    ) -> Result<DirOuts, SimError> {
        let line_addr = msg.line_addr;
        let entry = self.entries.entry(line_addr).or_insert_with(Entry::new);

        // Unblock and the owner's data copy belong to the open transaction;
        // everything else queues behind it.
        if entry.busy.is_some() {
            match msg.kind {
                MsgKind::Unblock | MsgKind::Data => {}
                _ => {
                    self.stats.queued += 1;
                    trace!(
                        "dir {}: queue {} {:#x} behind open transaction",
                        self.id,
                        msg.kind.name(),
                        line_addr
                    );
                    entry
                        .busy
                        .as_mut()
                        .expect("checked busy")
                        .queue
                        .push_back(msg);
                    return Ok(DirOuts::new());
                }
            }
        }

        self.stats.transitions += 1;
        let mut outs = DirOuts::new();
        self.step(now, msg, mem, &mut outs)?;
        Ok(outs)
    }

    fn step(
        &mut self,
        now: Tick,
        msg: Message,
        mem: &mut MainMemory,
        outs: &mut DirOuts,
    ) -> Result<(), SimError> {
        let line_addr = msg.line_addr;
        let req = msg.src;
        let entry = self.entries.entry(line_addr).or_insert_with(Entry::new);
        trace!(
            "dir {}: {} {:#x} from {} in {}",
            self.id,
            msg.kind.name(),
            line_addr,
            req,
            entry.state.name()
        );

        match msg.kind {
            MsgKind::GetS => {
                self.stats.gets += 1;
                match entry.state.clone() {
                    DirState::Uncached => {
                        // Sole requester: grant E so a following store stays
                        // silent.
                        let data = mem.read_line(line_addr);
                        entry.busy = Some(Busy {
                            next: DirState::Owned { owner: req },
                            need_data: false,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.data_out(req, line_addr, data, 0, true, msg.fill));
                    }
                    DirState::Shared { mut sharers } => {
                        let data = mem.read_line(line_addr);
                        if !sharers.contains(&req) {
                            sharers.push(req);
                        }
                        entry.busy = Some(Busy {
                            next: DirState::Shared { sharers },
                            need_data: false,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.data_out(req, line_addr, data, 0, false, msg.fill));
                    }
                    DirState::Owned { owner } => {
                        // Owner supplies the data and copies it back here so
                        // memory is current before the block goes Shared.
                        self.stats.forwards += 1;
                        let mut sharers: SmallVec<[CtrlId; 8]> = SmallVec::new();
                        sharers.push(owner);
                        sharers.push(req);
                        entry.busy = Some(Busy {
                            next: DirState::Shared { sharers },
                            need_data: true,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.fwd_out(MsgKind::FwdGetS, owner, req, line_addr));
                    }
                }
            }

            MsgKind::GetM => {
                self.stats.getm += 1;
                match entry.state.clone() {
                    DirState::Uncached => {
                        let data = mem.read_line(line_addr);
                        entry.busy = Some(Busy {
                            next: DirState::Owned { owner: req },
                            need_data: false,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.data_out(req, line_addr, data, 0, false, msg.fill));
                    }
                    DirState::Shared { sharers } => {
                        let others: SmallVec<[CtrlId; 8]> =
                            sharers.iter().copied().filter(|&s| s != req).collect();
                        let data = mem.read_line(line_addr);
                        entry.busy = Some(Busy {
                            next: DirState::Owned { owner: req },
                            need_data: false,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.data_out(
                            req,
                            line_addr,
                            data,
                            others.len() as u32,
                            false,
                            msg.fill,
                        ));
                        for sharer in others {
                            self.stats.invalidations += 1;
                            outs.push(self.fwd_out(MsgKind::Inv, sharer, req, line_addr));
                        }
                    }
                    DirState::Owned { owner } => {
                        if owner == req {
                            return Err(self.violation(now, line_addr, "Owned", "GetM(owner)"));
                        }
                        self.stats.forwards += 1;
                        entry.busy = Some(Busy {
                            next: DirState::Owned { owner: req },
                            need_data: false,
                            need_unblock: true,
                            started: now,
                            queue: VecDeque::new(),
                        });
                        outs.push(self.fwd_out(MsgKind::FwdGetM, owner, req, line_addr));
                    }
                }
            }

            MsgKind::PutS => {
                self.stats.puts += 1;
                match &mut entry.state {
                    DirState::Shared { sharers } if sharers.contains(&req) => {
                        sharers.retain(|&mut s| s != req);
                        if sharers.is_empty() {
                            entry.state = DirState::Uncached;
                        }
                    }
                    // Stale: the copy was already invalidated by a racing
                    // GetM before this PutS arrived.
                    _ => self.stats.stale_puts += 1,
                }
                outs.push(self.put_ack(req, line_addr));
            }

            MsgKind::PutM => {
                self.stats.putm += 1;
                match entry.state.clone() {
                    DirState::Owned { owner } if owner == req => {
                        if let Some(data) = &msg.data {
                            mem.write_line(line_addr, data);
                        }
                        entry.state = DirState::Uncached;
                    }
                    // Stale: ownership moved before this PutM arrived; the
                    // data in it is outdated and must not be committed.
                    _ => {
                        self.stats.stale_puts += 1;
                        if let DirState::Shared { sharers } = &mut entry.state {
                            sharers.retain(|&mut s| s != req);
                            if sharers.is_empty() {
                                entry.state = DirState::Uncached;
                            }
                        }
                    }
                }
                outs.push(self.put_ack(req, line_addr));
            }

            MsgKind::Data => {
                // Owner's copy-back on the FwdGetS path.
                let busy = match entry.busy.as_mut() {
                    Some(b) if b.need_data => b,
                    _ => {
                        let state = entry.state.name();
                        return Err(self.violation(now, line_addr, state, "Data"));
                    }
                };
                if let Some(data) = &msg.data {
                    mem.write_line(line_addr, data);
                }
                busy.need_data = false;
                self.maybe_complete(now, line_addr, mem, outs)?;
            }

            MsgKind::Unblock => {
                let busy = match entry.busy.as_mut() {
                    Some(b) if b.need_unblock => b,
                    _ => {
                        let state = entry.state.name();
                        return Err(self.violation(now, line_addr, state, "Unblock"));
                    }
                };
                busy.need_unblock = false;
                self.maybe_complete(now, line_addr, mem, outs)?;
            }

            other => {
                let state = entry.state.name();
                return Err(self.violation(now, line_addr, state, other.name()));
            }
        }
        Ok(())
    }

    /// If the open transaction has everything it was waiting for, commit its
    /// target state and start the next queued request.
    fn maybe_complete(
        &mut self,
        now: Tick,
        line_addr: u64,
        mem: &mut MainMemory,
        outs: &mut DirOuts,
    ) -> Result<(), SimError> {
        let entry = self.entries.entry(line_addr).or_insert_with(Entry::new);
        let done = entry
            .busy
            .as_ref()
            .map_or(false, |b| !b.need_data && !b.need_unblock);
        if !done {
            return Ok(());
        }
        let busy = entry.busy.take().expect("checked busy");
        entry.state = busy.next;
        debug!(
            "dir {}: {:#x} transaction done, now {}",
            self.id,
            line_addr,
            entry.state.name()
        );

        let mut waiting = busy.queue;
        while let Some(queued) = waiting.pop_front() {
            self.stats.transitions += 1;
            self.step(now, queued, mem, outs)?;
            let entry = self.entries.entry(line_addr).or_insert_with(Entry::new);
            if let Some(busy) = entry.busy.as_mut() {
                // A new transaction opened; the rest keep waiting behind it.
                busy.queue = waiting;
                break;
            }
        }
        Ok(())
    }

    fn data_out(
        &self,
        dst: CtrlId,
        line_addr: u64,
        data: Box<[u8]>,
        ack_count: u32,
        exclusive: bool,
        fill: FillLevel,
    ) -> DirOut {
        let mut msg = Message::new(MsgKind::Data, self.id, dst, line_addr).with_data(data);
        msg.ack_count = ack_count;
        msg.exclusive = exclusive;
        DirOut {
            msg,
            extra: self.fill.for_level(fill),
        }
    }

    fn fwd_out(&self, kind: MsgKind, dst: CtrlId, requestor: CtrlId, line_addr: u64) -> DirOut {
        DirOut {
            msg: Message::new(kind, self.id, dst, line_addr).with_requestor(requestor),
            extra: 0,
        }
    }

    fn put_ack(&self, dst: CtrlId, line_addr: u64) -> DirOut {
        DirOut {
            msg: Message::new(MsgKind::PutAck, self.id, dst, line_addr),
            extra: 0,
        }
    }

    fn violation(&self, tick: Tick, line_addr: u64, state: &'static str, event: &str) -> SimError {
        SimError::ProtocolViolation {
            tick,
            ctrl: self.id,
            line_addr,
            state,
            event: event.to_string(),
        }
    }
}
