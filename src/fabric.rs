/*
Message-passing fabric between coherence controllers.

Every (source, destination) controller pair that the topology connects gets a
Channel: three virtual-network FIFOs (request / forward / response) sharing
the path's latency.  Splitting the lanes per virtual network is what keeps
the protocol deadlock-free: a response can never be stuck behind a request
that is itself waiting on that response.

Delivery is FIFO per (source, destination, vnet) lane even at zero latency:
ready ticks are forced monotone, and the per-lane queue is drained in order.
Across different lanes of one channel a round-robin arbiter picks which ready
head goes first, so no lane can starve another.  A full lane rejects the send
with Backpressure and the sender retries; messages are never dropped.
*/

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use smallvec::SmallVec;

use crate::eventq::Tick;
use crate::topology::CtrlId;

pub type ChannelId = usize;

pub const NUM_VNETS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualNet {
    Request,
    Forward,
    Response,
}

impl VirtualNet {
    pub fn index(self) -> usize {
        match self {
            VirtualNet::Request => 0,
            VirtualNet::Forward => 1,
            VirtualNet::Response => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    GetS,
    GetM,
    PutS,
    PutM,
    FwdGetS,
    FwdGetM,
    Inv,
    InvAck,
    Data,
    PutAck,
    Unblock,
}

impl MsgKind {
    pub fn vnet(self) -> VirtualNet {
        match self {
            MsgKind::GetS | MsgKind::GetM | MsgKind::PutS | MsgKind::PutM => VirtualNet::Request,
            MsgKind::FwdGetS | MsgKind::FwdGetM | MsgKind::Inv => VirtualNet::Forward,
            MsgKind::InvAck | MsgKind::Data | MsgKind::PutAck | MsgKind::Unblock => {
                VirtualNet::Response
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgKind::GetS => "GetS",
            MsgKind::GetM => "GetM",
            MsgKind::PutS => "PutS",
            MsgKind::PutM => "PutM",
            MsgKind::FwdGetS => "FwdGetS",
            MsgKind::FwdGetM => "FwdGetM",
            MsgKind::Inv => "Inv",
            MsgKind::InvAck => "InvAck",
            MsgKind::Data => "Data",
            MsgKind::PutAck => "PutAck",
            MsgKind::Unblock => "Unblock",
        }
    }
}

/// Which level of the shared hierarchy can supply the fill data.  Probed once
/// on the request path and carried in the message so the directory knows what
/// latency to charge for the Data response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillLevel {
    L2,
    L3,
    #[default]
    Mem,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MsgKind,
    pub src: CtrlId,
    pub dst: CtrlId,
    pub line_addr: u64,
    /// Originating requester, for forwards and invalidations that are
    /// answered point-to-point rather than through the directory.
    pub requestor: CtrlId,
    /// Number of InvAcks the requester must collect (Data only).
    pub ack_count: u32,
    /// Data grants exclusive permission (no other sharer existed).
    pub exclusive: bool,
    /// Data supplied by the previous owner rather than the directory.
    pub from_owner: bool,
    pub fill: FillLevel,
    pub data: Option<Box<[u8]>>,
}

impl Message {
    pub fn new(kind: MsgKind, src: CtrlId, dst: CtrlId, line_addr: u64) -> Self {
        Self {
            kind,
            src,
            dst,
            line_addr,
            requestor: src,
            ack_count: 0,
            exclusive: false,
            from_owner: false,
            fill: FillLevel::Mem,
            data: None,
        }
    }

    pub fn with_requestor(mut self, requestor: CtrlId) -> Self {
        self.requestor = requestor;
        self
    }

    pub fn with_data(mut self, data: Box<[u8]>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Reason a send was rejected.  The message is handed back so the caller can
/// park it and retry.
#[derive(Debug)]
pub struct Backpressure {
    pub msg: Message,
    pub vnet: VirtualNet,
    pub capacity: usize,
}

impl Backpressure {
    pub fn into_message(self) -> Message {
        self.msg
    }
}

#[derive(Debug)]
struct Lane {
    queue: VecDeque<(Tick, Message)>,
    last_ready: Tick,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            last_ready: 0,
        }
    }
}

#[derive(Debug)]
struct Channel {
    src: CtrlId,
    dst: CtrlId,
    latency: Tick,
    hops: u32,
    capacity: usize,
    lanes: [Lane; NUM_VNETS],
    next_vnet: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct FabricStats {
    pub sent: [u64; NUM_VNETS],
    pub delivered: [u64; NUM_VNETS],
    pub rejects: u64,
    pub max_lane_occupancy: usize,
}

#[derive(Debug, Default)]
pub struct Fabric {
    channels: Vec<Channel>,
    index: HashMap<(CtrlId, CtrlId), ChannelId>,
    pub stats: FabricStats,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the (src, dst) path with its accumulated hop latency.
    /// Topology construction calls this once per connected pair.
    pub fn add_channel(
        &mut self,
        src: CtrlId,
        dst: CtrlId,
        latency: Tick,
        hops: u32,
        capacity: usize,
    ) -> ChannelId {
        assert!(capacity > 0, "channel capacity must be > 0");
        let id = self.channels.len();
        let prev = self.index.insert((src, dst), id);
        assert!(prev.is_none(), "duplicate channel {}->{}", src, dst);
        self.channels.push(Channel {
            src,
            dst,
            latency,
            hops,
            capacity,
            lanes: [Lane::new(), Lane::new(), Lane::new()],
            next_vnet: 0,
        });
        id
    }

    pub fn channel_for(&self, src: CtrlId, dst: CtrlId) -> Option<ChannelId> {
        self.index.get(&(src, dst)).copied()
    }

    pub fn hops(&self, id: ChannelId) -> u32 {
        self.channels[id].hops
    }

    /// Enqueue `msg` on its (src, dst) channel.  Returns the tick at which it
    /// becomes deliverable, or Backpressure if the lane is full.
    pub fn send(&mut self, now: Tick, msg: Message) -> Result<(Tick, ChannelId), Backpressure> {
        self.send_delayed(now, 0, msg)
    }

    /// Like `send`, but the message only enters the wire after `extra` ticks
    /// (used for memory fetch latency ahead of a Data response).
    pub fn send_delayed(
        &mut self,
        now: Tick,
        extra: Tick,
        msg: Message,
    ) -> Result<(Tick, ChannelId), Backpressure> {
        let id = *self
            .index
            .get(&(msg.src, msg.dst))
            .unwrap_or_else(|| panic!("no channel {}->{}", msg.src, msg.dst));
        let chan = &mut self.channels[id];
        let vnet = msg.kind.vnet();
        let lane = &mut chan.lanes[vnet.index()];

        if lane.queue.len() >= chan.capacity {
            self.stats.rejects += 1;
            return Err(Backpressure {
                msg,
                vnet,
                capacity: chan.capacity,
            });
        }

        // Monotone ready ticks preserve per-lane FIFO order even when a
        // delayed send would otherwise overtake an earlier message.
        let ready = (now + extra + chan.latency).max(lane.last_ready);
        lane.last_ready = ready;
        lane.queue.push_back((ready, msg));
        self.stats.sent[vnet.index()] += 1;
        self.stats.max_lane_occupancy = self.stats.max_lane_occupancy.max(lane.queue.len());
        Ok((ready, id))
    }

    /// Pop every message on `channel` whose ready tick has elapsed.  Lanes
    /// are drained round-robin one message at a time so a busy lane cannot
    /// starve the others.
    pub fn deliver_ready(&mut self, channel: ChannelId, now: Tick) -> SmallVec<[Message; 4]> {
        let chan = &mut self.channels[channel];
        let mut out = SmallVec::new();
        loop {
            let mut progressed = false;
            for _ in 0..NUM_VNETS {
                let vnet = chan.next_vnet;
                chan.next_vnet = (chan.next_vnet + 1) % NUM_VNETS;
                let lane = &mut chan.lanes[vnet];
                if let Some((ready, _)) = lane.queue.front() {
                    if *ready <= now {
                        let (_, msg) = lane.queue.pop_front().unwrap();
                        self.stats.delivered[vnet] += 1;
                        out.push(msg);
                        progressed = true;
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// Total messages still in flight, and the earliest line address among
    /// them (for deadlock diagnostics).
    pub fn inflight(&self) -> (usize, Option<u64>) {
        let mut count = 0;
        let mut oldest: Option<(Tick, u64)> = None;
        for chan in &self.channels {
            for lane in &chan.lanes {
                count += lane.queue.len();
                if let Some((ready, msg)) = lane.queue.front() {
                    if oldest.map_or(true, |(t, _)| *ready < t) {
                        oldest = Some((*ready, msg.line_addr));
                    }
                }
            }
        }
        (count, oldest.map(|(_, addr)| addr))
    }
}
