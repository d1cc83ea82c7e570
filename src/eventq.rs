/*
Event queue for the discrete-event core.

All forward progress in the simulator happens by popping the earliest pending
event and dispatching it to its target component.  There is no fixed timestep:
logical time jumps straight to the tick of the next event.  Events scheduled
for the same tick dispatch in insertion order (a monotonically increasing
sequence number breaks ties), which keeps runs deterministic regardless of the
heap's internal layout.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type Tick = u64;

use crate::fabric::ChannelId;
use crate::topology::CtrlId;
use crate::workload::WorkItem;

/// A scheduled unit of work.
#[derive(Debug, Clone)]
pub enum Event {
    /// The per-core workload stream has an item ready to issue.
    Issue { core: usize, item: WorkItem },
    /// A fabric channel may have messages whose latency has elapsed.
    Deliver { channel: ChannelId },
    /// A controller deferred work (transition budget or full buffer) and
    /// asked to be re-run.
    Wake { ctrl: CtrlId },
}

#[derive(Debug)]
struct Scheduled {
    tick: Tick,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the earliest tick first.
        other
            .tick
            .cmp(&self.tick)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tick: Tick, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { tick, seq, event });
    }

    pub fn pop(&mut self) -> Option<(Tick, Event)> {
        self.heap.pop().map(|s| (s.tick, s.event))
    }

    pub fn peek_tick(&self) -> Option<Tick> {
        self.heap.peek().map(|s| s.tick)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wake(ctrl: usize) -> Event {
        Event::Wake { ctrl }
    }

    #[test]
    fn pops_in_tick_order() {
        let mut q = EventQueue::new();
        q.push(30, wake(0));
        q.push(10, wake(1));
        q.push(20, wake(2));
        let ticks: Vec<Tick> = std::iter::from_fn(|| q.pop()).map(|(t, _)| t).collect();
        assert_eq!(ticks, vec![10, 20, 30]);
    }

    #[test]
    fn same_tick_preserves_insertion_order() {
        let mut q = EventQueue::new();
        for i in 0..8 {
            q.push(5, wake(i));
        }
        let mut seen = Vec::new();
        while let Some((tick, Event::Wake { ctrl })) = q.pop() {
            assert_eq!(tick, 5);
            seen.push(ctrl);
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn peek_tick_matches_next_pop() {
        let mut q = EventQueue::new();
        q.push(42, wake(0));
        q.push(7, wake(1));
        assert_eq!(q.peek_tick(), Some(7));
        let (tick, _) = q.pop().unwrap();
        assert_eq!(tick, 7);
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut q = EventQueue::new();
        assert!(q.is_empty());
        assert!(q.pop().is_none());
        assert_eq!(q.peek_tick(), None);
    }
}
