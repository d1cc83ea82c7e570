/*
MESI transition table for the private cache controllers.

The protocol is directory-based with a blocking directory: the directory
serializes transactions per block and only starts the next one after the
current requester sends Unblock.  That discipline removes most of the
classic transient races; any (state, event) pair outside this table is a
protocol violation and fatal.

The table is a pure function from (line state, event) to (next state,
actions).  All side data -- ack counting, data buffering, LRU bookkeeping --
lives in the controller; the event passed in already carries the resolved
predicates (`all_acks`, `last`), so a row never needs to inspect counters.
*/

use smallvec::SmallVec;

use crate::topology::CtrlId;

/// Stable states of a resident line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Shared,
    Exclusive,
    Modified,
}

/// Transient states of an in-flight transaction, one per block at most.
/// Naming follows the usual directory-protocol convention: IS_D is
/// "I going to S, waiting for Data", IM_AD "I to M, waiting for Acks and
/// Data", MI_A "M to I, waiting for PutAck", and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientState {
    IsD,
    ImAd,
    ImA,
    SmAd,
    SmA,
    MiA,
    SiA,
    IiA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Invalid,
    Stable(CacheState),
    Transient(TransientState),
}

impl LineState {
    pub fn name(self) -> &'static str {
        match self {
            LineState::Invalid => "I",
            LineState::Stable(CacheState::Shared) => "S",
            LineState::Stable(CacheState::Exclusive) => "E",
            LineState::Stable(CacheState::Modified) => "M",
            LineState::Transient(TransientState::IsD) => "IS_D",
            LineState::Transient(TransientState::ImAd) => "IM_AD",
            LineState::Transient(TransientState::ImA) => "IM_A",
            LineState::Transient(TransientState::SmAd) => "SM_AD",
            LineState::Transient(TransientState::SmA) => "SM_A",
            LineState::Transient(TransientState::MiA) => "MI_A",
            LineState::Transient(TransientState::SiA) => "SI_A",
            LineState::Transient(TransientState::IiA) => "II_A",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    Load,
    Store,
    /// LRU picked this line as the victim for an incoming fill.
    Replacement,
    FwdGetS { req: CtrlId },
    FwdGetM { req: CtrlId },
    Inv { req: CtrlId },
    /// Data response from the directory.  `all_acks` is true when every
    /// expected InvAck has already arrived (or none were needed).
    DataFromDir { all_acks: bool, exclusive: bool },
    /// Data forwarded directly from the previous owner.
    DataFromOwner,
    /// `last` is true when this ack is the final outstanding one and the
    /// directory data has already arrived.
    InvAck { last: bool },
    PutAck,
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::Load => "Load",
            ProtocolEvent::Store => "Store",
            ProtocolEvent::Replacement => "Replacement",
            ProtocolEvent::FwdGetS { .. } => "FwdGetS",
            ProtocolEvent::FwdGetM { .. } => "FwdGetM",
            ProtocolEvent::Inv { .. } => "Inv",
            ProtocolEvent::DataFromDir { .. } => "Data(dir)",
            ProtocolEvent::DataFromOwner => "Data(owner)",
            ProtocolEvent::InvAck { .. } => "InvAck",
            ProtocolEvent::PutAck => "PutAck",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    /// The access is satisfied in place; no traffic.
    Hit,
    IssueGetS,
    IssueGetM,
    IssuePutS,
    IssuePutM,
    /// Supply the line to the forwarded requester.
    SendDataToReq { req: CtrlId },
    /// Also write the (possibly dirty) line back to the directory, which
    /// commits it to memory before the block goes Shared.
    CopyDataToDir,
    SendInvAck { req: CtrlId },
    /// Transaction finished: install the line in `install` state, apply the
    /// pending access, notify the directory with Unblock.
    Complete { install: CacheState },
    /// Eviction transaction finished; nothing to install.
    EvictDone,
}

pub type Actions = SmallVec<[ProtocolAction; 3]>;

#[derive(Debug)]
pub struct Transition {
    pub next: LineState,
    pub actions: Actions,
}

fn next(next: LineState, actions: &[ProtocolAction]) -> Option<Transition> {
    Some(Transition {
        next,
        actions: SmallVec::from_slice(actions),
    })
}

/// The L1 table.  Returns None for undefined (state, event) pairs, which
/// the controller reports as a fatal ProtocolViolation.
pub fn l1_transition(state: LineState, event: &ProtocolEvent) -> Option<Transition> {
    use CacheState::*;
    use LineState::*;
    use ProtocolAction as A;
    use ProtocolEvent as E;
    use TransientState::*;

    match (state, event) {
        // Miss path out of I.
        (Invalid, E::Load) => next(Transient(IsD), &[A::IssueGetS]),
        (Invalid, E::Store) => next(Transient(ImAd), &[A::IssueGetM]),

        // Shared: read hits, writes upgrade, invalidations ack.
        (Stable(Shared), E::Load) => next(Stable(Shared), &[A::Hit]),
        (Stable(Shared), E::Store) => next(Transient(SmAd), &[A::IssueGetM]),
        (Stable(Shared), E::Replacement) => next(Transient(SiA), &[A::IssuePutS]),
        (Stable(Shared), E::Inv { req }) => next(Invalid, &[A::SendInvAck { req: *req }]),

        // Exclusive: clean ownership, silent upgrade on store.
        (Stable(Exclusive), E::Load) => next(Stable(Exclusive), &[A::Hit]),
        (Stable(Exclusive), E::Store) => next(Stable(Modified), &[A::Hit]),
        (Stable(Exclusive), E::Replacement) => next(Transient(MiA), &[A::IssuePutM]),
        (Stable(Exclusive), E::FwdGetS { req }) => next(
            Stable(Shared),
            &[A::SendDataToReq { req: *req }, A::CopyDataToDir],
        ),
        (Stable(Exclusive), E::FwdGetM { req }) => {
            next(Invalid, &[A::SendDataToReq { req: *req }])
        }

        // Modified: dirty ownership.
        (Stable(Modified), E::Load) => next(Stable(Modified), &[A::Hit]),
        (Stable(Modified), E::Store) => next(Stable(Modified), &[A::Hit]),
        (Stable(Modified), E::Replacement) => next(Transient(MiA), &[A::IssuePutM]),
        (Stable(Modified), E::FwdGetS { req }) => next(
            Stable(Shared),
            &[A::SendDataToReq { req: *req }, A::CopyDataToDir],
        ),
        (Stable(Modified), E::FwdGetM { req }) => {
            next(Invalid, &[A::SendDataToReq { req: *req }])
        }

        // Waiting for a GetS fill.
        (Transient(IsD), E::DataFromDir { exclusive: true, .. }) => {
            next(Stable(Exclusive), &[A::Complete { install: Exclusive }])
        }
        (Transient(IsD), E::DataFromDir { exclusive: false, .. }) => {
            next(Stable(Shared), &[A::Complete { install: Shared }])
        }
        (Transient(IsD), E::DataFromOwner) => {
            next(Stable(Shared), &[A::Complete { install: Shared }])
        }

        // Waiting for a GetM fill plus acks.
        (Transient(ImAd), E::DataFromDir { all_acks: true, .. }) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(ImAd), E::DataFromDir { all_acks: false, .. }) => next(Transient(ImA), &[]),
        (Transient(ImAd), E::DataFromOwner) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(ImAd), E::InvAck { .. }) => next(Transient(ImAd), &[]),
        (Transient(ImA), E::InvAck { last: true }) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(ImA), E::InvAck { last: false }) => next(Transient(ImA), &[]),

        // Store upgrade from S.  Losing the S copy to an earlier GetM is the
        // one legal race the blocking directory leaves open.
        (Transient(SmAd), E::Inv { req }) => {
            next(Transient(ImAd), &[A::SendInvAck { req: *req }])
        }
        (Transient(SmAd), E::DataFromDir { all_acks: true, .. }) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(SmAd), E::DataFromDir { all_acks: false, .. }) => next(Transient(SmA), &[]),
        (Transient(SmAd), E::DataFromOwner) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(SmAd), E::InvAck { .. }) => next(Transient(SmAd), &[]),
        (Transient(SmA), E::InvAck { last: true }) => {
            next(Stable(Modified), &[A::Complete { install: Modified }])
        }
        (Transient(SmA), E::InvAck { last: false }) => next(Transient(SmA), &[]),

        // Evicting an owned line.  A forward can still arrive if the
        // directory granted the block away before seeing our PutM.
        (Transient(MiA), E::PutAck) => next(Invalid, &[A::EvictDone]),
        (Transient(MiA), E::FwdGetS { req }) => next(
            Transient(SiA),
            &[A::SendDataToReq { req: *req }, A::CopyDataToDir],
        ),
        (Transient(MiA), E::FwdGetM { req }) => {
            next(Transient(IiA), &[A::SendDataToReq { req: *req }])
        }

        // Evicting a shared line.
        (Transient(SiA), E::PutAck) => next(Invalid, &[A::EvictDone]),
        (Transient(SiA), E::Inv { req }) => {
            next(Transient(IiA), &[A::SendInvAck { req: *req }])
        }
        (Transient(IiA), E::PutAck) => next(Invalid, &[A::EvictDone]),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CacheState::*;
    use LineState::*;
    use TransientState::*;

    #[test]
    fn load_miss_issues_gets() {
        let t = l1_transition(Invalid, &ProtocolEvent::Load).unwrap();
        assert_eq!(t.next, Transient(IsD));
        assert_eq!(t.actions.as_slice(), &[ProtocolAction::IssueGetS]);
    }

    #[test]
    fn store_in_shared_upgrades() {
        let t = l1_transition(Stable(Shared), &ProtocolEvent::Store).unwrap();
        assert_eq!(t.next, Transient(SmAd));
        assert_eq!(t.actions.as_slice(), &[ProtocolAction::IssueGetM]);
    }

    #[test]
    fn store_in_exclusive_is_a_silent_upgrade() {
        let t = l1_transition(Stable(Exclusive), &ProtocolEvent::Store).unwrap();
        assert_eq!(t.next, Stable(Modified));
        assert_eq!(t.actions.as_slice(), &[ProtocolAction::Hit]);
    }

    #[test]
    fn exclusive_grant_installs_e() {
        let t = l1_transition(
            Transient(IsD),
            &ProtocolEvent::DataFromDir {
                all_acks: true,
                exclusive: true,
            },
        )
        .unwrap();
        assert_eq!(t.next, Stable(Exclusive));
    }

    #[test]
    fn getm_data_with_pending_acks_waits() {
        let t = l1_transition(
            Transient(ImAd),
            &ProtocolEvent::DataFromDir {
                all_acks: false,
                exclusive: false,
            },
        )
        .unwrap();
        assert_eq!(t.next, Transient(ImA));
        assert!(t.actions.is_empty());

        let t = l1_transition(Transient(ImA), &ProtocolEvent::InvAck { last: true }).unwrap();
        assert_eq!(t.next, Stable(Modified));
    }

    #[test]
    fn fwd_gets_downgrades_owner_and_writes_back() {
        let t = l1_transition(Stable(Modified), &ProtocolEvent::FwdGetS { req: 2 }).unwrap();
        assert_eq!(t.next, Stable(Shared));
        assert_eq!(
            t.actions.as_slice(),
            &[
                ProtocolAction::SendDataToReq { req: 2 },
                ProtocolAction::CopyDataToDir
            ]
        );
    }

    #[test]
    fn upgrade_losing_its_copy_falls_back_to_im() {
        let t = l1_transition(Transient(SmAd), &ProtocolEvent::Inv { req: 1 }).unwrap();
        assert_eq!(t.next, Transient(ImAd));
        assert_eq!(t.actions.as_slice(), &[ProtocolAction::SendInvAck { req: 1 }]);
    }

    #[test]
    fn eviction_races_with_forward() {
        let t = l1_transition(Transient(MiA), &ProtocolEvent::FwdGetM { req: 3 }).unwrap();
        assert_eq!(t.next, Transient(IiA));
        let t = l1_transition(Transient(IiA), &ProtocolEvent::PutAck).unwrap();
        assert_eq!(t.next, Invalid);
        assert_eq!(t.actions.as_slice(), &[ProtocolAction::EvictDone]);
    }

    #[test]
    fn undefined_pairs_are_violations() {
        // Blocking directory: a forward can never reach a plain sharer.
        assert!(l1_transition(Stable(Shared), &ProtocolEvent::FwdGetS { req: 0 }).is_none());
        assert!(l1_transition(Invalid, &ProtocolEvent::Inv { req: 0 }).is_none());
        assert!(l1_transition(Transient(IsD), &ProtocolEvent::Inv { req: 0 }).is_none());
    }
}
