// Lock-resolution sweep.
//
// After a bid or skip vote, check whether anyone other than the leader can
// still afford the next legal bid. If nobody can, the outcome is settled and
// the slot is finalized immediately instead of waiting out the countdown.
//
// The check reads outside any transaction, so it may act on stale state. The
// finalize it issues names the slot it observed, which turns a stale trigger
// into a no-op rather than a resolution of the wrong player.

use tracing::debug;

use crate::engine::{AuctionEngine, FinalizeOptions, FinalizeOutcome};
use crate::error::AuctionResult;
use crate::model::{AuctionDocument, AuctionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepDecision {
    /// No leader, paused, or not live.
    Idle,
    /// At least one other participant can still outbid the leader.
    Contested,
    /// Nobody can outbid the leader on this slot.
    Locked { slot_key: String },
}

/// Decide from one read of the document group whether bidding is moot.
pub fn evaluate(doc: &AuctionDocument) -> SweepDecision {
    let auction = &doc.auction;
    if auction.status != AuctionStatus::Live || auction.is_paused {
        return SweepDecision::Idle;
    }
    let (Some(bid), Some(slot)) = (&auction.active_bid, auction.active_slot()) else {
        return SweepDecision::Idle;
    };

    let minimum = auction.minimum_bid(&slot);
    let contested = doc
        .participants
        .values()
        .filter(|p| p.id != bid.bidder_id)
        .any(|p| p.can_afford(minimum));

    if contested {
        SweepDecision::Contested
    } else {
        SweepDecision::Locked { slot_key: slot.key }
    }
}

/// Read the latest state and finalize the active slot if it is locked.
/// Returns the finalize outcome when one was attempted.
pub fn lock_resolution_sweep(
    engine: &AuctionEngine,
    auction_id: &str,
) -> AuctionResult<Option<FinalizeOutcome>> {
    let snapshot = engine.snapshot(auction_id)?;
    match evaluate(&snapshot.document) {
        SweepDecision::Locked { slot_key } => {
            debug!(
                "Slot {} in auction {} is locked; finalizing early",
                slot_key, auction_id
            );
            let outcome =
                engine.finalize_current_player(auction_id, FinalizeOptions::for_slot(&slot_key))?;
            Ok(Some(outcome))
        }
        SweepDecision::Idle | SweepDecision::Contested => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::model::test_support::{sample_auction, t0};
    use crate::model::{ActiveBid, Category, CategoryLabel, Participant, Role};

    /// Live auction on one player priced 10, with p1 leading at `amount`.
    fn live_doc(amount: u32, others_budget: u32) -> AuctionDocument {
        let mut auction = sample_auction(vec![Category {
            label: CategoryLabel::A,
            base_price: 10,
            players: vec!["X".into()],
        }]);
        auction.status = AuctionStatus::Live;
        auction.current_player_index = Some(0);
        auction.active_bid = Some(ActiveBid {
            amount,
            bidder_id: "p1".into(),
            bidder_name: "One".into(),
        });

        let mut participants = BTreeMap::new();
        for (seq, id) in ["p1", "p2", "p3"].into_iter().enumerate() {
            let mut p = Participant::new(id, id, Role::Player, t0(), seq as u64, &auction);
            if id != "p1" {
                p.budget_remaining = others_budget;
            }
            participants.insert(id.to_string(), p);
        }
        AuctionDocument {
            auction,
            participants,
        }
    }

    #[test]
    fn contested_while_someone_can_outbid() {
        // players_per_team 3 reserves 2: 50 - 2 = 48 >= 21.
        assert_eq!(evaluate(&live_doc(20, 50)), SweepDecision::Contested);
    }

    #[test]
    fn locked_when_nobody_else_can_reach_the_minimum() {
        // 22 - 2 reserved = 20 < 21.
        assert_eq!(
            evaluate(&live_doc(20, 22)),
            SweepDecision::Locked {
                slot_key: "A-0".into()
            }
        );
    }

    #[test]
    fn full_rosters_cannot_outbid() {
        let mut doc = live_doc(20, 100);
        for p in doc.participants.values_mut() {
            p.players_needed = 0;
        }
        assert!(matches!(evaluate(&doc), SweepDecision::Locked { .. }));
    }

    #[test]
    fn idle_without_a_leader_or_while_paused() {
        let mut doc = live_doc(20, 0);
        doc.auction.is_paused = true;
        assert_eq!(evaluate(&doc), SweepDecision::Idle);

        let mut doc = live_doc(20, 0);
        doc.auction.active_bid = None;
        assert_eq!(evaluate(&doc), SweepDecision::Idle);

        let mut doc = live_doc(20, 0);
        doc.auction.status = AuctionStatus::Ended;
        assert_eq!(evaluate(&doc), SweepDecision::Idle);
    }
}
