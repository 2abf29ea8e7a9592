// End-to-end auction flows through the public engine API.
//
// Each test builds a fresh in-memory store and a manual clock, then drives
// the state machine the way the transport layer and automation driver do.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, TimeZone, Utc};

use gavel_core::clock::{ManualClock, Now};
use gavel_core::engine::{
    AuctionEngine, AuctionTiming, CreateAuctionInput, FinalizeOptions, JoinOutcome, SkipOutcome,
};
use gavel_core::error::AuctionError;
use gavel_core::model::{AuctionStatus, Category, CategoryLabel, PlayerResult, Visibility};
use gavel_core::store::Database;

// ===========================================================================
// Test helpers
// ===========================================================================

struct Harness {
    engine: AuctionEngine,
    clock: ManualClock,
    auction_id: String,
}

impl Harness {
    /// Auction with one category A (base 10) holding `players`, created by
    /// p1, with p2..pN joined.
    fn new(players: &[&str], participants: usize, players_per_team: u32, budget: u32) -> Self {
        let store = Arc::new(Database::open(":memory:").expect("in-memory database"));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap());
        let engine = AuctionEngine::new(store, Arc::new(clock.clone()), AuctionTiming::default());

        let auction_id = engine
            .create(CreateAuctionInput {
                name: "Integration".into(),
                password: "pw".into(),
                visibility: Visibility::Private,
                max_participants: participants as u32,
                players_per_team,
                budget_per_player: budget,
                categories: vec![Category {
                    label: CategoryLabel::A,
                    base_price: 10,
                    players: players.iter().map(|p| p.to_string()).collect(),
                }],
                creator_id: "p1".into(),
                creator_name: "P1".into(),
            })
            .unwrap();

        for n in 2..=participants {
            let id = format!("p{n}");
            let outcome = engine.join(&auction_id, "pw", &id, &id.to_uppercase()).unwrap();
            assert_eq!(outcome, JoinOutcome::Joined);
        }

        Harness {
            engine,
            clock,
            auction_id,
        }
    }

    fn id(&self) -> &str {
        &self.auction_id
    }

    fn bid(&self, who: &str, amount: u32) -> Result<(), AuctionError> {
        self.engine
            .place_bid(self.id(), who, &who.to_uppercase(), amount)
            .map(|_| ())
    }

    fn finalize(&self) {
        self.engine
            .finalize_current_player(self.id(), FinalizeOptions::default())
            .unwrap();
    }

    fn assert_budgets_conserved(&self) {
        let snapshot = self.engine.snapshot(self.id()).unwrap();
        let budget = snapshot.document.auction.budget_per_player;
        for p in snapshot.document.participants.values() {
            assert_eq!(
                p.budget_remaining + p.total_spent(),
                budget,
                "budget not conserved for {}",
                p.id
            );
        }
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ===========================================================================
// Worked scenarios
// ===========================================================================

#[test]
fn contested_player_sells_to_highest_bidder() {
    let h = Harness::new(&["X"], 2, 1, 100);
    h.engine.start(h.id()).unwrap();

    h.bid("p1", 15).unwrap();
    let auction = h.engine.snapshot(h.id()).unwrap().document.auction;
    let leader = auction.active_bid.unwrap();
    assert_eq!((leader.amount, leader.bidder_id.as_str()), (15, "p1"));

    let err = h.bid("p2", 15).unwrap_err();
    assert!(matches!(err, AuctionError::BidTooLow { minimum: 16 }));
    assert_eq!(err.to_string(), "Bid must be at least 16.");

    h.bid("p2", 20).unwrap();
    h.finalize();

    let snapshot = h.engine.snapshot(h.id()).unwrap();
    let p2 = &snapshot.document.participants["p2"];
    assert_eq!(p2.roster.len(), 1);
    assert_eq!(p2.roster[0].player_name, "X");
    assert_eq!(p2.roster[0].category_label, CategoryLabel::A);
    assert_eq!(p2.roster[0].price, 20);
    assert_eq!(p2.budget_remaining, 80);

    let ledger = &snapshot.document.auction.completed_players;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].player_name, "X");
    assert_eq!(ledger[0].result, PlayerResult::Sold);
    assert_eq!(ledger[0].winner_id.as_deref(), Some("p2"));
    assert_eq!(ledger[0].final_bid, Some(20));
    assert_eq!(snapshot.document.auction.status, AuctionStatus::Ended);
    h.assert_budgets_conserved();
}

#[test]
fn unanimous_skip_without_bids_goes_unsold() {
    let h = Harness::new(&["X"], 2, 1, 100);
    h.engine.start(h.id()).unwrap();

    let first = h.engine.skip(h.id(), "p1").unwrap();
    assert_eq!(first, SkipOutcome::Recorded { votes: 1, required: 2 });
    // Voting twice is still one vote.
    let again = h.engine.skip(h.id(), "p1").unwrap();
    assert_eq!(again, SkipOutcome::Recorded { votes: 1, required: 2 });

    let second = h.engine.skip(h.id(), "p2").unwrap();
    assert!(matches!(second, SkipOutcome::Resolved { .. }));

    let snapshot = h.engine.snapshot(h.id()).unwrap();
    let ledger = &snapshot.document.auction.completed_players;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].result, PlayerResult::Unsold);
    for p in snapshot.document.participants.values() {
        assert_eq!(p.budget_remaining, 100);
        assert!(p.roster.is_empty());
    }
}

#[test]
fn relisted_player_overwrites_its_ledger_entry() {
    let h = Harness::new(&["X"], 2, 1, 100);
    h.engine.start(h.id()).unwrap();
    h.engine.skip(h.id(), "p1").unwrap();
    h.engine.skip(h.id(), "p2").unwrap();

    let before = h.engine.snapshot(h.id()).unwrap().document.auction;
    assert_eq!(before.status, AuctionStatus::Ended);
    let entry_id = before.completed_players[0].id.clone();

    h.clock.advance(Duration::seconds(30));
    let slot = h.engine.relist_unsold_player(h.id(), &entry_id).unwrap();
    assert_eq!(slot.name, "X");

    let relisted = h.engine.snapshot(h.id()).unwrap().document.auction;
    assert_eq!(relisted.status, AuctionStatus::Live);
    assert_eq!(relisted.manual_player.as_ref().unwrap().source_id, entry_id);
    assert_eq!(
        relisted.countdown_ends_at,
        Some(h.clock.now() + Duration::seconds(60))
    );
    assert_eq!(relisted.countdown_duration_ms, 60_000);

    // Only one manual slot at a time.
    assert!(matches!(
        h.engine.relist_unsold_player(h.id(), &entry_id),
        Err(AuctionError::ManualSlotActive)
    ));

    h.bid("p1", 10).unwrap();
    h.finalize();

    let after = h.engine.snapshot(h.id()).unwrap();
    let ledger = &after.document.auction.completed_players;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].id, entry_id);
    assert_eq!(ledger[0].result, PlayerResult::Sold);
    assert_eq!(ledger[0].winner_id.as_deref(), Some("p1"));
    assert_eq!(ledger[0].final_bid, Some(10));
    assert_eq!(after.document.auction.status, AuctionStatus::Ended);
    assert!(after.document.auction.manual_player.is_none());
    h.assert_budgets_conserved();
}

#[test]
fn three_way_ranking_produces_leaderboard() {
    let h = Harness::new(&["X"], 3, 1, 100);
    h.engine.start(h.id()).unwrap();
    h.engine.end_auction(h.id()).unwrap();
    h.engine.mark_auction_as_ranking(h.id()).unwrap();

    let points = h
        .engine
        .submit_ranking(h.id(), "p1", &ids(&["p2", "p3"]))
        .unwrap();
    assert_eq!(points["p2"], 2);
    assert_eq!(points["p3"], 1);

    h.engine
        .submit_ranking(h.id(), "p2", &ids(&["p3", "p1"]))
        .unwrap();
    h.engine
        .submit_ranking(h.id(), "p3", &ids(&["p2", "p1"]))
        .unwrap();

    let results = h.engine.finalize_results(h.id()).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].participant_id, "p2");
    assert_eq!(results[0].points, 4);
    assert_eq!(results[0].rank, 1);
    let points: Vec<u32> = results.iter().map(|r| r.points).collect();
    assert!(points.windows(2).all(|w| w[0] >= w[1]));
    let ranks: Vec<u32> = results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
}

#[test]
fn full_auction_refuses_newcomers_but_not_returning_clients() {
    let h = Harness::new(&["X"], 2, 1, 100);

    let err = h.engine.join(h.id(), "pw", "p9", "Newcomer").unwrap_err();
    assert!(matches!(err, AuctionError::AuctionFull { max_participants: 2 }));

    let outcome = h.engine.join(h.id(), "pw", "p2", "Renamed").unwrap();
    assert_eq!(outcome, JoinOutcome::Rejoined);

    let snapshot = h.engine.snapshot(h.id()).unwrap();
    assert_eq!(snapshot.document.auction.participant_count, 2);
    let p2 = &snapshot.document.participants["p2"];
    assert_eq!(p2.name, "Renamed");
    assert_eq!(p2.budget_remaining, 100);
}

// ===========================================================================
// Properties
// ===========================================================================

#[test]
fn queue_advances_by_one_and_ends_on_the_last_slot() {
    let h = Harness::new(&["X", "Y", "Z"], 2, 3, 100);
    h.engine.start(h.id()).unwrap();

    for expected in 1..=3usize {
        h.bid("p2", 10).unwrap();
        h.finalize();
        let auction = h.engine.snapshot(h.id()).unwrap().document.auction;
        assert_eq!(auction.current_player_index, Some(expected));
        assert_eq!(auction.status == AuctionStatus::Ended, expected == 3);
        h.assert_budgets_conserved();
    }

    let snapshot = h.engine.snapshot(h.id()).unwrap();
    assert_eq!(snapshot.document.participants["p2"].players_needed, 0);
    assert_eq!(snapshot.document.auction.countdown_ends_at, None);
}

#[test]
fn pass_quorum_excludes_the_leader() {
    let h = Harness::new(&["X", "Y"], 3, 2, 100);
    h.engine.start(h.id()).unwrap();
    h.bid("p1", 12).unwrap();

    // The leader's own vote never counts.
    assert_eq!(
        h.engine.skip(h.id(), "p1").unwrap(),
        SkipOutcome::Recorded { votes: 0, required: 2 }
    );
    assert_eq!(
        h.engine.skip(h.id(), "p2").unwrap(),
        SkipOutcome::Recorded { votes: 1, required: 2 }
    );
    let resolved = h.engine.skip(h.id(), "p3").unwrap();
    let SkipOutcome::Resolved { outcome } = resolved else {
        panic!("expected quorum to resolve, got {resolved:?}");
    };
    let resolution = outcome.resolution().unwrap();
    assert_eq!(resolution.entry.result, PlayerResult::Sold);
    assert_eq!(resolution.entry.winner_id.as_deref(), Some("p1"));
    assert!(!resolution.auction_ended);

    // Votes do not carry over to the next slot.
    let auction = h.engine.snapshot(h.id()).unwrap().document.auction;
    assert!(auction.skip_votes.is_empty());
    assert_eq!(auction.current_player_index, Some(1));
}

#[test]
fn a_new_bid_resets_pass_votes() {
    let h = Harness::new(&["X", "Y"], 3, 2, 100);
    h.engine.start(h.id()).unwrap();
    h.bid("p1", 12).unwrap();
    h.engine.skip(h.id(), "p2").unwrap();

    h.bid("p3", 13).unwrap();
    assert_eq!(
        h.engine.skip(h.id(), "p2").unwrap(),
        SkipOutcome::Recorded { votes: 1, required: 2 }
    );
}

#[test]
fn locked_outcome_resolves_without_waiting() {
    // p2 can spend at most 100 - 1 = 99 on this slot.
    let h = Harness::new(&["X", "Y"], 2, 2, 100);
    h.engine.start(h.id()).unwrap();

    let receipt = h.engine.place_bid(h.id(), "p1", "P1", 99).unwrap();
    let resolution = receipt
        .resolution
        .as_ref()
        .and_then(|o| o.resolution())
        .expect("sweep should resolve a locked slot");
    assert_eq!(resolution.entry.winner_id.as_deref(), Some("p1"));
    assert_eq!(resolution.entry.final_bid, Some(99));

    let snapshot = h.engine.snapshot(h.id()).unwrap();
    assert_eq!(snapshot.document.auction.current_player_index, Some(1));
    assert_eq!(snapshot.document.participants["p1"].budget_remaining, 1);
    h.assert_budgets_conserved();
}

#[test]
fn concurrent_bidders_never_lose_an_update() {
    let h = Harness::new(&["X"], 4, 1, 10_000);
    h.engine.start(h.id()).unwrap();
    let mut updates = h.engine.store().subscribe();

    let handles: Vec<_> = (1..=4u32)
        .map(|n| {
            let engine = h.engine.clone();
            let auction_id = h.auction_id.clone();
            thread::spawn(move || {
                let who = format!("p{n}");
                let mut accepted = Vec::new();
                for round in 0..10u32 {
                    let amount = 10 + round * 4 + n;
                    if engine.place_bid(&auction_id, &who, &who, amount).is_ok() {
                        accepted.push(amount);
                    }
                }
                accepted
            })
        })
        .collect();

    let accepted: Vec<u32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert!(!accepted.is_empty());

    // The stored leader is the highest bid anyone got accepted.
    let leader = h
        .engine
        .snapshot(h.id())
        .unwrap()
        .document
        .auction
        .active_bid
        .unwrap();
    assert_eq!(Some(leader.amount), accepted.iter().copied().max());

    // Snapshots arrive in commit order: versions and leading amounts only
    // ever go up, and the last one delivered is the stored state.
    let mut versions = Vec::new();
    let mut amounts = Vec::new();
    while let Ok(snapshot) = updates.try_recv() {
        versions.push(snapshot.version);
        if let Some(bid) = &snapshot.document.auction.active_bid {
            amounts.push(bid.amount);
        }
    }
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
    assert_eq!(
        versions.last().copied(),
        Some(h.engine.snapshot(h.id()).unwrap().version)
    );
    assert_eq!(amounts.len(), accepted.len());
    assert!(amounts.windows(2).all(|w| w[0] < w[1]), "{amounts:?}");
}

#[test]
fn finalize_outside_live_is_silent() {
    let h = Harness::new(&["X"], 2, 1, 100);
    let before = h.engine.snapshot(h.id()).unwrap().version;
    h.finalize();
    assert_eq!(h.engine.snapshot(h.id()).unwrap().version, before);

    let err = h.bid("p2", 10).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot place a bid while the auction is in the lobby phase."
    );
}
