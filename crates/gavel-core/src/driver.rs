// Countdown and phase automation.
//
// A fixed-tick scheduler that issues idempotent commands against every
// active auction: expired countdowns are finalized, finished team submission
// moves to ranking, and finished ranking publishes results. Every command it
// sends is safe to repeat, so two drivers (or a driver racing an admin) never
// double-apply anything.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{AuctionEngine, FinalizeOptions, FinalizeOutcome};
use crate::error::AuctionResult;
use crate::model::{AuctionSnapshot, AuctionStatus};

/// Default time between automation passes.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);

/// What a single pass actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Auctions whose expired slot was resolved.
    pub finalized: Vec<String>,
    /// Auctions moved from `ended` to `ranking`.
    pub advanced_to_ranking: Vec<String>,
    /// Auctions whose results were published.
    pub results_published: Vec<String>,
}

impl DriverReport {
    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty()
            && self.advanced_to_ranking.is_empty()
            && self.results_published.is_empty()
    }
}

pub struct AutomationDriver {
    engine: AuctionEngine,
    period: Duration,
}

impl AutomationDriver {
    pub fn new(engine: AuctionEngine, period: Duration) -> Self {
        AutomationDriver { engine, period }
    }

    /// Run one pass over every active auction. A failure on one auction is
    /// logged and does not stop the pass; it is retried next tick.
    pub fn tick(&self) -> DriverReport {
        let mut report = DriverReport::default();

        let ids = match self.engine.store().active_auction_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Automation pass could not list auctions: {}", e);
                return report;
            }
        };

        for auction_id in ids {
            if let Err(e) = self.visit(&auction_id, &mut report) {
                warn!("Automation failed for auction {}: {}", auction_id, e);
            }
        }
        report
    }

    fn visit(&self, auction_id: &str, report: &mut DriverReport) -> AuctionResult<()> {
        let snapshot = self.engine.snapshot(auction_id)?;
        let AuctionSnapshot { document, .. } = &snapshot;
        let auction = &document.auction;

        match auction.status {
            AuctionStatus::Live => {
                if auction.is_paused {
                    return Ok(());
                }
                let now = self.engine.now();
                let expired = auction.countdown_ends_at.is_some_and(|ends| ends <= now);
                let Some(slot) = auction.active_slot() else {
                    return Ok(());
                };
                if !expired {
                    return Ok(());
                }
                let outcome = self
                    .engine
                    .finalize_current_player(auction_id, FinalizeOptions::on_expiry(&slot.key))?;
                if let FinalizeOutcome::Resolved { .. } = outcome {
                    report.finalized.push(auction_id.to_string());
                }
            }
            AuctionStatus::Ended => {
                if auction.finalization_open
                    && document.all_teams_submitted()
                    && self.engine.mark_auction_as_ranking(auction_id)?
                {
                    report.advanced_to_ranking.push(auction_id.to_string());
                }
            }
            AuctionStatus::Ranking => {
                if document.all_rankings_submitted() {
                    self.engine.finalize_results(auction_id)?;
                    report.results_published.push(auction_id.to_string());
                }
            }
            AuctionStatus::Lobby | AuctionStatus::Results => {}
        }
        Ok(())
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Automation driver started (tick every {:?})", self.period);

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick();
                    if !report.is_empty() {
                        debug!("Automation pass: {:?}", report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Automation driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use crate::clock::ManualClock;
    use crate::engine::{AuctionTiming, CreateAuctionInput};
    use crate::model::test_support::t0;
    use crate::model::{Category, CategoryLabel, Visibility};
    use crate::store::Database;

    fn setup(players: &[&str]) -> (AutomationDriver, AuctionEngine, ManualClock, String) {
        let store = Arc::new(Database::open(":memory:").unwrap());
        let clock = ManualClock::new(t0());
        let engine = AuctionEngine::new(store, Arc::new(clock.clone()), AuctionTiming::default());
        let id = engine
            .create(CreateAuctionInput {
                name: "Tick Test".into(),
                password: "pw".into(),
                visibility: Visibility::Public,
                max_participants: 2,
                players_per_team: 1,
                budget_per_player: 50,
                categories: vec![Category {
                    label: CategoryLabel::B,
                    base_price: 5,
                    players: players.iter().map(|p| p.to_string()).collect(),
                }],
                creator_id: "p1".into(),
                creator_name: "One".into(),
            })
            .unwrap();
        engine.join(&id, "pw", "p2", "Two").unwrap();
        let driver = AutomationDriver::new(engine.clone(), DEFAULT_TICK);
        (driver, engine, clock, id)
    }

    #[test]
    fn tick_leaves_running_countdowns_alone() {
        let (driver, engine, clock, id) = setup(&["X", "Y"]);
        engine.start(&id).unwrap();
        clock.advance(ChronoDuration::seconds(59));
        assert!(driver.tick().is_empty());
    }

    #[test]
    fn tick_finalizes_expired_slot_once() {
        let (driver, engine, clock, id) = setup(&["X", "Y"]);
        engine.start(&id).unwrap();
        engine.place_bid(&id, "p2", "Two", 7).unwrap();

        clock.advance(ChronoDuration::seconds(16));
        let report = driver.tick();
        assert_eq!(report.finalized, vec![id.clone()]);

        let snapshot = engine.snapshot(&id).unwrap();
        assert_eq!(snapshot.document.participants["p2"].budget_remaining, 43);
        assert_eq!(snapshot.document.auction.current_player_index, Some(1));

        // The next slot just opened a fresh window.
        assert!(driver.tick().is_empty());
    }

    #[test]
    fn tick_skips_paused_auctions() {
        let (driver, engine, clock, id) = setup(&["X"]);
        engine.start(&id).unwrap();
        engine.pause(&id).unwrap();
        clock.advance(ChronoDuration::minutes(10));
        assert!(driver.tick().is_empty());
    }

    #[test]
    fn tick_walks_post_auction_phases() {
        let (driver, engine, _clock, id) = setup(&["X"]);
        engine.start(&id).unwrap();
        engine.end_auction(&id).unwrap();
        engine.open_finalization_phase(&id).unwrap();

        engine.submit_team(&id, "p1", None).unwrap();
        assert!(driver.tick().is_empty());
        engine.submit_team(&id, "p2", None).unwrap();
        assert_eq!(driver.tick().advanced_to_ranking, vec![id.clone()]);

        engine.submit_ranking(&id, "p1", &["p2".to_string()]).unwrap();
        assert!(driver.tick().is_empty());
        engine.submit_ranking(&id, "p2", &["p1".to_string()]).unwrap();
        assert_eq!(driver.tick().results_published, vec![id.clone()]);

        let auction = engine.snapshot(&id).unwrap().document.auction;
        assert_eq!(auction.status, AuctionStatus::Results);
        assert_eq!(auction.results.map(|r| r.len()), Some(2));
        // Results are terminal; nothing left to watch.
        assert!(driver.tick().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (driver, _engine, _clock, _id) = setup(&["X"]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(driver.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("driver should stop")
            .unwrap();
    }
}
