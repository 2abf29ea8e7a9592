// Auction state machine.
//
// One method per transition. Every method that mutates state does so inside
// a single `Database::transact` call, so each transition is applied whole or
// not at all, and a transaction that loses a race is replayed against the
// winner's state. The lock-resolution sweep runs after bids and skip votes,
// outside the transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Now;
use crate::error::{AuctionError, AuctionResult};
use crate::model::{
    ActiveBid, Auction, AuctionDocument, AuctionSnapshot, AuctionStatus, AuctionSummary,
    Category, CompletedPlayer, FinalRoster, ManualSlot, Participant, PlayerResult, ResultEntry,
    Role, Visibility,
};
use crate::queue::{duplicate_label, normalize_categories, PlayerSlot};
use crate::scoring;
use crate::store::Database;
use crate::sweep;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Countdown windows for each kind of slot transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionTiming {
    /// Window opened on start and whenever the next queue player comes up.
    pub opening_countdown: Duration,
    /// Window reset by every accepted bid.
    pub bid_countdown: Duration,
    /// Window opened when an unsold player is relisted.
    pub relist_countdown: Duration,
}

impl Default for AuctionTiming {
    fn default() -> Self {
        AuctionTiming {
            opening_countdown: Duration::seconds(60),
            bid_countdown: Duration::seconds(15),
            relist_countdown: Duration::seconds(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuctionInput {
    pub name: String,
    pub password: String,
    pub visibility: Visibility,
    pub max_participants: u32,
    pub players_per_team: u32,
    pub budget_per_player: u32,
    pub categories: Vec<Category>,
    pub creator_id: String,
    pub creator_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinOutcome {
    Joined,
    Rejoined,
}

/// An accepted bid, plus whatever the sweep decided right after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidReceipt {
    pub slot_key: String,
    pub amount: u32,
    pub countdown_ends_at: DateTime<Utc>,
    pub resolution: Option<FinalizeOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipOutcome {
    /// Vote counted; quorum not reached yet.
    #[serde(rename_all = "camelCase")]
    Recorded { votes: u32, required: u32 },
    /// This vote completed the quorum and the slot was resolved.
    Resolved { outcome: FinalizeOutcome },
    /// The auction was not accepting votes (not live, or paused).
    Ignored,
}

/// Knobs for [`AuctionEngine::finalize_current_player`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Record the slot as unsold even if someone is leading.
    pub force_unsold: bool,
    /// Only resolve if this is still the active slot.
    pub expected_slot_key: Option<String>,
    /// Only resolve if the countdown has elapsed and the auction is running.
    pub require_expired: bool,
}

impl FinalizeOptions {
    /// Options for a trigger that observed `slot_key` and wants it resolved
    /// once its countdown runs out.
    pub fn on_expiry(slot_key: &str) -> Self {
        FinalizeOptions {
            force_unsold: false,
            expected_slot_key: Some(slot_key.to_string()),
            require_expired: true,
        }
    }

    pub fn for_slot(slot_key: &str) -> Self {
        FinalizeOptions {
            expected_slot_key: Some(slot_key.to_string()),
            ..FinalizeOptions::default()
        }
    }
}

/// A slot that has just been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The ledger entry as written (new, or overwritten for a relist).
    pub entry: CompletedPlayer,
    /// Whether resolving this slot ended the live phase.
    pub auction_ended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinalizeSkip {
    NotLive,
    NoActivePlayer,
    SlotChanged,
    Paused,
    CountdownRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FinalizeOutcome {
    Resolved { resolution: Resolution },
    Skipped { reason: FinalizeSkip },
}

impl FinalizeOutcome {
    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            FinalizeOutcome::Resolved { resolution } => Some(resolution),
            FinalizeOutcome::Skipped { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The operation surface of the auction state machine.
#[derive(Clone)]
pub struct AuctionEngine {
    store: Arc<Database>,
    now: Arc<dyn Now>,
    timing: AuctionTiming,
}

impl AuctionEngine {
    pub fn new(store: Arc<Database>, now: Arc<dyn Now>, timing: AuctionTiming) -> Self {
        AuctionEngine { store, now, timing }
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub fn timing(&self) -> AuctionTiming {
        self.timing
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now.now()
    }

    /// Latest committed state of an auction.
    pub fn snapshot(&self, auction_id: &str) -> AuctionResult<AuctionSnapshot> {
        self.store.load(auction_id)
    }

    pub fn list_auctions(&self) -> AuctionResult<Vec<AuctionSummary>> {
        Ok(self.store.list_auctions()?)
    }

    /// Fails unless `client_id` is the auction's admin.
    pub fn require_admin(&self, auction_id: &str, client_id: &str) -> AuctionResult<()> {
        let snapshot = self.store.load(auction_id)?;
        match snapshot.document.participant(client_id) {
            Some(p) if p.is_admin() => Ok(()),
            Some(_) => Err(AuctionError::NotAdmin),
            None => Err(AuctionError::NotAParticipant),
        }
    }

    // ------------------------------------------------------------------
    // Lobby
    // ------------------------------------------------------------------

    /// Validate and persist a new auction in the lobby, with the creator as
    /// its admin. Returns the new auction id.
    pub fn create(&self, input: CreateAuctionInput) -> AuctionResult<String> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(AuctionError::EmptyName);
        }
        let creator_name = input.creator_name.trim().to_string();
        if creator_name.is_empty() {
            return Err(AuctionError::EmptyDisplayName);
        }
        validate_settings(&input)?;

        if let Some(label) = duplicate_label(&input.categories) {
            return Err(AuctionError::DuplicateCategory { label });
        }
        let categories = normalize_categories(input.categories);
        let total_players: u32 = categories.iter().map(|c| c.players.len() as u32).sum();
        if total_players == 0 {
            return Err(AuctionError::NoPlayers);
        }

        let name_lower = name.to_lowercase();
        if self.store.name_taken(&name_lower)? {
            return Err(AuctionError::DuplicateName { name });
        }

        let now = self.now.now();
        let auction = Auction {
            id: generate_auction_id(now, &name_lower),
            name,
            name_lower,
            password: input.password,
            visibility: input.visibility,
            max_participants: input.max_participants,
            players_per_team: input.players_per_team,
            budget_per_player: input.budget_per_player,
            categories,
            total_players,
            created_by: input.creator_id.clone(),
            created_at: now,
            status: AuctionStatus::Lobby,
            participant_count: 1,
            next_join_seq: 1,
            current_player_index: None,
            countdown_ends_at: None,
            countdown_duration_ms: 0,
            active_bid: None,
            skip_votes: Default::default(),
            is_paused: false,
            paused_remaining_ms: None,
            manual_player: None,
            relist_count: 0,
            completed_players: Vec::new(),
            finalization_open: false,
            results: None,
        };
        let admin = Participant::new(
            &input.creator_id,
            &creator_name,
            Role::Admin,
            now,
            0,
            &auction,
        );

        let document = AuctionDocument {
            participants: BTreeMap::from([(admin.id.clone(), admin)]),
            auction,
        };
        let snapshot = self.store.create_auction(&document)?;
        let auction_id = snapshot.auction_id().to_string();
        info!(
            "Created auction '{}' ({}) with {} players",
            snapshot.document.auction.name, auction_id, snapshot.document.auction.total_players
        );
        Ok(auction_id)
    }

    /// Join an auction, or rejoin under a new display name. Rejoining never
    /// touches budget, roster, or submission state.
    pub fn join(
        &self,
        auction_id: &str,
        password: &str,
        client_id: &str,
        display_name: &str,
    ) -> AuctionResult<JoinOutcome> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(AuctionError::EmptyDisplayName);
        }
        let now = self.now.now();

        let outcome = self.store.transact(auction_id, |doc| {
            if doc.auction.password != password {
                return Err(AuctionError::WrongPassword);
            }

            if let Some(existing) = doc.participant_mut(client_id) {
                existing.name = display_name.to_string();
                return Ok(JoinOutcome::Rejoined);
            }

            let auction = &mut doc.auction;
            if auction.participant_count >= auction.max_participants {
                return Err(AuctionError::AuctionFull {
                    max_participants: auction.max_participants,
                });
            }
            if auction.status != AuctionStatus::Lobby {
                return Err(AuctionError::AuctionAlreadyStarted);
            }

            let seq = auction.next_join_seq;
            auction.next_join_seq += 1;
            auction.participant_count += 1;
            let participant =
                Participant::new(client_id, display_name, Role::Player, now, seq, auction);
            doc.participants.insert(client_id.to_string(), participant);
            Ok(JoinOutcome::Joined)
        })?;

        info!(
            "Participant {} {:?} auction {}",
            client_id, outcome, auction_id
        );
        Ok(outcome)
    }

    /// Leave an auction that has not started yet.
    pub fn leave(&self, auction_id: &str, client_id: &str) -> AuctionResult<()> {
        self.store.transact(auction_id, |doc| {
            let participant = doc
                .participant(client_id)
                .ok_or(AuctionError::NotAParticipant)?;
            if participant.is_admin() {
                return Err(AuctionError::AdminCannotLeave);
            }
            if doc.auction.status != AuctionStatus::Lobby {
                return Err(AuctionError::InvalidState {
                    action: "leave",
                    status: doc.auction.status,
                });
            }
            doc.participants.remove(client_id);
            doc.auction.participant_count = doc.auction.participant_count.saturating_sub(1);
            Ok(())
        })?;
        info!("Participant {} left auction {}", client_id, auction_id);
        Ok(())
    }

    /// Open bidding on the first queue slot.
    pub fn start(&self, auction_id: &str) -> AuctionResult<()> {
        let now = self.now.now();
        let timing = self.timing;
        self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            if auction.status != AuctionStatus::Lobby {
                return Err(AuctionError::InvalidState {
                    action: "start the auction",
                    status: auction.status,
                });
            }
            if auction.queue().is_empty() {
                return Err(AuctionError::EmptyQueue);
            }
            auction.status = AuctionStatus::Live;
            auction.current_player_index = Some(0);
            auction.manual_player = None;
            auction.clear_round_state();
            auction.open_countdown(now, timing.opening_countdown);
            Ok(())
        })?;
        info!("Auction {} is live", auction_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Live bidding
    // ------------------------------------------------------------------

    /// Place a bid on the active slot. On success the countdown restarts and
    /// skip votes are cleared; the lock-resolution sweep then runs.
    pub fn place_bid(
        &self,
        auction_id: &str,
        client_id: &str,
        bidder_name: &str,
        amount: u32,
    ) -> AuctionResult<BidReceipt> {
        let now = self.now.now();
        let timing = self.timing;

        let (slot_key, countdown_ends_at) = self.store.transact(auction_id, |doc| {
            let auction = &doc.auction;
            if auction.status != AuctionStatus::Live {
                return Err(AuctionError::InvalidState {
                    action: "place a bid",
                    status: auction.status,
                });
            }
            if auction.is_paused {
                return Err(AuctionError::Paused);
            }
            let slot = auction.active_slot().ok_or(AuctionError::NoActivePlayer)?;
            let participant = doc
                .participant(client_id)
                .ok_or(AuctionError::NotAParticipant)?;
            if participant.players_needed == 0 {
                return Err(AuctionError::RosterFull);
            }

            let minimum = auction.minimum_bid(&slot);
            if amount < minimum {
                return Err(AuctionError::BidTooLow { minimum });
            }
            if amount > participant.budget_remaining {
                return Err(AuctionError::InsufficientBudget {
                    budget_remaining: participant.budget_remaining,
                });
            }
            let max_bid = participant.max_bid().unwrap_or(0);
            if amount > max_bid {
                return Err(AuctionError::WouldStrandRoster {
                    max_bid,
                    slots_to_fill: participant.reserved_budget(),
                });
            }

            let bidder_name = match bidder_name.trim() {
                "" => participant.name.clone(),
                name => name.to_string(),
            };
            let auction = &mut doc.auction;
            auction.active_bid = Some(ActiveBid {
                amount,
                bidder_id: client_id.to_string(),
                bidder_name,
            });
            auction.skip_votes.clear();
            auction.open_countdown(now, timing.bid_countdown);
            let ends_at = now + timing.bid_countdown;
            Ok((slot.key, ends_at))
        })?;

        info!(
            "Bid of {} on {} by {} in auction {}",
            amount, slot_key, client_id, auction_id
        );

        let resolution = self.sweep_after_action(auction_id);
        Ok(BidReceipt {
            slot_key,
            amount,
            countdown_ends_at,
            resolution,
        })
    }

    /// Vote to pass (someone is leading) or skip (nobody has bid). Reaching
    /// quorum resolves the slot in the same transaction.
    pub fn skip(&self, auction_id: &str, client_id: &str) -> AuctionResult<SkipOutcome> {
        let now = self.now.now();
        let timing = self.timing;

        let outcome = self.store.transact(auction_id, |doc| {
            if doc.auction.status != AuctionStatus::Live || doc.auction.is_paused {
                return Ok(SkipOutcome::Ignored);
            }
            if doc.participant(client_id).is_none() {
                return Err(AuctionError::NotAParticipant);
            }
            let Some(slot) = doc.auction.active_slot() else {
                return Ok(SkipOutcome::Ignored);
            };

            doc.auction.skip_votes.insert(client_id.to_string());
            let (votes, required, force_unsold) = skip_tally(doc);
            if votes < required {
                return Ok(SkipOutcome::Recorded { votes, required });
            }

            let resolution = resolve_active_slot(doc, slot, force_unsold, now, timing);
            Ok(SkipOutcome::Resolved {
                outcome: FinalizeOutcome::Resolved { resolution },
            })
        })?;

        match &outcome {
            SkipOutcome::Recorded { votes, required } => {
                debug!(
                    "Skip vote from {} in auction {} ({}/{})",
                    client_id, auction_id, votes, required
                );
                self.sweep_after_action(auction_id);
            }
            SkipOutcome::Resolved { .. } => {
                info!("Skip quorum reached in auction {}", auction_id);
            }
            SkipOutcome::Ignored => {
                debug!(
                    "Ignored skip vote from {} in auction {} (not accepting votes)",
                    client_id, auction_id
                );
            }
        }
        Ok(outcome)
    }

    /// Freeze the countdown, remembering how much time was left.
    pub fn pause(&self, auction_id: &str) -> AuctionResult<()> {
        let now = self.now.now();
        self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            if auction.status != AuctionStatus::Live {
                return Err(AuctionError::InvalidState {
                    action: "pause",
                    status: auction.status,
                });
            }
            if auction.is_paused {
                return Err(AuctionError::Paused);
            }
            let remaining = match auction.countdown_ends_at {
                Some(ends) => (ends - now).num_milliseconds().max(0),
                None => auction.countdown_duration_ms,
            };
            auction.paused_remaining_ms = Some(remaining);
            auction.countdown_ends_at = None;
            auction.is_paused = true;
            Ok(())
        })?;
        info!("Auction {} paused", auction_id);
        Ok(())
    }

    /// Restart the countdown with the time that was left at pause.
    pub fn resume(&self, auction_id: &str) -> AuctionResult<()> {
        let now = self.now.now();
        self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            if auction.status != AuctionStatus::Live {
                return Err(AuctionError::InvalidState {
                    action: "resume",
                    status: auction.status,
                });
            }
            if !auction.is_paused {
                return Err(AuctionError::NotPaused);
            }
            let remaining = auction
                .paused_remaining_ms
                .unwrap_or(auction.countdown_duration_ms);
            auction.countdown_ends_at = Some(now + Duration::milliseconds(remaining));
            auction.paused_remaining_ms = None;
            auction.is_paused = false;
            Ok(())
        })?;
        info!("Auction {} resumed", auction_id);
        Ok(())
    }

    /// Resolve the active slot: sell to the leader (unless forced unsold) or
    /// record it unsold, then advance. Safe to call redundantly; see
    /// [`FinalizeOptions`] for the guards.
    pub fn finalize_current_player(
        &self,
        auction_id: &str,
        options: FinalizeOptions,
    ) -> AuctionResult<FinalizeOutcome> {
        let now = self.now.now();
        let timing = self.timing;

        let outcome = self.store.transact(auction_id, |doc| {
            if doc.auction.status != AuctionStatus::Live {
                return Ok(FinalizeOutcome::Skipped {
                    reason: FinalizeSkip::NotLive,
                });
            }
            let Some(slot) = doc.auction.active_slot() else {
                return Ok(FinalizeOutcome::Skipped {
                    reason: FinalizeSkip::NoActivePlayer,
                });
            };
            if let Some(expected) = &options.expected_slot_key {
                if *expected != slot.key {
                    return Ok(FinalizeOutcome::Skipped {
                        reason: FinalizeSkip::SlotChanged,
                    });
                }
            }
            if options.require_expired {
                if doc.auction.is_paused {
                    return Ok(FinalizeOutcome::Skipped {
                        reason: FinalizeSkip::Paused,
                    });
                }
                if doc.auction.countdown_ends_at.is_some_and(|ends| ends > now) {
                    return Ok(FinalizeOutcome::Skipped {
                        reason: FinalizeSkip::CountdownRunning,
                    });
                }
            }

            let resolution = resolve_active_slot(doc, slot, options.force_unsold, now, timing);
            Ok(FinalizeOutcome::Resolved { resolution })
        })?;

        match &outcome {
            FinalizeOutcome::Resolved { resolution } => {
                let entry = &resolution.entry;
                info!(
                    "Resolved {} in auction {}: {:?} (winner={:?}, price={:?}, ended={})",
                    entry.player_name,
                    auction_id,
                    entry.result,
                    entry.winner_id,
                    entry.final_bid,
                    resolution.auction_ended
                );
            }
            FinalizeOutcome::Skipped { reason } => {
                debug!("Finalize on auction {} skipped: {:?}", auction_id, reason);
            }
        }
        Ok(outcome)
    }

    /// Put an unsold player back under the hammer without moving the queue.
    pub fn relist_unsold_player(
        &self,
        auction_id: &str,
        completed_player_id: &str,
    ) -> AuctionResult<PlayerSlot> {
        let now = self.now.now();
        let timing = self.timing;

        let slot = self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            if !matches!(auction.status, AuctionStatus::Live | AuctionStatus::Ended) {
                return Err(AuctionError::InvalidState {
                    action: "relist a player",
                    status: auction.status,
                });
            }
            if auction.finalization_open {
                return Err(AuctionError::FinalizationStarted);
            }
            if auction.manual_player.is_some() {
                return Err(AuctionError::ManualSlotActive);
            }
            let entry = auction
                .completed_player(completed_player_id)
                .cloned()
                .ok_or_else(|| AuctionError::UnknownCompletedPlayer {
                    completed_player_id: completed_player_id.to_string(),
                })?;
            if entry.result != PlayerResult::Unsold {
                return Err(AuctionError::NotRelistable);
            }

            auction.relist_count += 1;
            let slot = PlayerSlot {
                key: format!("{}-relist-{}", entry.id, auction.relist_count),
                name: entry.player_name,
                category_label: entry.category_label,
                base_price: entry.base_price,
            };
            auction.manual_player = Some(ManualSlot {
                slot: slot.clone(),
                source_id: entry.id,
            });
            auction.status = AuctionStatus::Live;
            auction.clear_round_state();
            auction.open_countdown(now, timing.relist_countdown);
            Ok(slot)
        })?;

        info!(
            "Relisted {} as {} in auction {}",
            slot.name, slot.key, auction_id
        );
        Ok(slot)
    }

    /// Stop the live phase immediately without resolving the active slot.
    /// Returns `false` if the auction had already ended.
    pub fn end_auction(&self, auction_id: &str) -> AuctionResult<bool> {
        let ended = self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            match auction.status {
                AuctionStatus::Ended => Ok(false),
                AuctionStatus::Live => {
                    auction.close_live_phase();
                    Ok(true)
                }
                status => Err(AuctionError::InvalidState {
                    action: "end the auction",
                    status,
                }),
            }
        })?;
        if ended {
            info!("Auction {} ended by admin", auction_id);
        }
        Ok(ended)
    }

    // ------------------------------------------------------------------
    // Post-auction
    // ------------------------------------------------------------------

    /// Let participants reach team submission. Returns `false` if it was
    /// already open.
    pub fn open_finalization_phase(&self, auction_id: &str) -> AuctionResult<bool> {
        let opened = self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            if auction.status != AuctionStatus::Ended {
                return Err(AuctionError::InvalidState {
                    action: "open team submission",
                    status: auction.status,
                });
            }
            if auction.finalization_open {
                return Ok(false);
            }
            auction.finalization_open = true;
            Ok(true)
        })?;
        if opened {
            info!("Team submission opened for auction {}", auction_id);
        }
        Ok(opened)
    }

    /// Record a participant's team. The optional final roster must only use
    /// players they actually bought.
    pub fn submit_team(
        &self,
        auction_id: &str,
        client_id: &str,
        final_roster: Option<FinalRoster>,
    ) -> AuctionResult<()> {
        self.store.transact(auction_id, |doc| {
            if doc.auction.status != AuctionStatus::Ended {
                return Err(AuctionError::InvalidState {
                    action: "submit a team",
                    status: doc.auction.status,
                });
            }
            if !doc.auction.finalization_open {
                return Err(AuctionError::FinalizationClosed);
            }
            let participant = doc
                .participant_mut(client_id)
                .ok_or(AuctionError::NotAParticipant)?;
            if participant.has_submitted_team {
                return Err(AuctionError::TeamAlreadySubmitted);
            }
            if let Some(roster) = &final_roster {
                validate_final_roster(participant, roster)?;
            }
            participant.final_roster = final_roster.clone();
            participant.has_submitted_team = true;
            Ok(())
        })?;
        info!("Participant {} submitted a team in auction {}", client_id, auction_id);
        Ok(())
    }

    /// Move from team submission to peer ranking. Returns `false` if the
    /// auction is already ranking or has results.
    pub fn mark_auction_as_ranking(&self, auction_id: &str) -> AuctionResult<bool> {
        let moved = self.store.transact(auction_id, |doc| {
            let auction = &mut doc.auction;
            match auction.status {
                AuctionStatus::Ranking | AuctionStatus::Results => Ok(false),
                AuctionStatus::Ended => {
                    auction.status = AuctionStatus::Ranking;
                    Ok(true)
                }
                status => Err(AuctionError::InvalidState {
                    action: "start ranking",
                    status,
                }),
            }
        })?;
        if moved {
            info!("Auction {} moved to ranking", auction_id);
        }
        Ok(moved)
    }

    /// Record `client_id`'s ordering of every other participant, best
    /// first. Returns the points awarded per target.
    pub fn submit_ranking(
        &self,
        auction_id: &str,
        client_id: &str,
        ranking_order: &[String],
    ) -> AuctionResult<BTreeMap<String, u32>> {
        let points = self.store.transact(auction_id, |doc| {
            if doc.auction.status != AuctionStatus::Ranking {
                return Err(AuctionError::InvalidState {
                    action: "submit a ranking",
                    status: doc.auction.status,
                });
            }
            let participant = doc
                .participant(client_id)
                .ok_or(AuctionError::NotAParticipant)?;
            if participant.ranking_submitted {
                return Err(AuctionError::RankingAlreadySubmitted);
            }
            scoring::validate_ranking_order(doc, client_id, ranking_order)?;

            let points = scoring::points_for_order(ranking_order, doc.auction.participant_count);
            if let Some(participant) = doc.participant_mut(client_id) {
                participant.rankings = points.clone();
                participant.ranking_submitted = true;
            }
            Ok(points)
        })?;
        info!(
            "Participant {} submitted a ranking in auction {}",
            client_id, auction_id
        );
        Ok(points)
    }

    /// Tally every submitted ranking into the final leaderboard. Calling it
    /// again after results exist returns the stored leaderboard.
    pub fn finalize_results(&self, auction_id: &str) -> AuctionResult<Vec<ResultEntry>> {
        let (results, published) = self.store.transact(auction_id, |doc| {
            match doc.auction.status {
                AuctionStatus::Results => {
                    return Ok((doc.auction.results.clone().unwrap_or_default(), false));
                }
                AuctionStatus::Ranking => {}
                status => {
                    return Err(AuctionError::InvalidState {
                        action: "publish results",
                        status,
                    });
                }
            }
            let results = scoring::tally_results(doc);
            doc.auction.results = Some(results.clone());
            doc.auction.status = AuctionStatus::Results;
            Ok((results, true))
        })?;
        if published {
            info!(
                "Published results for auction {} ({} entries)",
                auction_id,
                results.len()
            );
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Run the lock-resolution sweep, logging instead of failing: the bid or
    /// vote that triggered it has already committed.
    fn sweep_after_action(&self, auction_id: &str) -> Option<FinalizeOutcome> {
        match sweep::lock_resolution_sweep(self, auction_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Lock-resolution sweep failed for auction {}: {}", auction_id, e);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

/// Count the votes that matter for the current slot and the quorum they
/// need. Returns `(votes, required, force_unsold)`.
///
/// With a leader, everyone except the leader must pass and the slot sells.
/// Without one, everyone must skip and the slot goes unsold.
fn skip_tally(doc: &AuctionDocument) -> (u32, u32, bool) {
    let auction = &doc.auction;
    let count = auction.participant_count;
    let eligible = |id: &&String| doc.participants.contains_key(id.as_str());

    match &auction.active_bid {
        Some(bid) => {
            let votes = auction
                .skip_votes
                .iter()
                .filter(eligible)
                .filter(|id| **id != bid.bidder_id)
                .count() as u32;
            (votes, count.saturating_sub(1).max(1), false)
        }
        None => {
            let votes = auction.skip_votes.iter().filter(eligible).count() as u32;
            (votes, count.max(1), true)
        }
    }
}

/// Resolve `slot`, the active slot, inside a transaction: credit the leader
/// (unless `force_unsold`), write the ledger entry, then advance.
fn resolve_active_slot(
    doc: &mut AuctionDocument,
    slot: PlayerSlot,
    force_unsold: bool,
    now: DateTime<Utc>,
    timing: AuctionTiming,
) -> Resolution {
    let manual = doc.auction.manual_player.take();

    let mut entry = CompletedPlayer {
        id: manual
            .as_ref()
            .map(|m| m.source_id.clone())
            .unwrap_or_else(|| slot.key.clone()),
        player_name: slot.name.clone(),
        category_label: slot.category_label,
        base_price: slot.base_price,
        result: PlayerResult::Unsold,
        winner_id: None,
        winner_name: None,
        final_bid: None,
        resolved_at: now,
    };

    if let (Some(bid), false) = (doc.auction.active_bid.clone(), force_unsold) {
        match doc.participant_mut(&bid.bidder_id) {
            Some(winner) => {
                winner.record_win(&slot, bid.amount);
                entry.result = PlayerResult::Sold;
                entry.winner_id = Some(bid.bidder_id.clone());
                entry.winner_name = Some(bid.bidder_name.clone());
                entry.final_bid = Some(bid.amount);
            }
            None => {
                warn!(
                    "Winning bidder {} for {} is no longer in auction {}; recording unsold",
                    bid.bidder_id, slot.name, doc.auction.id
                );
            }
        }
    }

    let auction = &mut doc.auction;
    if manual.is_some() {
        // A relist overwrites its source entry; the queue pointer stays put.
        match auction
            .completed_players
            .iter_mut()
            .find(|c| c.id == entry.id)
        {
            Some(existing) => *existing = entry.clone(),
            None => auction.completed_players.push(entry.clone()),
        }
    } else {
        auction.completed_players.push(entry.clone());
        let next = auction.current_player_index.map_or(0, |i| i + 1);
        auction.current_player_index = Some(next);
    }

    let auction_ended = if auction.queue_exhausted() {
        auction.close_live_phase();
        true
    } else {
        auction.status = AuctionStatus::Live;
        auction.clear_round_state();
        auction.open_countdown(now, timing.opening_countdown);
        false
    };

    Resolution {
        entry,
        auction_ended,
    }
}

fn validate_settings(input: &CreateAuctionInput) -> AuctionResult<()> {
    let checks: &[(&str, u32)] = &[
        ("maximum participants", input.max_participants),
        ("players per team", input.players_per_team),
        ("budget per player", input.budget_per_player),
    ];
    for (field, value) in checks {
        if *value == 0 {
            return Err(AuctionError::InvalidSettings {
                message: format!("{field} must be greater than 0"),
            });
        }
    }
    if input.players_per_team > input.budget_per_player {
        return Err(AuctionError::InvalidSettings {
            message: "budget per player must cover at least 1 per roster slot".into(),
        });
    }
    Ok(())
}

/// Every player in the final roster must come from the participant's real
/// roster, and no bought player may be used twice.
fn validate_final_roster(participant: &Participant, roster: &FinalRoster) -> AuctionResult<()> {
    let mut available: BTreeMap<&str, usize> = BTreeMap::new();
    for bought in &participant.roster {
        *available.entry(bought.player_name.as_str()).or_default() += 1;
    }
    for entry in &roster.players {
        match available.get_mut(entry.player_name.as_str()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                return Err(AuctionError::InvalidFinalRoster {
                    message: format!("{} is not on your roster", entry.player_name),
                });
            }
        }
    }
    Ok(())
}

/// `auction_YYYYMMDD_HHMMSS_mmm_<slug>`. The slug comes from the unique
/// case-folded name, so two auctions never share an id.
fn generate_auction_id(now: DateTime<Utc>, name_lower: &str) -> String {
    let slug: String = name_lower
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    // The slug is lossy ("a b" and "a-b" share one), so tag it with a hash
    // of the exact name, which is unique.
    format!(
        "{}_{}_{:08x}",
        now.format("auction_%Y%m%d_%H%M%S_%3f"),
        slug,
        fnv1a(name_lower)
    )
}

/// 32-bit FNV-1a. Stable across builds, unlike `DefaultHasher`.
fn fnv1a(text: &str) -> u32 {
    text.bytes().fold(0x811c_9dc5, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}
