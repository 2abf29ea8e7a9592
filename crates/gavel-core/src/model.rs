// Auction and participant documents.
//
// These are the records the store persists as JSON and pushes to
// subscribers. Field names are camelCase on the wire.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{build_player_queue, PlayerSlot};

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Price tier of a category. Queue order is always A, B, C, D, E.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CategoryLabel {
    A,
    B,
    C,
    D,
    E,
}

impl CategoryLabel {
    pub const ALL: [CategoryLabel; 5] = [
        CategoryLabel::A,
        CategoryLabel::B,
        CategoryLabel::C,
        CategoryLabel::D,
        CategoryLabel::E,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryLabel::A => "A",
            CategoryLabel::B => "B",
            CategoryLabel::C => "C",
            CategoryLabel::D => "D",
            CategoryLabel::E => "E",
        }
    }
}

impl fmt::Display for CategoryLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A priced group of players listed by the admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub label: CategoryLabel,
    pub base_price: u32,
    pub players: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// Lifecycle phase. Only a relist moves an auction backwards (ended to live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Lobby,
    Live,
    Ended,
    Ranking,
    Results,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Lobby => "lobby",
            AuctionStatus::Live => "live",
            AuctionStatus::Ended => "ended",
            AuctionStatus::Ranking => "ranking",
            AuctionStatus::Results => "results",
        }
    }

    pub fn from_str_status(s: &str) -> Option<Self> {
        match s {
            "lobby" => Some(AuctionStatus::Lobby),
            "live" => Some(AuctionStatus::Live),
            "ended" => Some(AuctionStatus::Ended),
            "ranking" => Some(AuctionStatus::Ranking),
            "results" => Some(AuctionStatus::Results),
            _ => None,
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Player,
}

// ---------------------------------------------------------------------------
// Runtime types
// ---------------------------------------------------------------------------

/// The current leading bid for the slot under the hammer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBid {
    pub amount: u32,
    pub bidder_id: String,
    pub bidder_name: String,
}

/// A relisted player offered outside queue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSlot {
    pub slot: PlayerSlot,
    /// Ledger entry this slot re-auctions; its outcome overwrites that entry.
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerResult {
    Sold,
    Unsold,
}

/// One resolved slot in the auction ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPlayer {
    pub id: String,
    pub player_name: String,
    pub category_label: CategoryLabel,
    pub base_price: u32,
    pub result: PlayerResult,
    #[serde(default)]
    pub winner_id: Option<String>,
    #[serde(default)]
    pub winner_name: Option<String>,
    #[serde(default)]
    pub final_bid: Option<u32>,
    pub resolved_at: DateTime<Utc>,
}

/// A row of the final leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub participant_id: String,
    pub name: String,
    pub points: u32,
    pub rank: u32,
}

// ---------------------------------------------------------------------------
// Auction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub id: String,
    pub name: String,
    pub name_lower: String,
    /// Shared join secret. Not an access-control boundary.
    pub password: String,
    pub visibility: Visibility,
    pub max_participants: u32,
    pub players_per_team: u32,
    pub budget_per_player: u32,
    pub categories: Vec<Category>,
    pub total_players: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,

    pub status: AuctionStatus,
    pub participant_count: u32,
    /// Join sequence handed to the next new participant.
    pub next_join_seq: u64,
    /// Queue position. `None` before the auction starts; equals the queue
    /// length once the queue is exhausted.
    pub current_player_index: Option<usize>,
    pub countdown_ends_at: Option<DateTime<Utc>>,
    pub countdown_duration_ms: i64,
    pub active_bid: Option<ActiveBid>,
    pub skip_votes: BTreeSet<String>,
    pub is_paused: bool,
    pub paused_remaining_ms: Option<i64>,
    pub manual_player: Option<ManualSlot>,
    pub relist_count: u32,

    pub completed_players: Vec<CompletedPlayer>,
    pub finalization_open: bool,
    pub results: Option<Vec<ResultEntry>>,
}

impl Auction {
    /// The biddable sequence derived from `categories`.
    pub fn queue(&self) -> Vec<PlayerSlot> {
        build_player_queue(&self.categories)
    }

    /// The slot currently under the hammer. A relisted slot takes precedence
    /// over the queue position.
    pub fn active_slot(&self) -> Option<PlayerSlot> {
        if let Some(manual) = &self.manual_player {
            return Some(manual.slot.clone());
        }
        let index = self.current_player_index?;
        self.queue().into_iter().nth(index)
    }

    /// Smallest acceptable bid for `slot` given the current leader.
    pub fn minimum_bid(&self, slot: &PlayerSlot) -> u32 {
        match &self.active_bid {
            Some(bid) => slot.base_price.max(bid.amount.saturating_add(1)),
            None => slot.base_price,
        }
    }

    /// Whether the queue pointer has moved past the last slot.
    pub fn queue_exhausted(&self) -> bool {
        match self.current_player_index {
            Some(index) => index >= self.queue().len(),
            None => false,
        }
    }

    /// Start a fresh countdown window of `duration` from `now`.
    pub fn open_countdown(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.countdown_ends_at = Some(now + duration);
        self.countdown_duration_ms = duration.num_milliseconds();
    }

    /// Clear everything scoped to one slot's bidding window.
    pub fn clear_round_state(&mut self) {
        self.active_bid = None;
        self.skip_votes.clear();
        self.is_paused = false;
        self.paused_remaining_ms = None;
    }

    /// Move to `ended`, dropping all live-auction runtime state.
    pub fn close_live_phase(&mut self) {
        self.status = AuctionStatus::Ended;
        self.clear_round_state();
        self.manual_player = None;
        self.countdown_ends_at = None;
        self.countdown_duration_ms = 0;
    }

    /// Milliseconds left on the countdown at `now`, never negative.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.is_paused {
            return self.paused_remaining_ms;
        }
        self.countdown_ends_at
            .map(|ends| (ends - now).num_milliseconds().max(0))
    }

    pub fn completed_player(&self, id: &str) -> Option<&CompletedPlayer> {
        self.completed_players.iter().find(|c| c.id == id)
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A player bought at auction, in purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub player_name: String,
    pub category_label: CategoryLabel,
    pub price: u32,
}

/// A bought player placed at a position in the submitted team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalRosterEntry {
    pub player_name: String,
    pub category_label: CategoryLabel,
    pub price: u32,
    /// Free-form position tag (e.g. "GK", "ST", "slot-3").
    pub position: String,
}

/// The curated team a participant submits after the auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalRoster {
    pub sport: String,
    pub formation: String,
    pub players: Vec<FinalRosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub joined_seq: u64,
    pub budget_remaining: u32,
    pub players_needed: u32,
    pub roster: Vec<RosterEntry>,
    pub has_submitted_team: bool,
    #[serde(default)]
    pub final_roster: Option<FinalRoster>,
    pub ranking_submitted: bool,
    /// Points this participant awarded, keyed by target participant id.
    #[serde(default)]
    pub rankings: BTreeMap<String, u32>,
}

impl Participant {
    pub fn new(
        id: &str,
        name: &str,
        role: Role,
        joined_at: DateTime<Utc>,
        joined_seq: u64,
        auction: &Auction,
    ) -> Self {
        Participant {
            id: id.to_string(),
            name: name.to_string(),
            role,
            joined_at,
            joined_seq,
            budget_remaining: auction.budget_per_player,
            players_needed: auction.players_per_team,
            roster: Vec::new(),
            has_submitted_team: false,
            final_roster: None,
            ranking_submitted: false,
            rankings: BTreeMap::new(),
        }
    }

    /// Budget held back so every remaining roster slot can still be filled
    /// at one unit each.
    pub fn reserved_budget(&self) -> u32 {
        self.players_needed.saturating_sub(1)
    }

    /// Largest bid this participant may place, or `None` when their roster
    /// is already full.
    pub fn max_bid(&self) -> Option<u32> {
        if self.players_needed == 0 {
            return None;
        }
        Some(self.budget_remaining.saturating_sub(self.reserved_budget()))
    }

    /// Whether this participant could legally bid `amount` right now.
    pub fn can_afford(&self, amount: u32) -> bool {
        self.max_bid().is_some_and(|max| max >= amount)
    }

    pub fn total_spent(&self) -> u32 {
        self.roster.iter().map(|r| r.price).sum()
    }

    /// Credit a won player: debit the price, append to the roster, and
    /// consume one needed slot.
    pub fn record_win(&mut self, slot: &PlayerSlot, price: u32) {
        self.budget_remaining = self.budget_remaining.saturating_sub(price);
        self.roster.push(RosterEntry {
            player_name: slot.name.clone(),
            category_label: slot.category_label,
            price,
        });
        self.players_needed = self.players_needed.saturating_sub(1);
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ---------------------------------------------------------------------------
// Document group
// ---------------------------------------------------------------------------

/// An auction together with every participant record, read and written as
/// one atomic unit by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionDocument {
    pub auction: Auction,
    pub participants: BTreeMap<String, Participant>,
}

impl AuctionDocument {
    pub fn participant(&self, client_id: &str) -> Option<&Participant> {
        self.participants.get(client_id)
    }

    pub fn participant_mut(&mut self, client_id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(client_id)
    }

    /// Participants in join order.
    pub fn participants_by_join_order(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by(|a, b| a.joined_seq.cmp(&b.joined_seq).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn all_teams_submitted(&self) -> bool {
        !self.participants.is_empty() && self.participants.values().all(|p| p.has_submitted_team)
    }

    pub fn all_rankings_submitted(&self) -> bool {
        !self.participants.is_empty() && self.participants.values().all(|p| p.ranking_submitted)
    }
}

/// A committed document plus its store version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub version: i64,
    pub document: AuctionDocument,
}

impl AuctionSnapshot {
    pub fn auction_id(&self) -> &str {
        &self.document.auction.id
    }

    /// Copy safe to push to clients: the join password is blanked.
    pub fn redacted(&self) -> AuctionSnapshot {
        let mut copy = self.clone();
        copy.document.auction.password = String::new();
        copy
    }
}

/// Lobby-browser view of one auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSummary {
    pub id: String,
    pub name: String,
    pub visibility: Visibility,
    pub status: AuctionStatus,
    pub participant_count: u32,
    pub max_participants: u32,
}

impl From<&Auction> for AuctionSummary {
    fn from(auction: &Auction) -> Self {
        AuctionSummary {
            id: auction.id.clone(),
            name: auction.name.clone(),
            visibility: auction.visibility,
            status: auction.status,
            participant_count: auction.participant_count,
            max_participants: auction.max_participants,
        }
    }
}
