// Error taxonomy for auction operations.
//
// Every message is written to be shown to the end user verbatim.

use thiserror::Error;

use crate::model::{AuctionStatus, CategoryLabel};

#[derive(Debug, Error)]
pub enum AuctionError {
    // -- validation ----------------------------------------------------------
    #[error("Auction name cannot be empty.")]
    EmptyName,

    #[error("An auction named \"{name}\" already exists.")]
    DuplicateName { name: String },

    #[error("Category {label} is listed more than once.")]
    DuplicateCategory { label: CategoryLabel },

    #[error("Add at least one player before creating the auction.")]
    NoPlayers,

    #[error("Invalid auction settings: {message}")]
    InvalidSettings { message: String },

    #[error("Display name cannot be empty.")]
    EmptyDisplayName,

    #[error("Auction not found.")]
    AuctionNotFound { auction_id: String },

    #[error("Incorrect auction password.")]
    WrongPassword,

    #[error("This auction is full ({max_participants} participants).")]
    AuctionFull { max_participants: u32 },

    #[error("This auction has already started; new participants can no longer join.")]
    AuctionAlreadyStarted,

    #[error("You are not a participant in this auction.")]
    NotAParticipant,

    #[error("Only the auction admin can do that.")]
    NotAdmin,

    #[error("The auction admin cannot leave their own auction.")]
    AdminCannotLeave,

    // -- state preconditions -------------------------------------------------
    #[error("Cannot {action} while the auction is in the {status} phase.")]
    InvalidState {
        action: &'static str,
        status: AuctionStatus,
    },

    #[error("The auction is paused.")]
    Paused,

    #[error("The auction is not paused.")]
    NotPaused,

    #[error("There are no players to auction.")]
    EmptyQueue,

    #[error("No player is currently up for bidding.")]
    NoActivePlayer,

    #[error("Another relisted player is already up for bidding.")]
    ManualSlotActive,

    #[error("Team submission is not open yet.")]
    FinalizationClosed,

    #[error("Team submission has already opened; players can no longer be relisted.")]
    FinalizationStarted,

    // -- business rules ------------------------------------------------------
    #[error("Bid must be at least {minimum}.")]
    BidTooLow { minimum: u32 },

    #[error("Bid exceeds your remaining budget of {budget_remaining}.")]
    InsufficientBudget { budget_remaining: u32 },

    #[error(
        "That bid would strand your roster: with {slots_to_fill} more players to buy you can bid at most {max_bid}."
    )]
    WouldStrandRoster { max_bid: u32, slots_to_fill: u32 },

    #[error("Your roster is already full.")]
    RosterFull,

    #[error("That player is not in the auction history.")]
    UnknownCompletedPlayer { completed_player_id: String },

    #[error("Only unsold players can be relisted.")]
    NotRelistable,

    #[error("You have already submitted your team.")]
    TeamAlreadySubmitted,

    #[error("Invalid final roster: {message}")]
    InvalidFinalRoster { message: String },

    #[error("You have already submitted your ranking.")]
    RankingAlreadySubmitted,

    #[error("Invalid ranking: {message}")]
    InvalidRanking { message: String },

    // -- storage -------------------------------------------------------------
    #[error("The auction is busy right now; please try again.")]
    Contention { attempts: usize },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type AuctionResult<T> = Result<T, AuctionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_boundary_values() {
        let err = AuctionError::BidTooLow { minimum: 16 };
        assert_eq!(err.to_string(), "Bid must be at least 16.");

        let err = AuctionError::InsufficientBudget {
            budget_remaining: 42,
        };
        assert_eq!(
            err.to_string(),
            "Bid exceeds your remaining budget of 42."
        );
    }

    #[test]
    fn invalid_state_names_the_phase() {
        let err = AuctionError::InvalidState {
            action: "start the auction",
            status: AuctionStatus::Live,
        };
        assert_eq!(
            err.to_string(),
            "Cannot start the auction while the auction is in the live phase."
        );
    }

    #[test]
    fn storage_errors_are_transparent() {
        let err: AuctionError = anyhow::anyhow!("disk I/O error").into();
        assert_eq!(err.to_string(), "disk I/O error");
    }
}
