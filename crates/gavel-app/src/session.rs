// Per-connection command dispatch.
//
// A `Session` remembers who is on the other end of a connection and which
// auction they follow, turns each client message into one engine call, and
// renders the result as server messages. Admin-only commands are checked
// against the stored participant role before they reach the engine.

use gavel_core::engine::{AuctionEngine, CreateAuctionInput, FinalizeOptions, SkipOutcome};
use gavel_core::error::{AuctionError, AuctionResult};
use gavel_core::model::AuctionSnapshot;
use tracing::{debug, error, info};

use crate::protocol::{ClientMessage, ServerMessage};

pub struct Session {
    engine: AuctionEngine,
    client_id: Option<String>,
    auction_id: Option<String>,
}

impl Session {
    pub fn new(engine: AuctionEngine) -> Self {
        Session {
            engine,
            client_id: None,
            auction_id: None,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// The auction whose snapshots this connection receives.
    pub fn auction_id(&self) -> Option<&str> {
        self.auction_id.as_deref()
    }

    pub fn follows(&self, auction_id: &str) -> bool {
        self.auction_id.as_deref() == Some(auction_id)
    }

    /// Render a committed snapshot for this connection.
    pub fn snapshot_message(&self, snapshot: &AuctionSnapshot) -> ServerMessage {
        ServerMessage::snapshot(snapshot, self.engine.now())
    }

    /// Latest state of the followed auction, if any. Used to resynchronize
    /// after the update feed lagged.
    pub fn current_snapshot(&self) -> Option<ServerMessage> {
        let auction_id = self.auction_id.as_deref()?;
        match self.engine.snapshot(auction_id) {
            Ok(snapshot) => Some(self.snapshot_message(&snapshot)),
            Err(e) => {
                debug!("Could not reload auction {}: {}", auction_id, e);
                None
            }
        }
    }

    /// Parse and handle one raw text frame.
    pub fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => {
                debug!("Unparseable client message: {}", e);
                vec![ServerMessage::error("Unrecognized message.")]
            }
        }
    }

    /// Handle one client message. Failures become a single `ERROR` reply.
    pub fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        let action = msg.action();
        match self.dispatch(msg) {
            Ok(replies) => replies,
            Err(AuctionError::Storage(e)) => {
                error!("Storage failure during {}: {:#}", action, e);
                vec![ServerMessage::error("Something went wrong; please try again.")]
            }
            Err(e) => {
                debug!("{} rejected: {}", action, e);
                vec![ServerMessage::error(e.to_string())]
            }
        }
    }

    fn dispatch(&mut self, msg: ClientMessage) -> AuctionResult<Vec<ServerMessage>> {
        let action = msg.action();

        // Messages that need no identity.
        match msg {
            ClientMessage::Hello { client_id } => {
                let client_id = client_id.trim().to_string();
                if client_id.is_empty() {
                    return Ok(vec![ServerMessage::error("Client id cannot be empty.")]);
                }
                info!("Client {} connected", client_id);
                self.client_id = Some(client_id.clone());
                return Ok(vec![ServerMessage::Welcome { client_id }]);
            }
            ClientMessage::Heartbeat => return Ok(vec![ServerMessage::ack(action)]),
            ClientMessage::ListAuctions => {
                return Ok(vec![ServerMessage::AuctionList {
                    auctions: self.engine.list_auctions()?,
                }]);
            }
            _ => {}
        }

        let Some(client_id) = self.client_id.clone() else {
            return Ok(vec![ServerMessage::error("Say hello before sending commands.")]);
        };

        // Messages that pick the followed auction.
        match msg {
            ClientMessage::CreateAuction(payload) => {
                let auction_id = self.engine.create(CreateAuctionInput {
                    name: payload.name,
                    password: payload.password,
                    visibility: payload.visibility,
                    max_participants: payload.max_participants,
                    players_per_team: payload.players_per_team,
                    budget_per_player: payload.budget_per_player,
                    categories: payload.categories,
                    creator_id: client_id,
                    creator_name: payload.display_name,
                })?;
                return self.follow(action, auction_id);
            }
            ClientMessage::JoinAuction {
                auction_id,
                password,
                display_name,
            } => {
                self.engine
                    .join(&auction_id, &password, &client_id, &display_name)?;
                return self.follow(action, auction_id);
            }
            _ => {}
        }

        let Some(auction_id) = self.auction_id.clone() else {
            return Ok(vec![ServerMessage::error("Join an auction first.")]);
        };
        if msg.requires_admin() {
            self.engine.require_admin(&auction_id, &client_id)?;
        }

        let reply = match msg {
            ClientMessage::LeaveAuction => {
                self.engine.leave(&auction_id, &client_id)?;
                self.auction_id = None;
                ServerMessage::ack(action)
            }
            ClientMessage::StartAuction => {
                self.engine.start(&auction_id)?;
                ServerMessage::ack(action)
            }
            ClientMessage::PlaceBid { amount } => {
                // A blank name makes the engine use the stored display name.
                let receipt = self
                    .engine
                    .place_bid(&auction_id, &client_id, "", amount)?;
                ServerMessage::ack_with(action, &receipt)
            }
            ClientMessage::Skip => match self.engine.skip(&auction_id, &client_id)? {
                SkipOutcome::Ignored => {
                    ServerMessage::error("Skipping is not possible right now.")
                }
                outcome => ServerMessage::ack_with(action, &outcome),
            },
            ClientMessage::PauseAuction => {
                self.engine.pause(&auction_id)?;
                ServerMessage::ack(action)
            }
            ClientMessage::ResumeAuction => {
                self.engine.resume(&auction_id)?;
                ServerMessage::ack(action)
            }
            ClientMessage::FinalizePlayer { force_unsold } => {
                let outcome = self.engine.finalize_current_player(
                    &auction_id,
                    FinalizeOptions {
                        force_unsold,
                        ..FinalizeOptions::default()
                    },
                )?;
                ServerMessage::ack_with(action, &outcome)
            }
            ClientMessage::RelistPlayer {
                completed_player_id,
            } => {
                let slot = self
                    .engine
                    .relist_unsold_player(&auction_id, &completed_player_id)?;
                ServerMessage::ack_with(action, &slot)
            }
            ClientMessage::EndAuction => {
                let ended = self.engine.end_auction(&auction_id)?;
                ServerMessage::ack_with(action, &ended)
            }
            ClientMessage::OpenFinalization => {
                let opened = self.engine.open_finalization_phase(&auction_id)?;
                ServerMessage::ack_with(action, &opened)
            }
            ClientMessage::SubmitTeam { final_roster } => {
                self.engine
                    .submit_team(&auction_id, &client_id, final_roster)?;
                ServerMessage::ack(action)
            }
            ClientMessage::MarkRanking => {
                let moved = self.engine.mark_auction_as_ranking(&auction_id)?;
                ServerMessage::ack_with(action, &moved)
            }
            ClientMessage::SubmitRanking { ranking_order } => {
                let points = self
                    .engine
                    .submit_ranking(&auction_id, &client_id, &ranking_order)?;
                ServerMessage::ack_with(action, &points)
            }
            ClientMessage::FinalizeResults => {
                let results = self.engine.finalize_results(&auction_id)?;
                ServerMessage::ack_with(action, &results)
            }
            ClientMessage::Hello { .. }
            | ClientMessage::Heartbeat
            | ClientMessage::ListAuctions
            | ClientMessage::CreateAuction(_)
            | ClientMessage::JoinAuction { .. } => ServerMessage::ack(action),
        };
        Ok(vec![reply])
    }

    /// Start following `auction_id` and send its current state right away.
    fn follow(&mut self, action: &str, auction_id: String) -> AuctionResult<Vec<ServerMessage>> {
        let snapshot = self.engine.snapshot(&auction_id)?;
        self.auction_id = Some(auction_id.clone());
        Ok(vec![
            ServerMessage::ack_with(action, &auction_id),
            self.snapshot_message(&snapshot),
        ])
    }
}
