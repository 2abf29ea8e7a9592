// Wire protocol between auction clients and the server.
//
// Every frame is a JSON text message shaped `{"type": "...", "payload": {...}}`.
// Payload field names are camelCase, matching the persisted documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gavel_core::model::{AuctionSnapshot, AuctionSummary, Category, FinalRoster, Visibility};

/// Settings for a new auction, as sent by the creating client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuctionPayload {
    pub name: String,
    pub password: String,
    pub visibility: Visibility,
    pub max_participants: u32,
    pub players_per_team: u32,
    pub budget_per_player: u32,
    pub categories: Vec<Category>,
    /// Display name of the creator, who becomes the admin.
    pub display_name: String,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// First message on a connection: the client's stable device id.
    #[serde(rename_all = "camelCase")]
    Hello { client_id: String },
    ListAuctions,
    CreateAuction(CreateAuctionPayload),
    #[serde(rename_all = "camelCase")]
    JoinAuction {
        auction_id: String,
        password: String,
        display_name: String,
    },
    LeaveAuction,
    StartAuction,
    PlaceBid { amount: u32 },
    Skip,
    PauseAuction,
    ResumeAuction,
    /// Admin force-resolve of the player under the hammer.
    #[serde(rename_all = "camelCase")]
    FinalizePlayer {
        #[serde(default)]
        force_unsold: bool,
    },
    #[serde(rename_all = "camelCase")]
    RelistPlayer { completed_player_id: String },
    EndAuction,
    OpenFinalization,
    #[serde(rename_all = "camelCase")]
    SubmitTeam {
        #[serde(default)]
        final_roster: Option<FinalRoster>,
    },
    MarkRanking,
    #[serde(rename_all = "camelCase")]
    SubmitRanking { ranking_order: Vec<String> },
    FinalizeResults,
    Heartbeat,
}

impl ClientMessage {
    /// Whether only the auction admin may send this message.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            ClientMessage::StartAuction
                | ClientMessage::PauseAuction
                | ClientMessage::ResumeAuction
                | ClientMessage::FinalizePlayer { .. }
                | ClientMessage::RelistPlayer { .. }
                | ClientMessage::EndAuction
                | ClientMessage::OpenFinalization
                | ClientMessage::MarkRanking
                | ClientMessage::FinalizeResults
        )
    }

    /// Short name used in acknowledgements and logs.
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::ListAuctions => "listAuctions",
            ClientMessage::CreateAuction(_) => "createAuction",
            ClientMessage::JoinAuction { .. } => "joinAuction",
            ClientMessage::LeaveAuction => "leaveAuction",
            ClientMessage::StartAuction => "startAuction",
            ClientMessage::PlaceBid { .. } => "placeBid",
            ClientMessage::Skip => "skip",
            ClientMessage::PauseAuction => "pauseAuction",
            ClientMessage::ResumeAuction => "resumeAuction",
            ClientMessage::FinalizePlayer { .. } => "finalizePlayer",
            ClientMessage::RelistPlayer { .. } => "relistPlayer",
            ClientMessage::EndAuction => "endAuction",
            ClientMessage::OpenFinalization => "openFinalization",
            ClientMessage::SubmitTeam { .. } => "submitTeam",
            ClientMessage::MarkRanking => "markRanking",
            ClientMessage::SubmitRanking { .. } => "submitRanking",
            ClientMessage::FinalizeResults => "finalizeResults",
            ClientMessage::Heartbeat => "heartbeat",
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { client_id: String },
    /// A command succeeded. `result` carries operation-specific data.
    Ack {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// A command failed. `message` is meant to be shown verbatim.
    Error { message: String },
    /// Latest committed state of the auction this connection follows.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        auction: AuctionSnapshot,
        server_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining_ms: Option<i64>,
    },
    AuctionList { auctions: Vec<AuctionSummary> },
}

impl ServerMessage {
    pub fn ack(action: &str) -> Self {
        ServerMessage::Ack {
            action: action.to_string(),
            result: None,
        }
    }

    pub fn ack_with<T: Serialize>(action: &str, result: &T) -> Self {
        ServerMessage::Ack {
            action: action.to_string(),
            result: serde_json::to_value(result).ok(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Snapshot message with the join password stripped.
    pub fn snapshot(snapshot: &AuctionSnapshot, now: DateTime<Utc>) -> Self {
        let auction = snapshot.redacted();
        let remaining_ms = auction.document.auction.remaining_ms(now);
        ServerMessage::Snapshot {
            auction,
            server_time: now,
            remaining_ms,
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"ERROR\"}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_bid_parses_from_wire_shape() {
        let json = r#"{"type": "PLACE_BID", "payload": {"amount": 25}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ClientMessage::PlaceBid { amount: 25 });
        assert!(!msg.requires_admin());
    }

    #[test]
    fn unit_commands_need_no_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "START_AUCTION"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartAuction);
        assert!(msg.requires_admin());
    }

    #[test]
    fn payload_fields_are_camel_case() {
        let json = r#"{
            "type": "JOIN_AUCTION",
            "payload": {"auctionId": "a1", "password": "pw", "displayName": "Bob"}
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinAuction {
                auction_id: "a1".into(),
                password: "pw".into(),
                display_name: "Bob".into(),
            }
        );
    }

    #[test]
    fn create_auction_payload_carries_categories() {
        let json = r#"{
            "type": "CREATE_AUCTION",
            "payload": {
                "name": "Derby",
                "password": "pw",
                "visibility": "public",
                "maxParticipants": 4,
                "playersPerTeam": 2,
                "budgetPerPlayer": 100,
                "categories": [{"label": "A", "basePrice": 10, "players": ["X", "Y"]}],
                "displayName": "Admin"
            }
        }"#;
        let ClientMessage::CreateAuction(payload) = serde_json::from_str(json).unwrap() else {
            panic!("expected CreateAuction");
        };
        assert_eq!(payload.visibility, Visibility::Public);
        assert_eq!(payload.categories[0].players.len(), 2);
    }

    #[test]
    fn finalize_player_defaults_to_a_sale() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "FINALIZE_PLAYER", "payload": {}}"#).unwrap();
        assert_eq!(msg, ClientMessage::FinalizePlayer { force_unsold: false });
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "DROP_TABLES"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "PLACE_BID"}"#).is_err());
    }

    #[test]
    fn error_message_serializes_with_type_tag() {
        let json = ServerMessage::error("Bid must be at least 16.").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["message"], "Bid must be at least 16.");
    }

    #[test]
    fn ack_without_result_omits_the_field() {
        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::ack("skip").to_json()).unwrap();
        assert_eq!(value["payload"]["action"], "skip");
        assert!(value["payload"].get("result").is_none());
    }
}
