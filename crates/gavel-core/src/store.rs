// SQLite document store for auctions and participant records.
//
// Each auction row carries a `version`. `transact` reads the auction and all
// of its participants, applies a closure to a private copy, and commits with
// a compare-and-swap on that version. A lost race re-runs the closure against
// the winner's state, so no transaction ever overwrites a value it did not
// read.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{AuctionError, AuctionResult};
use crate::model::{
    Auction, AuctionDocument, AuctionSnapshot, AuctionStatus, AuctionSummary, Participant,
};

/// How many times a conflicting transaction is replayed before giving up.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 16;

/// Capacity of the committed-snapshot broadcast channel. Slow subscribers
/// skip ahead to newer snapshots rather than blocking writers.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// SQLite-backed store of auction documents with optimistic transactions
/// and a push feed of committed snapshots.
pub struct Database {
    conn: Mutex<Connection>,
    updates: broadcast::Sender<Arc<AuctionSnapshot>>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS auctions (
                id          TEXT PRIMARY KEY,
                name_lower  TEXT NOT NULL UNIQUE,
                visibility  TEXT NOT NULL,
                status      TEXT NOT NULL,
                version     INTEGER NOT NULL,
                document    TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS participants (
                auction_id  TEXT NOT NULL REFERENCES auctions(id) ON DELETE CASCADE,
                client_id   TEXT NOT NULL,
                joined_seq  INTEGER NOT NULL,
                document    TEXT NOT NULL,
                PRIMARY KEY (auction_id, client_id)
            );

            CREATE INDEX IF NOT EXISTS idx_auctions_status ON auctions(status);
            ",
        )
        .context("failed to create database schema")?;

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Ok(Self {
            conn: Mutex::new(conn),
            updates,
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Receive every snapshot committed from now on, across all auctions.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AuctionSnapshot>> {
        self.updates.subscribe()
    }

    fn publish(&self, snapshot: AuctionSnapshot) {
        // No subscribers is not an error.
        let _ = self.updates.send(Arc::new(snapshot));
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the latest committed document group for `auction_id`, or `None`
    /// if no such auction exists.
    pub fn read(&self, auction_id: &str) -> Result<Option<AuctionSnapshot>> {
        let conn = self.conn();

        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, document FROM auctions WHERE id = ?1",
                params![auction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query auction")?;

        let Some((version, auction_json)) = row else {
            return Ok(None);
        };
        let auction: Auction =
            serde_json::from_str(&auction_json).context("failed to deserialize auction")?;

        let mut stmt = conn
            .prepare(
                "SELECT document FROM participants WHERE auction_id = ?1 ORDER BY joined_seq",
            )
            .context("failed to prepare participants query")?;
        let rows = stmt
            .query_map(params![auction_id], |row| row.get::<_, String>(0))
            .context("failed to query participants")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map participant rows")?;

        let mut participants = std::collections::BTreeMap::new();
        for json in rows {
            let participant: Participant =
                serde_json::from_str(&json).context("failed to deserialize participant")?;
            participants.insert(participant.id.clone(), participant);
        }

        Ok(Some(AuctionSnapshot {
            version,
            document: AuctionDocument {
                auction,
                participants,
            },
        }))
    }

    /// Like [`Database::read`], but a missing auction is an `AuctionNotFound`.
    pub fn load(&self, auction_id: &str) -> AuctionResult<AuctionSnapshot> {
        self.read(auction_id)?
            .ok_or_else(|| AuctionError::AuctionNotFound {
                auction_id: auction_id.to_string(),
            })
    }

    /// Whether an auction with this case-folded name exists.
    pub fn name_taken(&self, name_lower: &str) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM auctions WHERE name_lower = ?1)",
                params![name_lower],
                |row| row.get(0),
            )
            .context("failed to check auction name")?;
        Ok(exists)
    }

    /// Summaries of every auction, oldest first.
    pub fn list_auctions(&self) -> Result<Vec<AuctionSummary>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT document FROM auctions ORDER BY created_at, id")
            .context("failed to prepare list_auctions query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query auctions")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map auction rows")?;

        rows.iter()
            .map(|json| {
                let auction: Auction =
                    serde_json::from_str(json).context("failed to deserialize auction")?;
                Ok(AuctionSummary::from(&auction))
            })
            .collect()
    }

    /// Ids of auctions the automation driver has to watch.
    pub fn active_auction_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM auctions WHERE status IN (?1, ?2, ?3) ORDER BY created_at, id",
            )
            .context("failed to prepare active_auction_ids query")?;
        let ids = stmt
            .query_map(
                params![
                    AuctionStatus::Live.as_str(),
                    AuctionStatus::Ended.as_str(),
                    AuctionStatus::Ranking.as_str(),
                ],
                |row| row.get(0),
            )
            .context("failed to query active auctions")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to map active auction rows")?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a brand-new document group at version 1. The unique index on
    /// `name_lower` is the final word on name collisions.
    pub fn create_auction(&self, document: &AuctionDocument) -> AuctionResult<AuctionSnapshot> {
        let auction = &document.auction;
        let auction_json =
            serde_json::to_string(auction).context("failed to serialize auction")?;

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("failed to begin create transaction")?;

        let inserted = tx.execute(
            "INSERT INTO auctions (id, name_lower, visibility, status, version, document)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                auction.id,
                auction.name_lower,
                auction.visibility.as_str(),
                auction.status.as_str(),
                auction_json,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, Some(message)))
                if e.code == ErrorCode::ConstraintViolation
                    && message.contains("name_lower") =>
            {
                return Err(AuctionError::DuplicateName {
                    name: auction.name.clone(),
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("failed to insert auction")
                    .into());
            }
        }

        for participant in document.participants.values() {
            insert_participant(&tx, &auction.id, participant)?;
        }

        tx.commit().context("failed to commit create_auction")?;

        let snapshot = AuctionSnapshot {
            version: 1,
            document: document.clone(),
        };
        self.publish(snapshot.clone());
        drop(conn);
        Ok(snapshot)
    }

    /// Run `apply` as one atomic read-modify-write over the auction and its
    /// participants.
    ///
    /// `apply` may run several times if other writers commit in between; it
    /// must derive everything from the document it is handed. Returning an
    /// error aborts without writing. A closure that leaves the document
    /// unchanged commits nothing and publishes nothing.
    pub fn transact<T, F>(&self, auction_id: &str, mut apply: F) -> AuctionResult<T>
    where
        F: FnMut(&mut AuctionDocument) -> AuctionResult<T>,
    {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let before = self.load(auction_id)?;
            let mut working = before.document.clone();
            let value = apply(&mut working)?;

            if working == before.document {
                return Ok(value);
            }

            match self.commit(&before, working)? {
                Some(_) => return Ok(value),
                None => {
                    debug!(
                        "Write conflict on auction {} (attempt {}), retrying",
                        auction_id, attempt
                    );
                }
            }
        }

        warn!(
            "Giving up on auction {} after {} conflicting attempts",
            auction_id, MAX_TRANSACTION_ATTEMPTS
        );
        Err(AuctionError::Contention {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    /// Write `after` if the stored version still matches `before`. Returns
    /// the new version, or `None` on a version conflict (nothing written).
    ///
    /// The snapshot is published before the connection lock is released, so
    /// subscribers see commits in version order.
    fn commit(&self, before: &AuctionSnapshot, after: AuctionDocument) -> Result<Option<i64>> {
        let auction = &after.auction;
        let auction_json =
            serde_json::to_string(auction).context("failed to serialize auction")?;

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin commit transaction")?;

        let updated = tx
            .execute(
                "UPDATE auctions
                    SET document = ?1,
                        status = ?2,
                        version = version + 1,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                  WHERE id = ?3 AND version = ?4",
                params![auction_json, auction.status.as_str(), auction.id, before.version],
            )
            .context("failed to update auction")?;

        if updated == 0 {
            // Dropping `tx` rolls back.
            return Ok(None);
        }

        let previous = &before.document.participants;
        for (client_id, participant) in &after.participants {
            if previous.get(client_id) != Some(participant) {
                upsert_participant(&tx, &auction.id, participant)?;
            }
        }
        for client_id in previous.keys() {
            if !after.participants.contains_key(client_id) {
                tx.execute(
                    "DELETE FROM participants WHERE auction_id = ?1 AND client_id = ?2",
                    params![auction.id, client_id],
                )
                .context("failed to delete participant")?;
            }
        }

        tx.commit().context("failed to commit auction transaction")?;

        let version = before.version + 1;
        self.publish(AuctionSnapshot {
            version,
            document: after,
        });
        drop(conn);
        Ok(Some(version))
    }
}

fn insert_participant(
    tx: &rusqlite::Transaction<'_>,
    auction_id: &str,
    participant: &Participant,
) -> Result<()> {
    let json = serde_json::to_string(participant).context("failed to serialize participant")?;
    tx.execute(
        "INSERT INTO participants (auction_id, client_id, joined_seq, document)
         VALUES (?1, ?2, ?3, ?4)",
        params![auction_id, participant.id, participant.joined_seq as i64, json],
    )
    .context("failed to insert participant")?;
    Ok(())
}

fn upsert_participant(
    tx: &rusqlite::Transaction<'_>,
    auction_id: &str,
    participant: &Participant,
) -> Result<()> {
    let json = serde_json::to_string(participant).context("failed to serialize participant")?;
    tx.execute(
        "INSERT INTO participants (auction_id, client_id, joined_seq, document)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(auction_id, client_id) DO UPDATE SET
            joined_seq = excluded.joined_seq,
            document   = excluded.document",
        params![auction_id, participant.id, participant.joined_seq as i64, json],
    )
    .context("failed to upsert participant")?;
    Ok(())
}
