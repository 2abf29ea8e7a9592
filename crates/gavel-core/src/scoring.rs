// Peer-ranking points and the final leaderboard.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AuctionError, AuctionResult};
use crate::model::{AuctionDocument, ResultEntry};

/// Points for the target at 0-based position `index` in a ranking submitted
/// in a field of `participant_count`. Never below 1.
pub fn ranking_points(index: usize, participant_count: u32) -> u32 {
    let raw = participant_count as i64 - 1 - index as i64;
    raw.max(1) as u32
}

/// Convert an ordered list of target ids (best first) into a points map.
pub fn points_for_order(order: &[String], participant_count: u32) -> BTreeMap<String, u32> {
    order
        .iter()
        .enumerate()
        .map(|(i, target)| (target.clone(), ranking_points(i, participant_count)))
        .collect()
}

/// A ranking must name every other participant exactly once and never the
/// submitter.
pub fn validate_ranking_order(
    doc: &AuctionDocument,
    submitter_id: &str,
    order: &[String],
) -> AuctionResult<()> {
    let invalid = |message: String| Err(AuctionError::InvalidRanking { message });

    let mut seen = BTreeSet::new();
    for target in order {
        if target == submitter_id {
            return invalid("you cannot rank yourself".into());
        }
        if !doc.participants.contains_key(target) {
            return invalid(format!("{target} is not a participant"));
        }
        if !seen.insert(target.as_str()) {
            return invalid(format!("{target} is ranked more than once"));
        }
    }

    let expected = doc.participants.len().saturating_sub(1);
    if seen.len() != expected {
        return invalid(format!(
            "expected {expected} participants, got {}",
            seen.len()
        ));
    }
    Ok(())
}

/// Sum every participant's received points across all submitted rankings
/// and order the leaderboard: points descending, then join order, then id.
/// Ranks are 1-based and sequential.
pub fn tally_results(doc: &AuctionDocument) -> Vec<ResultEntry> {
    let mut totals: BTreeMap<&str, u32> = doc
        .participants
        .keys()
        .map(|id| (id.as_str(), 0))
        .collect();

    for submitter in doc.participants.values().filter(|p| p.ranking_submitted) {
        for (target, points) in &submitter.rankings {
            if let Some(total) = totals.get_mut(target.as_str()) {
                *total += points;
            }
        }
    }

    let mut ordered = doc.participants_by_join_order();
    // Stable sort keeps join order (then id) among equal totals.
    ordered.sort_by(|a, b| totals[b.id.as_str()].cmp(&totals[a.id.as_str()]));

    ordered
        .into_iter()
        .enumerate()
        .map(|(i, p)| ResultEntry {
            participant_id: p.id.clone(),
            name: p.name.clone(),
            points: totals[p.id.as_str()],
            rank: i as u32 + 1,
        })
        .collect()
}
