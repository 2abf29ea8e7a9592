// Player queue construction.
//
// The queue is never persisted. It is rebuilt from the auction's categories
// whenever needed, so it must be a pure function of them.

use serde::{Deserialize, Serialize};

use crate::model::{Category, CategoryLabel};

/// One biddable player position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSlot {
    /// Stable key: `{label}-{index within category}`.
    pub key: String,
    pub name: String,
    pub category_label: CategoryLabel,
    pub base_price: u32,
}

/// Flatten categories into draft order: labels A through E, players in the
/// order they were listed.
pub fn build_player_queue(categories: &[Category]) -> Vec<PlayerSlot> {
    let mut ordered: Vec<&Category> = categories.iter().collect();
    ordered.sort_by_key(|c| c.label);

    ordered
        .into_iter()
        .flat_map(|category| {
            category
                .players
                .iter()
                .enumerate()
                .map(move |(index, name)| PlayerSlot {
                    key: format!("{}-{}", category.label, index),
                    name: name.clone(),
                    category_label: category.label,
                    base_price: category.base_price,
                })
        })
        .collect()
}

/// Trim player names, drop blank names, then drop categories left empty.
pub fn normalize_categories(categories: Vec<Category>) -> Vec<Category> {
    categories
        .into_iter()
        .map(|category| Category {
            players: category
                .players
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            ..category
        })
        .filter(|category| !category.players.is_empty())
        .collect()
}

/// The first label that appears more than once, if any.
pub fn duplicate_label(categories: &[Category]) -> Option<CategoryLabel> {
    CategoryLabel::ALL
        .into_iter()
        .find(|label| categories.iter().filter(|c| c.label == *label).count() > 1)
}
