use crate::{Card, CardId, CoreError};
use std::collections::HashSet;

/// Position for a card appended to a deck: one past the current maximum,
/// zero for an empty deck.
pub fn next_position<'a, I>(cards: I) -> u32
where
    I: IntoIterator<Item = &'a Card>,
{
    cards
        .into_iter()
        .map(|c| c.position + 1)
        .max()
        .unwrap_or(0)
}

/// A reorder request must list exactly the deck's current card set, each
/// id once.
pub fn validate_reorder<'a, I>(cards: I, ordered: &[CardId]) -> Result<(), CoreError>
where
    I: IntoIterator<Item = &'a Card>,
{
    let current: HashSet<CardId> = cards.into_iter().map(|c| c.id).collect();
    if ordered.len() != current.len() {
        return Err(CoreError::Invalid("reorder list does not match deck"));
    }
    let mut seen: HashSet<CardId> = HashSet::with_capacity(ordered.len());
    for id in ordered {
        if !seen.insert(*id) {
            return Err(CoreError::Invalid("duplicate card id in reorder list"));
        }
        if !current.contains(id) {
            return Err(CoreError::Invalid("reorder list does not match deck"));
        }
    }
    Ok(())
}

/// Dense renumbering after a delete: every position above the removed slot
/// shifts down by one, so a deck's positions stay {0..N-1} at all times.
pub fn shift_after_removal<'a, I>(cards: I, removed_position: u32)
where
    I: IntoIterator<Item = &'a mut Card>,
{
    for card in cards {
        if card.position > removed_position {
            card.position -= 1;
        }
    }
}
