use crate::{
    Card, CardContent, CardId, CardProgress, CoreError, Deck, DeckId, DeckPatch, DueCard, Grade,
    NewDeck, SessionId, StudySession, Tag, TagId, UserId, UserStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;

/// Storage contract of the engine. Every method is one atomic logical
/// operation: implementations must not let a read-modify-write interleave
/// with a concurrent operation on the same deck or card, and multi-step
/// mutations (cascade delete, reorder, grade recording) commit fully or
/// not at all. Ownership checks are folded into existence checks, so a
/// record belonging to another user reports `NotFound`.
#[async_trait]
pub trait Repository: Send + Sync {
    // Decks
    async fn create_deck(&self, user_id: UserId, new: NewDeck) -> Result<Deck, CoreError>;
    async fn get_deck(&self, user_id: UserId, id: DeckId) -> Result<Deck, CoreError>;
    async fn list_decks(&self, user_id: UserId) -> Result<Vec<Deck>, CoreError>;
    async fn update_deck(
        &self,
        user_id: UserId,
        id: DeckId,
        patch: DeckPatch,
    ) -> Result<Deck, CoreError>;
    /// Cascade: removes the deck's cards, every user's progress on those
    /// cards, and the deck's tag links in the same transaction.
    async fn delete_deck(&self, user_id: UserId, id: DeckId) -> Result<(), CoreError>;

    // Cards
    /// Appends at the next free position and bumps the deck's card count.
    async fn add_card(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        content: CardContent,
    ) -> Result<Card, CoreError>;
    async fn get_card(&self, user_id: UserId, id: CardId) -> Result<Card, CoreError>;
    /// Cards of one deck in position order.
    async fn list_cards(&self, user_id: UserId, deck_id: DeckId) -> Result<Vec<Card>, CoreError>;
    async fn update_card(
        &self,
        user_id: UserId,
        id: CardId,
        content: CardContent,
    ) -> Result<Card, CoreError>;
    /// Removes the card and its progress records, decrements the deck's
    /// card count, and renumbers the remaining positions densely.
    async fn delete_card(&self, user_id: UserId, id: CardId) -> Result<(), CoreError>;
    /// `ordered` must be exactly the deck's current card set; position
    /// becomes the index in the list.
    async fn reorder_cards(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        ordered: &[CardId],
    ) -> Result<(), CoreError>;

    // Tags
    async fn create_tag(
        &self,
        user_id: UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Tag, CoreError>;
    async fn list_tags(&self, user_id: UserId) -> Result<Vec<Tag>, CoreError>;
    async fn tag_deck(&self, user_id: UserId, deck_id: DeckId, tag_id: TagId)
        -> Result<(), CoreError>;
    async fn untag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError>;
    async fn list_deck_tags(&self, user_id: UserId, deck_id: DeckId)
        -> Result<Vec<Tag>, CoreError>;

    // Progress
    /// Returns the existing record or creates the initial one (status new,
    /// ease 2.5, interval 0, due now). Idempotent for a given (user, card).
    async fn get_or_create_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError>;
    async fn get_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
    ) -> Result<Option<CardProgress>, CoreError>;
    /// Loads (or lazily creates) the progress record, applies the
    /// scheduler, and persists the result, all in one transaction.
    async fn record_grade(
        &self,
        user_id: UserId,
        card_id: CardId,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError>;
    /// Cards with `next_review_at <= now`, earliest due first, ties broken
    /// by card creation order; optionally scoped to one deck.
    async fn due_queue(
        &self,
        user_id: UserId,
        deck_id: Option<DeckId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCard>, CoreError>;

    // Sessions & stats
    /// Opens a session; a dangling open session for the user is first
    /// closed at zero duration (no stats effects).
    async fn start_session(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError>;
    async fn record_answer(
        &self,
        user_id: UserId,
        session_id: SessionId,
        correct: bool,
    ) -> Result<StudySession, CoreError>;
    /// Sets `ended_at` and folds the session into the user's stats in the
    /// same transaction. Ending twice is an error.
    async fn end_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError>;
    async fn get_stats(&self, user_id: UserId) -> Result<Option<UserStats>, CoreError>;
}
