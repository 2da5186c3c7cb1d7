use crate::consistency::{next_position, shift_after_removal, validate_reorder};
use crate::scheduler::apply_grade;
use crate::stats::apply_session_close;
use crate::{
    Card, CardContent, CardId, CardProgress, CoreError, Deck, DeckId, DeckPatch, DueCard, Grade,
    NewDeck, SessionId, StudySession, Tag, TagId, UserId, UserStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct State {
    decks: HashMap<DeckId, Deck>,
    cards: HashMap<CardId, Card>,
    progress: HashMap<(UserId, CardId), CardProgress>,
    sessions: HashMap<SessionId, StudySession>,
    stats: HashMap<UserId, UserStats>,
    tags: HashMap<TagId, Tag>,
    deck_tags: HashSet<(DeckId, TagId)>,
}

/// Reference store. One lock acquisition per logical operation keeps every
/// multi-step mutation atomic with respect to concurrent callers.
#[derive(Default)]
pub struct MemoryRepo {
    state: RwLock<State>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned_deck<'a>(
    decks: &'a HashMap<DeckId, Deck>,
    user_id: UserId,
    id: DeckId,
) -> Result<&'a Deck, CoreError> {
    decks
        .get(&id)
        .filter(|d| d.user_id == user_id)
        .ok_or(CoreError::NotFound("deck"))
}

fn owned_deck_mut<'a>(
    decks: &'a mut HashMap<DeckId, Deck>,
    user_id: UserId,
    id: DeckId,
) -> Result<&'a mut Deck, CoreError> {
    decks
        .get_mut(&id)
        .filter(|d| d.user_id == user_id)
        .ok_or(CoreError::NotFound("deck"))
}

/// Card ownership is the owning deck's ownership; a foreign card reports
/// NotFound rather than leaking its existence.
fn owned_card<'a>(
    decks: &HashMap<DeckId, Deck>,
    cards: &'a HashMap<CardId, Card>,
    user_id: UserId,
    id: CardId,
) -> Result<&'a Card, CoreError> {
    let card = cards.get(&id).ok_or(CoreError::NotFound("card"))?;
    match decks.get(&card.deck_id) {
        Some(d) if d.user_id == user_id => Ok(card),
        _ => Err(CoreError::NotFound("card")),
    }
}

#[async_trait]
impl crate::repo::Repository for MemoryRepo {
    async fn create_deck(&self, user_id: UserId, new: NewDeck) -> Result<Deck, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        if s.decks
            .values()
            .any(|d| d.user_id == user_id && d.name.eq_ignore_ascii_case(&new.name))
        {
            return Err(CoreError::Conflict("deck name already exists"));
        }
        let deck = Deck::new(user_id, new);
        s.decks.insert(deck.id, deck.clone());
        Ok(deck)
    }

    async fn get_deck(&self, user_id: UserId, id: DeckId) -> Result<Deck, CoreError> {
        let guard = self.state.read();
        owned_deck(&guard.decks, user_id, id).cloned()
    }

    async fn list_decks(&self, user_id: UserId) -> Result<Vec<Deck>, CoreError> {
        let guard = self.state.read();
        let mut v: Vec<Deck> = guard
            .decks
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        v.sort_by_key(|d| std::cmp::Reverse(d.updated_at));
        Ok(v)
    }

    async fn update_deck(
        &self,
        user_id: UserId,
        id: DeckId,
        patch: DeckPatch,
    ) -> Result<Deck, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        if let Some(name) = &patch.name {
            if s.decks
                .values()
                .any(|d| d.id != id && d.user_id == user_id && d.name.eq_ignore_ascii_case(name))
            {
                return Err(CoreError::Conflict("deck name already exists"));
            }
        }
        let deck = owned_deck_mut(&mut s.decks, user_id, id)?;
        if let Some(name) = patch.name {
            deck.name = name;
        }
        if let Some(description) = patch.description {
            deck.description = Some(description);
        }
        if let Some(is_public) = patch.is_public {
            deck.is_public = is_public;
        }
        deck.updated_at = Utc::now();
        Ok(deck.clone())
    }

    async fn delete_deck(&self, user_id: UserId, id: DeckId) -> Result<(), CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, id)?;
        s.decks.remove(&id);
        s.progress.retain(|_, p| p.deck_id != id);
        s.cards.retain(|_, c| c.deck_id != id);
        s.deck_tags.retain(|(deck_id, _)| *deck_id != id);
        Ok(())
    }

    async fn add_card(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        content: CardContent,
    ) -> Result<Card, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, deck_id)?;
        let position = next_position(s.cards.values().filter(|c| c.deck_id == deck_id));
        let card = Card::new(deck_id, content, position);
        let deck = owned_deck_mut(&mut s.decks, user_id, deck_id)?;
        deck.card_count += 1;
        deck.updated_at = Utc::now();
        s.cards.insert(card.id, card.clone());
        Ok(card)
    }

    async fn get_card(&self, user_id: UserId, id: CardId) -> Result<Card, CoreError> {
        let guard = self.state.read();
        owned_card(&guard.decks, &guard.cards, user_id, id).cloned()
    }

    async fn list_cards(&self, user_id: UserId, deck_id: DeckId) -> Result<Vec<Card>, CoreError> {
        let guard = self.state.read();
        owned_deck(&guard.decks, user_id, deck_id)?;
        let mut v: Vec<Card> = guard
            .cards
            .values()
            .filter(|c| c.deck_id == deck_id)
            .cloned()
            .collect();
        v.sort_by_key(|c| c.position);
        Ok(v)
    }

    async fn update_card(
        &self,
        user_id: UserId,
        id: CardId,
        content: CardContent,
    ) -> Result<Card, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_card(&s.decks, &s.cards, user_id, id)?;
        let now = Utc::now();
        let card = s.cards.get_mut(&id).ok_or(CoreError::NotFound("card"))?;
        card.set_content(content, now);
        let updated = card.clone();
        if let Some(deck) = s.decks.get_mut(&updated.deck_id) {
            deck.updated_at = now;
        }
        Ok(updated)
    }

    async fn delete_card(&self, user_id: UserId, id: CardId) -> Result<(), CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        let card = owned_card(&s.decks, &s.cards, user_id, id)?.clone();
        s.cards.remove(&id);
        s.progress.retain(|_, p| p.card_id != id);
        shift_after_removal(
            s.cards.values_mut().filter(|c| c.deck_id == card.deck_id),
            card.position,
        );
        let deck = owned_deck_mut(&mut s.decks, user_id, card.deck_id)?;
        deck.card_count = deck.card_count.saturating_sub(1);
        deck.updated_at = Utc::now();
        Ok(())
    }

    async fn reorder_cards(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        ordered: &[CardId],
    ) -> Result<(), CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, deck_id)?;
        validate_reorder(s.cards.values().filter(|c| c.deck_id == deck_id), ordered)?;
        for (index, card_id) in ordered.iter().enumerate() {
            if let Some(card) = s.cards.get_mut(card_id) {
                card.position = index as u32;
            }
        }
        let deck = owned_deck_mut(&mut s.decks, user_id, deck_id)?;
        deck.updated_at = Utc::now();
        Ok(())
    }

    async fn create_tag(
        &self,
        user_id: UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Tag, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        if s.tags
            .values()
            .any(|t| t.user_id == user_id && t.name.eq_ignore_ascii_case(name))
        {
            return Err(CoreError::Conflict("tag name already exists"));
        }
        let tag = Tag::new(user_id, name, color.map(str::to_string));
        s.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn list_tags(&self, user_id: UserId) -> Result<Vec<Tag>, CoreError> {
        let guard = self.state.read();
        let mut v: Vec<Tag> = guard
            .tags
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        v.sort_by_key(|t| t.created_at);
        Ok(v)
    }

    async fn tag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, deck_id)?;
        s.tags
            .get(&tag_id)
            .filter(|t| t.user_id == user_id)
            .ok_or(CoreError::NotFound("tag"))?;
        s.deck_tags.insert((deck_id, tag_id));
        Ok(())
    }

    async fn untag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, deck_id)?;
        s.deck_tags.remove(&(deck_id, tag_id));
        Ok(())
    }

    async fn list_deck_tags(
        &self,
        user_id: UserId,
        deck_id: DeckId,
    ) -> Result<Vec<Tag>, CoreError> {
        let guard = self.state.read();
        owned_deck(&guard.decks, user_id, deck_id)?;
        let mut v: Vec<Tag> = guard
            .deck_tags
            .iter()
            .filter(|(d, _)| *d == deck_id)
            .filter_map(|(_, t)| guard.tags.get(t).cloned())
            .collect();
        v.sort_by_key(|t| t.created_at);
        Ok(v)
    }

    async fn get_or_create_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        if let Some(p) = s.progress.get(&(user_id, card_id)) {
            return Ok(p.clone());
        }
        let card = owned_card(&s.decks, &s.cards, user_id, card_id)?;
        let progress = CardProgress::new(user_id, card_id, card.deck_id, now);
        s.progress.insert((user_id, card_id), progress.clone());
        Ok(progress)
    }

    async fn get_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
    ) -> Result<Option<CardProgress>, CoreError> {
        let guard = self.state.read();
        Ok(guard.progress.get(&(user_id, card_id)).cloned())
    }

    async fn record_grade(
        &self,
        user_id: UserId,
        card_id: CardId,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        let current = match s.progress.get(&(user_id, card_id)) {
            Some(p) => p.clone(),
            None => {
                let card = owned_card(&s.decks, &s.cards, user_id, card_id)?;
                CardProgress::new(user_id, card_id, card.deck_id, now)
            }
        };
        let updated = apply_grade(current, grade, now);
        s.progress.insert((user_id, card_id), updated.clone());
        Ok(updated)
    }

    async fn due_queue(
        &self,
        user_id: UserId,
        deck_id: Option<DeckId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCard>, CoreError> {
        let guard = self.state.read();
        let mut due: Vec<DueCard> = guard
            .progress
            .values()
            .filter(|p| p.user_id == user_id && p.next_review_at <= now)
            .filter(|p| deck_id.map_or(true, |d| p.deck_id == d))
            .filter_map(|p| {
                guard.cards.get(&p.card_id).map(|c| DueCard {
                    card: c.clone(),
                    progress: p.clone(),
                })
            })
            .collect();
        due.sort_by_key(|d| (d.progress.next_review_at, d.card.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn start_session(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        owned_deck(&s.decks, user_id, deck_id)?;
        if let Some(open) = s
            .sessions
            .values_mut()
            .find(|x| x.user_id == user_id && x.ended_at.is_none())
        {
            // A dangling session never properly ended; close it at zero
            // duration without touching stats.
            open.ended_at = Some(open.started_at);
        }
        let session = StudySession::new(user_id, deck_id, now);
        s.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn record_answer(
        &self,
        user_id: UserId,
        session_id: SessionId,
        correct: bool,
    ) -> Result<StudySession, CoreError> {
        let mut guard = self.state.write();
        let session = guard
            .sessions
            .get_mut(&session_id)
            .filter(|x| x.user_id == user_id)
            .ok_or(CoreError::NotFound("session"))?;
        if session.ended_at.is_some() {
            return Err(CoreError::Invalid("session already ended"));
        }
        session.cards_studied += 1;
        if correct {
            session.correct_count += 1;
        } else {
            session.incorrect_count += 1;
        }
        Ok(session.clone())
    }

    async fn end_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError> {
        let mut guard = self.state.write();
        let s = &mut *guard;
        let session = s
            .sessions
            .get_mut(&session_id)
            .filter(|x| x.user_id == user_id)
            .ok_or(CoreError::NotFound("session"))?;
        if session.ended_at.is_some() {
            return Err(CoreError::Invalid("session already ended"));
        }
        session.ended_at = Some(now);
        let closed = session.clone();
        let stats = s
            .stats
            .entry(user_id)
            .or_insert_with(|| UserStats::new(user_id));
        apply_session_close(stats, &closed, now);
        Ok(closed)
    }

    async fn get_stats(&self, user_id: UserId) -> Result<Option<UserStats>, CoreError> {
        let guard = self.state.read();
        Ok(guard.stats.get(&user_id).cloned())
    }
}
