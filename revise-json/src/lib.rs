use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use revise_core::{
    apply_grade, apply_session_close, next_position, repo::Repository, shift_after_removal,
    validate_reorder, Card, CardContent, CardId, CardProgress, CoreError, Deck, DeckId, DeckPatch,
    DueCard, Grade, NewDeck, SessionId, StudySession, Tag, TagId, UserId, UserStats,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::task;

pub mod paths;

const FILE_VERSION: u32 = 1;

#[derive(Clone, Serialize, Deserialize)]
struct FileImage {
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    decks: Vec<Deck>,
    cards: Vec<Card>,
    progress: Vec<CardProgress>,
    sessions: Vec<StudySession>,
    stats: Vec<UserStats>,
    tags: Vec<Tag>,
    deck_tags: Vec<(DeckId, TagId)>,
}

#[derive(Default, Clone)]
struct State {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    decks: HashMap<DeckId, Deck>,
    cards: HashMap<CardId, Card>,
    progress: HashMap<(UserId, CardId), CardProgress>,
    sessions: HashMap<SessionId, StudySession>,
    stats: HashMap<UserId, UserStats>,
    tags: HashMap<TagId, Tag>,
    deck_tags: HashSet<(DeckId, TagId)>,
}

impl State {
    fn new_empty() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    fn to_image(&self) -> FileImage {
        FileImage {
            version: FILE_VERSION,
            created_at: self.created_at,
            updated_at: self.updated_at,
            decks: self.decks.values().cloned().collect(),
            cards: self.cards.values().cloned().collect(),
            progress: self.progress.values().cloned().collect(),
            sessions: self.sessions.values().cloned().collect(),
            stats: self.stats.values().cloned().collect(),
            tags: self.tags.values().cloned().collect(),
            deck_tags: self.deck_tags.iter().cloned().collect(),
        }
    }

    fn from_image(img: FileImage) -> Self {
        let mut state = State {
            created_at: img.created_at,
            updated_at: img.updated_at,
            ..State::default()
        };
        for d in img.decks {
            state.decks.insert(d.id, d);
        }
        for c in img.cards {
            state.cards.insert(c.id, c);
        }
        for p in img.progress {
            state.progress.insert((p.user_id, p.card_id), p);
        }
        for s in img.sessions {
            state.sessions.insert(s.id, s);
        }
        for st in img.stats {
            state.stats.insert(st.user_id, st);
        }
        for t in img.tags {
            state.tags.insert(t.id, t);
        }
        state.deck_tags = img.deck_tags.into_iter().collect();
        state
    }

    fn owned_deck(&self, user_id: UserId, id: DeckId) -> Result<&Deck, CoreError> {
        self.decks
            .get(&id)
            .filter(|d| d.user_id == user_id)
            .ok_or(CoreError::NotFound("deck"))
    }

    fn owned_deck_mut(&mut self, user_id: UserId, id: DeckId) -> Result<&mut Deck, CoreError> {
        self.decks
            .get_mut(&id)
            .filter(|d| d.user_id == user_id)
            .ok_or(CoreError::NotFound("deck"))
    }

    fn owned_card(&self, user_id: UserId, id: CardId) -> Result<&Card, CoreError> {
        let card = self.cards.get(&id).ok_or(CoreError::NotFound("card"))?;
        match self.decks.get(&card.deck_id) {
            Some(d) if d.user_id == user_id => Ok(card),
            _ => Err(CoreError::NotFound("card")),
        }
    }
}

/// Local JSON persistence: the whole store lives in one file image written
/// atomically (temp file + persist) with timestamped, rotated backups.
pub struct JsonStore {
    path: PathBuf,
    backups_dir: PathBuf,
    max_backups: usize,
    state: RwLock<State>,
}

impl JsonStore {
    pub async fn open_default() -> Result<Self, CoreError> {
        let (file, backups) = paths::default_store_file();
        Self::open_with(file, backups, 10).await
    }

    pub async fn open_with(
        path: PathBuf,
        backups_dir: PathBuf,
        max_backups: usize,
    ) -> Result<Self, CoreError> {
        ensure_parent_dirs(&path)?;
        ensure_dir(&backups_dir)?;
        let state = load_or_init(&path).await?;
        Ok(Self {
            path,
            backups_dir,
            max_backups: max_backups.max(1),
            state: RwLock::new(state),
        })
    }

    async fn save(&self) -> Result<(), CoreError> {
        let snapshot = {
            let mut s = self.state.write();
            s.updated_at = Utc::now();
            s.to_image()
        };
        let path = self.path.clone();
        let backups = self.backups_dir.clone();
        let keep = self.max_backups;

        task::spawn_blocking(move || write_with_backup(&path, &backups, keep, &snapshot))
            .await
            .map_err(|_| CoreError::Storage("io"))?
            .map_err(|_| CoreError::Storage("io"))?;
        Ok(())
    }
}

fn ensure_parent_dirs(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(path).map_err(|_| CoreError::Storage("io"))
}

async fn load_or_init(path: &Path) -> Result<State, CoreError> {
    if path.exists() {
        let p = path.to_path_buf();
        let img: FileImage = task::spawn_blocking(move || {
            let mut f = fs::File::open(&p)?;
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            let v = serde_json::from_str::<FileImage>(&buf)?;
            Ok::<FileImage, std::io::Error>(v)
        })
        .await
        .map_err(|_| CoreError::Storage("io"))
        .and_then(|r| r.map_err(|_| CoreError::Storage("io")))?;
        let mut state = State::from_image(img);
        state.updated_at = Utc::now();
        Ok(state)
    } else {
        let state = State::new_empty();
        let img = state.to_image();
        write_with_backup(path, &path.with_extension("backups"), 1, &img)
            .map_err(|_| CoreError::Storage("io"))?;
        Ok(state)
    }
}

fn write_with_backup(
    path: &Path,
    backups_dir: &Path,
    max_backups: usize,
    img: &FileImage,
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(backups_dir)?;

    let json = serde_json::to_vec_pretty(img).expect("serialize");
    let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    let _ = fs::remove_file(path);
    tmp.persist(path)?;

    // Backup rotation
    let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let backup_name = format!("revise-{ts}.json");
    let backup_path = backups_dir.join(backup_name);
    let mut btmp = NamedTempFile::new_in(backups_dir)?;
    btmp.write_all(&json)?;
    btmp.flush()?;
    let _ = fs::remove_file(&backup_path);
    btmp.persist(&backup_path)?;

    rotate_backups(backups_dir, max_backups)?;

    Ok(())
}

fn rotate_backups(dir: &Path, keep: usize) -> Result<(), std::io::Error> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    if entries.len() > keep {
        for e in &entries[0..entries.len() - keep] {
            let _ = fs::remove_file(e.path());
        }
    }
    Ok(())
}

use async_trait::async_trait;

#[async_trait]
impl Repository for JsonStore {
    async fn create_deck(&self, user_id: UserId, new: NewDeck) -> Result<Deck, CoreError> {
        let deck = {
            let mut s = self.state.write();
            if s.decks
                .values()
                .any(|d| d.user_id == user_id && d.name.eq_ignore_ascii_case(&new.name))
            {
                return Err(CoreError::Conflict("deck name already exists"));
            }
            let deck = Deck::new(user_id, new);
            s.decks.insert(deck.id, deck.clone());
            deck
        };
        self.save().await?;
        Ok(deck)
    }

    async fn get_deck(&self, user_id: UserId, id: DeckId) -> Result<Deck, CoreError> {
        let s = self.state.read();
        s.owned_deck(user_id, id).cloned()
    }

    async fn list_decks(&self, user_id: UserId) -> Result<Vec<Deck>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<Deck> = s
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
        let deck = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            if let Some(name) = &patch.name {
                if s.decks.values().any(|d| {
                    d.id != id && d.user_id == user_id && d.name.eq_ignore_ascii_case(name)
                }) {
                    return Err(CoreError::Conflict("deck name already exists"));
                }
            }
            let deck = s.owned_deck_mut(user_id, id)?;
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
            deck.clone()
        };
        self.save().await?;
        Ok(deck)
    }

    async fn delete_deck(&self, user_id: UserId, id: DeckId) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, id)?;
            s.decks.remove(&id);
            s.progress.retain(|_, p| p.deck_id != id);
            s.cards.retain(|_, c| c.deck_id != id);
            s.deck_tags.retain(|(deck_id, _)| *deck_id != id);
        }
        self.save().await
    }

    async fn add_card(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        content: CardContent,
    ) -> Result<Card, CoreError> {
        let card = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, deck_id)?;
            let position = next_position(s.cards.values().filter(|c| c.deck_id == deck_id));
            let card = Card::new(deck_id, content, position);
            let deck = s.owned_deck_mut(user_id, deck_id)?;
            deck.card_count += 1;
            deck.updated_at = Utc::now();
            s.cards.insert(card.id, card.clone());
            card
        };
        self.save().await?;
        Ok(card)
    }

    async fn get_card(&self, user_id: UserId, id: CardId) -> Result<Card, CoreError> {
        let s = self.state.read();
        s.owned_card(user_id, id).cloned()
    }

    async fn list_cards(&self, user_id: UserId, deck_id: DeckId) -> Result<Vec<Card>, CoreError> {
        let s = self.state.read();
        s.owned_deck(user_id, deck_id)?;
        let mut v: Vec<Card> = s
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
        let card = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_card(user_id, id)?;
            let now = Utc::now();
            let card = s.cards.get_mut(&id).ok_or(CoreError::NotFound("card"))?;
            card.set_content(content, now);
            let updated = card.clone();
            if let Some(deck) = s.decks.get_mut(&updated.deck_id) {
                deck.updated_at = now;
            }
            updated
        };
        self.save().await?;
        Ok(card)
    }

    async fn delete_card(&self, user_id: UserId, id: CardId) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            let card = s.owned_card(user_id, id)?.clone();
            s.cards.remove(&id);
            s.progress.retain(|_, p| p.card_id != id);
            shift_after_removal(
                s.cards.values_mut().filter(|c| c.deck_id == card.deck_id),
                card.position,
            );
            let deck = s.owned_deck_mut(user_id, card.deck_id)?;
            deck.card_count = deck.card_count.saturating_sub(1);
            deck.updated_at = Utc::now();
        }
        self.save().await
    }

    async fn reorder_cards(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        ordered: &[CardId],
    ) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, deck_id)?;
            validate_reorder(s.cards.values().filter(|c| c.deck_id == deck_id), ordered)?;
            for (index, card_id) in ordered.iter().enumerate() {
                if let Some(card) = s.cards.get_mut(card_id) {
                    card.position = index as u32;
                }
            }
            let deck = s.owned_deck_mut(user_id, deck_id)?;
            deck.updated_at = Utc::now();
        }
        self.save().await
    }

    async fn create_tag(
        &self,
        user_id: UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Tag, CoreError> {
        let tag = {
            let mut s = self.state.write();
            if s.tags
                .values()
                .any(|t| t.user_id == user_id && t.name.eq_ignore_ascii_case(name))
            {
                return Err(CoreError::Conflict("tag name already exists"));
            }
            let tag = Tag::new(user_id, name, color.map(str::to_string));
            s.tags.insert(tag.id, tag.clone());
            tag
        };
        self.save().await?;
        Ok(tag)
    }

    async fn list_tags(&self, user_id: UserId) -> Result<Vec<Tag>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<Tag> = s
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
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, deck_id)?;
            s.tags
                .get(&tag_id)
                .filter(|t| t.user_id == user_id)
                .ok_or(CoreError::NotFound("tag"))?;
            s.deck_tags.insert((deck_id, tag_id));
        }
        self.save().await
    }

    async fn untag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, deck_id)?;
            s.deck_tags.remove(&(deck_id, tag_id));
        }
        self.save().await
    }

    async fn list_deck_tags(
        &self,
        user_id: UserId,
        deck_id: DeckId,
    ) -> Result<Vec<Tag>, CoreError> {
        let s = self.state.read();
        s.owned_deck(user_id, deck_id)?;
        let mut v: Vec<Tag> = s
            .deck_tags
            .iter()
            .filter(|(d, _)| *d == deck_id)
            .filter_map(|(_, t)| s.tags.get(t).cloned())
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
        let (progress, created) = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            if let Some(p) = s.progress.get(&(user_id, card_id)) {
                (p.clone(), false)
            } else {
                let card = s.owned_card(user_id, card_id)?;
                let progress = CardProgress::new(user_id, card_id, card.deck_id, now);
                s.progress.insert((user_id, card_id), progress.clone());
                (progress, true)
            }
        };
        if created {
            self.save().await?;
        }
        Ok(progress)
    }

    async fn get_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
    ) -> Result<Option<CardProgress>, CoreError> {
        let s = self.state.read();
        Ok(s.progress.get(&(user_id, card_id)).cloned())
    }

    async fn record_grade(
        &self,
        user_id: UserId,
        card_id: CardId,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError> {
        let updated = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            let current = match s.progress.get(&(user_id, card_id)) {
                Some(p) => p.clone(),
                None => {
                    let card = s.owned_card(user_id, card_id)?;
                    CardProgress::new(user_id, card_id, card.deck_id, now)
                }
            };
            let updated = apply_grade(current, grade, now);
            s.progress.insert((user_id, card_id), updated.clone());
            updated
        };
        self.save().await?;
        Ok(updated)
    }

    async fn due_queue(
        &self,
        user_id: UserId,
        deck_id: Option<DeckId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCard>, CoreError> {
        let s = self.state.read();
        let mut due: Vec<DueCard> = s
            .progress
            .values()
            .filter(|p| p.user_id == user_id && p.next_review_at <= now)
            .filter(|p| deck_id.map_or(true, |d| p.deck_id == d))
            .filter_map(|p| {
                s.cards.get(&p.card_id).map(|c| DueCard {
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
        let session = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            s.owned_deck(user_id, deck_id)?;
            if let Some(open) = s
                .sessions
                .values_mut()
                .find(|x| x.user_id == user_id && x.ended_at.is_none())
            {
                // A dangling session never properly ended; close it at
                // zero duration without touching stats.
                open.ended_at = Some(open.started_at);
            }
            let session = StudySession::new(user_id, deck_id, now);
            s.sessions.insert(session.id, session.clone());
            session
        };
        self.save().await?;
        Ok(session)
    }

    async fn record_answer(
        &self,
        user_id: UserId,
        session_id: SessionId,
        correct: bool,
    ) -> Result<StudySession, CoreError> {
        let session = {
            let mut s = self.state.write();
            let session = s
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
            session.clone()
        };
        self.save().await?;
        Ok(session)
    }

    async fn end_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError> {
        let session = {
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
            closed
        };
        self.save().await?;
        Ok(session)
    }

    async fn get_stats(&self, user_id: UserId) -> Result<Option<UserStats>, CoreError> {
        let s = self.state.read();
        Ok(s.stats.get(&user_id).cloned())
    }
}
