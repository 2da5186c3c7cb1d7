use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type DeckId = Uuid;
pub type CardId = Uuid;
pub type TagId = Uuid;
pub type FolderId = Uuid;
pub type SessionId = Uuid;
pub type ProgressId = Uuid;

pub const EF_MIN: f64 = 1.3;
pub const EF_DEFAULT: f64 = 2.5;

/// Grading outcome on the 4-point scale.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Again,
    Hard,
    Good,
    Easy,
}

impl Grade {
    pub fn as_score(&self) -> u8 {
        match self {
            Grade::Again => 1,
            Grade::Hard => 2,
            Grade::Good => 3,
            Grade::Easy => 4,
        }
    }

    /// Validates numeric input at the boundary; anything outside 1..=4 is
    /// a caller contract violation.
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            1 => Some(Grade::Again),
            2 => Some(Grade::Hard),
            3 => Some(Grade::Good),
            4 => Some(Grade::Easy),
            _ => None,
        }
    }

    /// A grade counts as a correct answer for session bookkeeping unless
    /// the card was failed outright.
    pub fn is_correct(&self) -> bool {
        !matches!(self, Grade::Again)
    }
}

/// Learning state of a (user, card) pair. Transitions happen only inside
/// the scheduler.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    #[default]
    New,
    Learning,
    Review,
    Relearning,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::New => "new",
            CardStatus::Learning => "learning",
            CardStatus::Review => "review",
            CardStatus::Relearning => "relearning",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(CardStatus::New),
            "learning" => Some(CardStatus::Learning),
            "review" => Some(CardStatus::Review),
            "relearning" => Some(CardStatus::Relearning),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Deck {
    pub id: DeckId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub folder_id: Option<FolderId>,
    pub forked_from_id: Option<DeckId>,
    /// Denormalized; always equals the live number of cards in the deck.
    pub card_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct NewDeck {
    pub name: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub folder_id: Option<FolderId>,
    pub forked_from_id: Option<DeckId>,
}

impl NewDeck {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial deck update; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct DeckPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

impl Deck {
    pub fn new(user_id: UserId, new: NewDeck) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: new.name,
            description: new.description,
            is_public: new.is_public,
            folder_id: new.folder_id,
            forked_from_id: new.forked_from_id,
            card_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Either side of a card may carry text, an image, or both.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CardContent {
    pub front_text: Option<String>,
    pub front_image_url: Option<String>,
    pub back_text: Option<String>,
    pub back_image_url: Option<String>,
}

impl CardContent {
    pub fn text(front: impl Into<String>, back: impl Into<String>) -> Self {
        Self {
            front_text: Some(front.into()),
            back_text: Some(back.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub id: CardId,
    pub deck_id: DeckId,
    pub front_text: Option<String>,
    pub front_image_url: Option<String>,
    pub back_text: Option<String>,
    pub back_image_url: Option<String>,
    /// Zero-based, dense, unique within the deck.
    pub position: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    pub fn new(deck_id: DeckId, content: CardContent, position: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            deck_id,
            front_text: content.front_text,
            front_image_url: content.front_image_url,
            back_text: content.back_text,
            back_image_url: content.back_image_url,
            position,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_content(&mut self, content: CardContent, now: DateTime<Utc>) {
        self.front_text = content.front_text;
        self.front_image_url = content.front_image_url;
        self.back_text = content.back_text;
        self.back_image_url = content.back_image_url;
        self.updated_at = now;
    }
}

/// Per-(user, card) scheduling state. Created lazily on first exposure,
/// removed only when the card is removed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CardProgress {
    pub id: ProgressId,
    pub user_id: UserId,
    pub card_id: CardId,
    /// Denormalized from the card; the card's own deck_id stays canonical.
    pub deck_id: DeckId,
    pub status: CardStatus,
    pub ease_factor: f64,
    pub interval_days: u32,
    pub repetitions: u32,
    pub next_review_at: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CardProgress {
    pub fn new(user_id: UserId, card_id: CardId, deck_id: DeckId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            card_id,
            deck_id,
            status: CardStatus::New,
            ease_factor: EF_DEFAULT,
            interval_days: 0,
            repetitions: 0,
            next_review_at: now,
            last_reviewed_at: None,
            created_at: now,
        }
    }
}

/// A due card joined with its scheduling state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DueCard {
    pub card: Card,
    pub progress: CardProgress,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StudySession {
    pub id: SessionId,
    pub user_id: UserId,
    pub deck_id: DeckId,
    pub started_at: DateTime<Utc>,
    /// None while the session is ongoing; at most one ongoing session per
    /// user at a time.
    pub ended_at: Option<DateTime<Utc>>,
    pub cards_studied: u32,
    pub correct_count: u32,
    pub incorrect_count: u32,
}

impl StudySession {
    pub fn new(user_id: UserId, deck_id: DeckId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            deck_id,
            started_at,
            ended_at: None,
            cards_studied: 0,
            correct_count: 0,
            incorrect_count: 0,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserStats {
    pub user_id: UserId,
    pub current_streak: u32,
    pub longest_streak: u32,
    /// Calendar date of the last closed session; drives streak continuity.
    pub last_study_date: Option<NaiveDate>,
    pub total_cards_studied: u32,
    pub total_time_spent_secs: u64,
}

impl UserStats {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            current_streak: 0,
            longest_streak: 0,
            last_study_date: None,
            total_cards_studied: 0,
            total_time_spent_secs: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub id: TagId,
    pub user_id: UserId,
    pub name: String,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(user_id: UserId, name: impl Into<String>, color: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            color,
            created_at: Utc::now(),
        }
    }
}
