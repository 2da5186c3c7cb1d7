use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use revise_core::{
    apply_grade, apply_session_close, repo::Repository, validate_reorder, Card, CardContent,
    CardId, CardProgress, CardStatus, CoreError, Deck, DeckId, DeckPatch, DueCard, Grade, NewDeck,
    SessionId, StudySession, Tag, TagId, UserId, UserStats,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

pub struct SqliteRepo {
    pool: SqlitePool,
}

impl SqliteRepo {
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|_| CoreError::Storage("sqlite connect"))?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    /// Single connection: every pooled connection would otherwise get its
    /// own private in-memory database.
    pub async fn open_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|_| CoreError::Storage("sqlite connect"))?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> Result<(), CoreError> {
        // Create tables/indexes if they do not exist (mirrors migrations).
        // Timestamps are epoch milliseconds; the streak date is YYYY-MM-DD.
        const STMT: &str = r#"
        CREATE TABLE IF NOT EXISTS decks (
          id              TEXT PRIMARY KEY,
          user_id         TEXT NOT NULL,
          name            TEXT NOT NULL,
          description     TEXT,
          is_public       INTEGER NOT NULL DEFAULT 0,
          folder_id       TEXT,
          forked_from_id  TEXT,
          card_count      INTEGER NOT NULL DEFAULT 0,
          created_at      INTEGER NOT NULL,
          updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cards (
          id               TEXT PRIMARY KEY,
          deck_id          TEXT NOT NULL,
          front_text       TEXT,
          front_image_url  TEXT,
          back_text        TEXT,
          back_image_url   TEXT,
          position         INTEGER NOT NULL,
          created_at       INTEGER NOT NULL,
          updated_at       INTEGER NOT NULL,
          FOREIGN KEY(deck_id) REFERENCES decks(id)
        );

        CREATE TABLE IF NOT EXISTS card_progress (
          id                TEXT PRIMARY KEY,
          user_id           TEXT NOT NULL,
          card_id           TEXT NOT NULL,
          deck_id           TEXT NOT NULL,
          status            TEXT NOT NULL,
          ease_factor       REAL NOT NULL,
          interval_days     INTEGER NOT NULL,
          repetitions       INTEGER NOT NULL,
          next_review_at    INTEGER NOT NULL,
          last_reviewed_at  INTEGER,
          created_at        INTEGER NOT NULL,
          FOREIGN KEY(card_id) REFERENCES cards(id)
        );

        CREATE TABLE IF NOT EXISTS study_sessions (
          id               TEXT PRIMARY KEY,
          user_id          TEXT NOT NULL,
          deck_id          TEXT NOT NULL,
          started_at       INTEGER NOT NULL,
          ended_at         INTEGER,
          cards_studied    INTEGER NOT NULL DEFAULT 0,
          correct_count    INTEGER NOT NULL DEFAULT 0,
          incorrect_count  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS user_stats (
          user_id                TEXT PRIMARY KEY,
          current_streak         INTEGER NOT NULL DEFAULT 0,
          longest_streak         INTEGER NOT NULL DEFAULT 0,
          last_study_date        TEXT,
          total_cards_studied    INTEGER NOT NULL DEFAULT 0,
          total_time_spent_secs  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tags (
          id          TEXT PRIMARY KEY,
          user_id     TEXT NOT NULL,
          name        TEXT NOT NULL,
          color       TEXT,
          created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deck_tags (
          deck_id  TEXT NOT NULL,
          tag_id   TEXT NOT NULL,
          PRIMARY KEY (deck_id, tag_id)
        );

        CREATE INDEX IF NOT EXISTS idx_decks_user ON decks (user_id);
        CREATE INDEX IF NOT EXISTS idx_cards_deck_position ON cards (deck_id, position);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_progress_user_card ON card_progress (user_id, card_id);
        CREATE INDEX IF NOT EXISTS idx_progress_user_deck ON card_progress (user_id, deck_id);
        CREATE INDEX IF NOT EXISTS idx_progress_user_due ON card_progress (user_id, next_review_at);
        CREATE INDEX IF NOT EXISTS idx_sessions_user_date ON study_sessions (user_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_tags_user ON tags (user_id)
        "#;

        // Execute statements one by one for compatibility.
        for chunk in STMT.split(';') {
            let sql = chunk.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|_| CoreError::Storage("sqlite schema"))?;
        }
        Ok(())
    }
}

// ===== Helpers =====
fn uuid_from_str(s: String) -> Result<uuid::Uuid, CoreError> {
    uuid::Uuid::parse_str(&s).map_err(|_| CoreError::Invalid("uuid"))
}

fn opt_uuid_from_str(s: Option<String>) -> Result<Option<uuid::Uuid>, CoreError> {
    s.map(uuid_from_str).transpose()
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn dt_from_ms(ms: i64) -> Result<DateTime<Utc>, CoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(CoreError::Invalid("timestamp"))
}

fn date_to_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn date_from_str(s: String) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| CoreError::Invalid("date"))
}

fn row_into_deck(row: SqliteRow) -> Result<Deck, CoreError> {
    Ok(Deck {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        user_id: uuid_from_str(row.get::<String, _>("user_id"))?,
        name: row.get::<String, _>("name"),
        description: row.get::<Option<String>, _>("description"),
        is_public: row.get::<i64, _>("is_public") != 0,
        folder_id: opt_uuid_from_str(row.get::<Option<String>, _>("folder_id"))?,
        forked_from_id: opt_uuid_from_str(row.get::<Option<String>, _>("forked_from_id"))?,
        card_count: row.get::<i64, _>("card_count") as u32,
        created_at: dt_from_ms(row.get::<i64, _>("created_at"))?,
        updated_at: dt_from_ms(row.get::<i64, _>("updated_at"))?,
    })
}

fn row_into_card(row: &SqliteRow) -> Result<Card, CoreError> {
    Ok(Card {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        deck_id: uuid_from_str(row.get::<String, _>("deck_id"))?,
        front_text: row.get::<Option<String>, _>("front_text"),
        front_image_url: row.get::<Option<String>, _>("front_image_url"),
        back_text: row.get::<Option<String>, _>("back_text"),
        back_image_url: row.get::<Option<String>, _>("back_image_url"),
        position: row.get::<i64, _>("position") as u32,
        created_at: dt_from_ms(row.get::<i64, _>("created_at"))?,
        updated_at: dt_from_ms(row.get::<i64, _>("updated_at"))?,
    })
}

fn row_into_progress(row: &SqliteRow) -> Result<CardProgress, CoreError> {
    let status: String = row.get("status");
    Ok(CardProgress {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        user_id: uuid_from_str(row.get::<String, _>("user_id"))?,
        card_id: uuid_from_str(row.get::<String, _>("card_id"))?,
        deck_id: uuid_from_str(row.get::<String, _>("deck_id"))?,
        status: CardStatus::from_str(&status).ok_or(CoreError::Invalid("status"))?,
        ease_factor: row.get::<f64, _>("ease_factor"),
        interval_days: row.get::<i64, _>("interval_days") as u32,
        repetitions: row.get::<i64, _>("repetitions") as u32,
        next_review_at: dt_from_ms(row.get::<i64, _>("next_review_at"))?,
        last_reviewed_at: row
            .get::<Option<i64>, _>("last_reviewed_at")
            .map(dt_from_ms)
            .transpose()?,
        created_at: dt_from_ms(row.get::<i64, _>("created_at"))?,
    })
}

fn row_into_session(row: SqliteRow) -> Result<StudySession, CoreError> {
    Ok(StudySession {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        user_id: uuid_from_str(row.get::<String, _>("user_id"))?,
        deck_id: uuid_from_str(row.get::<String, _>("deck_id"))?,
        started_at: dt_from_ms(row.get::<i64, _>("started_at"))?,
        ended_at: row
            .get::<Option<i64>, _>("ended_at")
            .map(dt_from_ms)
            .transpose()?,
        cards_studied: row.get::<i64, _>("cards_studied") as u32,
        correct_count: row.get::<i64, _>("correct_count") as u32,
        incorrect_count: row.get::<i64, _>("incorrect_count") as u32,
    })
}

fn row_into_stats(row: SqliteRow) -> Result<UserStats, CoreError> {
    Ok(UserStats {
        user_id: uuid_from_str(row.get::<String, _>("user_id"))?,
        current_streak: row.get::<i64, _>("current_streak") as u32,
        longest_streak: row.get::<i64, _>("longest_streak") as u32,
        last_study_date: row
            .get::<Option<String>, _>("last_study_date")
            .map(date_from_str)
            .transpose()?,
        total_cards_studied: row.get::<i64, _>("total_cards_studied") as u32,
        total_time_spent_secs: row.get::<i64, _>("total_time_spent_secs") as u64,
    })
}

fn row_into_tag(row: SqliteRow) -> Result<Tag, CoreError> {
    Ok(Tag {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        user_id: uuid_from_str(row.get::<String, _>("user_id"))?,
        name: row.get::<String, _>("name"),
        color: row.get::<Option<String>, _>("color"),
        created_at: dt_from_ms(row.get::<i64, _>("created_at"))?,
    })
}

const CARD_COLS: &str =
    "id, deck_id, front_text, front_image_url, back_text, back_image_url, position, created_at, updated_at";
const PROGRESS_COLS: &str =
    "id, user_id, card_id, deck_id, status, ease_factor, interval_days, repetitions, next_review_at, last_reviewed_at, created_at";

async fn insert_progress<'e, E>(executor: E, p: &CardProgress) -> Result<(), CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"INSERT INTO card_progress
           (id, user_id, card_id, deck_id, status, ease_factor, interval_days, repetitions, next_review_at, last_reviewed_at, created_at)
           VALUES (?,?,?,?,?,?,?,?,?,?,?)"#,
    )
    .bind(p.id.to_string())
    .bind(p.user_id.to_string())
    .bind(p.card_id.to_string())
    .bind(p.deck_id.to_string())
    .bind(p.status.as_str())
    .bind(p.ease_factor)
    .bind(p.interval_days as i64)
    .bind(p.repetitions as i64)
    .bind(dt_to_ms(p.next_review_at))
    .bind(p.last_reviewed_at.map(dt_to_ms))
    .bind(dt_to_ms(p.created_at))
    .execute(executor)
    .await
    .map_err(|_| CoreError::Storage("insert progress"))?;
    Ok(())
}

/// Fetches a card only when its owning deck belongs to the user; a foreign
/// card reads as absent.
async fn fetch_owned_card<'e, E>(
    executor: E,
    user_id: UserId,
    card_id: CardId,
) -> Result<Option<Card>, CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"SELECT c.id, c.deck_id, c.front_text, c.front_image_url, c.back_text, c.back_image_url,
                  c.position, c.created_at, c.updated_at
           FROM cards c JOIN decks d ON d.id = c.deck_id
           WHERE c.id=? AND d.user_id=?"#,
    )
    .bind(card_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(executor)
    .await
    .map_err(|_| CoreError::Storage("read card"))?;
    row.as_ref().map(row_into_card).transpose()
}

async fn fetch_owned_deck<'e, E>(
    executor: E,
    user_id: UserId,
    deck_id: DeckId,
) -> Result<Option<Deck>, CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM decks WHERE id=? AND user_id=?")
        .bind(deck_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(executor)
        .await
        .map_err(|_| CoreError::Storage("read deck"))?;
    row.map(row_into_deck).transpose()
}

#[async_trait::async_trait]
impl Repository for SqliteRepo {
    // ===== Decks =====
    async fn create_deck(&self, user_id: UserId, new: NewDeck) -> Result<Deck, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let exists = sqlx::query("SELECT 1 FROM decks WHERE user_id=? AND lower(name)=lower(?) LIMIT 1")
            .bind(user_id.to_string())
            .bind(&new.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read deck"))?
            .is_some();
        if exists {
            return Err(CoreError::Conflict("deck name already exists"));
        }

        let deck = Deck::new(user_id, new);
        sqlx::query(
            r#"INSERT INTO decks
               (id, user_id, name, description, is_public, folder_id, forked_from_id, card_count, created_at, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(deck.id.to_string())
        .bind(deck.user_id.to_string())
        .bind(&deck.name)
        .bind(deck.description.clone())
        .bind(deck.is_public as i64)
        .bind(deck.folder_id.map(|id| id.to_string()))
        .bind(deck.forked_from_id.map(|id| id.to_string()))
        .bind(deck.card_count as i64)
        .bind(dt_to_ms(deck.created_at))
        .bind(dt_to_ms(deck.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("insert deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(deck)
    }

    async fn get_deck(&self, user_id: UserId, id: DeckId) -> Result<Deck, CoreError> {
        fetch_owned_deck(&self.pool, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("deck"))
    }

    async fn list_decks(&self, user_id: UserId) -> Result<Vec<Deck>, CoreError> {
        let rows = sqlx::query("SELECT * FROM decks WHERE user_id=? ORDER BY updated_at DESC")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("list decks"))?;
        rows.into_iter().map(row_into_deck).collect()
    }

    async fn update_deck(
        &self,
        user_id: UserId,
        id: DeckId,
        patch: DeckPatch,
    ) -> Result<Deck, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let mut deck = fetch_owned_deck(&mut *tx, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;

        if let Some(name) = &patch.name {
            let clash = sqlx::query(
                "SELECT 1 FROM decks WHERE user_id=? AND id<>? AND lower(name)=lower(?) LIMIT 1",
            )
            .bind(user_id.to_string())
            .bind(id.to_string())
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read deck"))?
            .is_some();
            if clash {
                return Err(CoreError::Conflict("deck name already exists"));
            }
        }

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

        sqlx::query("UPDATE decks SET name=?, description=?, is_public=?, updated_at=? WHERE id=?")
            .bind(&deck.name)
            .bind(deck.description.clone())
            .bind(deck.is_public as i64)
            .bind(dt_to_ms(deck.updated_at))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(deck)
    }

    async fn delete_deck(&self, user_id: UserId, id: DeckId) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;

        // Cascade within one transaction: progress first (it references
        // cards), then the cards, the tag links, and the deck itself.
        sqlx::query("DELETE FROM card_progress WHERE deck_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del progress"))?;
        sqlx::query("DELETE FROM cards WHERE deck_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del cards"))?;
        sqlx::query("DELETE FROM deck_tags WHERE deck_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del deck tags"))?;
        sqlx::query("DELETE FROM decks WHERE id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))
    }

    // ===== Cards =====
    async fn add_card(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        content: CardContent,
    ) -> Result<Card, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;

        let position: i64 =
            sqlx::query("SELECT COALESCE(MAX(position) + 1, 0) AS next FROM cards WHERE deck_id=?")
                .bind(deck_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(|_| CoreError::Storage("read cards"))?
                .get("next");

        let card = Card::new(deck_id, content, position as u32);
        sqlx::query(
            r#"INSERT INTO cards
               (id, deck_id, front_text, front_image_url, back_text, back_image_url, position, created_at, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(card.id.to_string())
        .bind(card.deck_id.to_string())
        .bind(card.front_text.clone())
        .bind(card.front_image_url.clone())
        .bind(card.back_text.clone())
        .bind(card.back_image_url.clone())
        .bind(card.position as i64)
        .bind(dt_to_ms(card.created_at))
        .bind(dt_to_ms(card.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("insert card"))?;

        sqlx::query("UPDATE decks SET card_count = card_count + 1, updated_at=? WHERE id=?")
            .bind(dt_to_ms(Utc::now()))
            .bind(deck_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(card)
    }

    async fn get_card(&self, user_id: UserId, id: CardId) -> Result<Card, CoreError> {
        fetch_owned_card(&self.pool, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("card"))
    }

    async fn list_cards(&self, user_id: UserId, deck_id: DeckId) -> Result<Vec<Card>, CoreError> {
        fetch_owned_deck(&self.pool, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;
        let rows = sqlx::query(&format!(
            "SELECT {CARD_COLS} FROM cards WHERE deck_id=? ORDER BY position ASC"
        ))
        .bind(deck_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list cards"))?;
        rows.iter().map(row_into_card).collect()
    }

    async fn update_card(
        &self,
        user_id: UserId,
        id: CardId,
        content: CardContent,
    ) -> Result<Card, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let mut card = fetch_owned_card(&mut *tx, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("card"))?;
        let now = Utc::now();
        card.set_content(content, now);

        sqlx::query(
            r#"UPDATE cards SET front_text=?, front_image_url=?, back_text=?, back_image_url=?, updated_at=?
               WHERE id=?"#,
        )
        .bind(card.front_text.clone())
        .bind(card.front_image_url.clone())
        .bind(card.back_text.clone())
        .bind(card.back_image_url.clone())
        .bind(dt_to_ms(card.updated_at))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("update card"))?;

        sqlx::query("UPDATE decks SET updated_at=? WHERE id=?")
            .bind(dt_to_ms(now))
            .bind(card.deck_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(card)
    }

    async fn delete_card(&self, user_id: UserId, id: CardId) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let card = fetch_owned_card(&mut *tx, user_id, id)
            .await?
            .ok_or(CoreError::NotFound("card"))?;

        sqlx::query("DELETE FROM card_progress WHERE card_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del progress"))?;
        sqlx::query("DELETE FROM cards WHERE id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del card"))?;
        // Keep positions dense: everything above the removed slot shifts
        // down by one.
        sqlx::query("UPDATE cards SET position = position - 1 WHERE deck_id=? AND position > ?")
            .bind(card.deck_id.to_string())
            .bind(card.position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("renumber cards"))?;
        sqlx::query(
            "UPDATE decks SET card_count = MAX(card_count - 1, 0), updated_at=? WHERE id=?",
        )
        .bind(dt_to_ms(Utc::now()))
        .bind(card.deck_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("update deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn reorder_cards(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        ordered: &[CardId],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;

        let rows = sqlx::query(&format!("SELECT {CARD_COLS} FROM cards WHERE deck_id=?"))
            .bind(deck_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("list cards"))?;
        let current: Vec<Card> = rows
            .iter()
            .map(row_into_card)
            .collect::<Result<_, _>>()?;
        validate_reorder(current.iter(), ordered)?;

        for (index, card_id) in ordered.iter().enumerate() {
            sqlx::query("UPDATE cards SET position=? WHERE id=?")
                .bind(index as i64)
                .bind(card_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|_| CoreError::Storage("update card"))?;
        }

        sqlx::query("UPDATE decks SET updated_at=? WHERE id=?")
            .bind(dt_to_ms(Utc::now()))
            .bind(deck_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update deck"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))
    }

    // ===== Tags =====
    async fn create_tag(
        &self,
        user_id: UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Tag, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let exists = sqlx::query("SELECT 1 FROM tags WHERE user_id=? AND lower(name)=lower(?) LIMIT 1")
            .bind(user_id.to_string())
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read tag"))?
            .is_some();
        if exists {
            return Err(CoreError::Conflict("tag name already exists"));
        }

        let tag = Tag::new(user_id, name, color.map(str::to_string));
        sqlx::query("INSERT INTO tags (id, user_id, name, color, created_at) VALUES (?,?,?,?,?)")
            .bind(tag.id.to_string())
            .bind(tag.user_id.to_string())
            .bind(&tag.name)
            .bind(tag.color.clone())
            .bind(dt_to_ms(tag.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("insert tag"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(tag)
    }

    async fn list_tags(&self, user_id: UserId) -> Result<Vec<Tag>, CoreError> {
        let rows = sqlx::query("SELECT * FROM tags WHERE user_id=? ORDER BY created_at ASC")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("list tags"))?;
        rows.into_iter().map(row_into_tag).collect()
    }

    async fn tag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;
        let tag_exists = sqlx::query("SELECT 1 FROM tags WHERE id=? AND user_id=? LIMIT 1")
            .bind(tag_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read tag"))?
            .is_some();
        if !tag_exists {
            return Err(CoreError::NotFound("tag"));
        }

        sqlx::query("INSERT OR IGNORE INTO deck_tags (deck_id, tag_id) VALUES (?,?)")
            .bind(deck_id.to_string())
            .bind(tag_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("insert deck tag"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn untag_deck(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        tag_id: TagId,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;
        sqlx::query("DELETE FROM deck_tags WHERE deck_id=? AND tag_id=?")
            .bind(deck_id.to_string())
            .bind(tag_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del deck tag"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn list_deck_tags(
        &self,
        user_id: UserId,
        deck_id: DeckId,
    ) -> Result<Vec<Tag>, CoreError> {
        fetch_owned_deck(&self.pool, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;
        let rows = sqlx::query(
            r#"SELECT t.id, t.user_id, t.name, t.color, t.created_at
               FROM tags t JOIN deck_tags dt ON dt.tag_id = t.id
               WHERE dt.deck_id=? ORDER BY t.created_at ASC"#,
        )
        .bind(deck_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list deck tags"))?;
        rows.into_iter().map(row_into_tag).collect()
    }

    // ===== Progress =====
    async fn get_or_create_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLS} FROM card_progress WHERE user_id=? AND card_id=?"
        ))
        .bind(user_id.to_string())
        .bind(card_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("read progress"))?;
        if let Some(row) = row {
            return row_into_progress(&row);
        }

        let card = fetch_owned_card(&mut *tx, user_id, card_id)
            .await?
            .ok_or(CoreError::NotFound("card"))?;
        let progress = CardProgress::new(user_id, card_id, card.deck_id, now);
        insert_progress(&mut *tx, &progress).await?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(progress)
    }

    async fn get_progress(
        &self,
        user_id: UserId,
        card_id: CardId,
    ) -> Result<Option<CardProgress>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLS} FROM card_progress WHERE user_id=? AND card_id=?"
        ))
        .bind(user_id.to_string())
        .bind(card_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("read progress"))?;
        row.as_ref().map(row_into_progress).transpose()
    }

    async fn record_grade(
        &self,
        user_id: UserId,
        card_id: CardId,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<CardProgress, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let existing = sqlx::query(&format!(
            "SELECT {PROGRESS_COLS} FROM card_progress WHERE user_id=? AND card_id=?"
        ))
        .bind(user_id.to_string())
        .bind(card_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("read progress"))?;

        let (current, existed) = match existing {
            Some(row) => (row_into_progress(&row)?, true),
            None => {
                let card = fetch_owned_card(&mut *tx, user_id, card_id)
                    .await?
                    .ok_or(CoreError::NotFound("card"))?;
                (CardProgress::new(user_id, card_id, card.deck_id, now), false)
            }
        };

        let updated = apply_grade(current, grade, now);
        if existed {
            sqlx::query(
                r#"UPDATE card_progress
                   SET status=?, ease_factor=?, interval_days=?, repetitions=?, next_review_at=?, last_reviewed_at=?
                   WHERE id=?"#,
            )
            .bind(updated.status.as_str())
            .bind(updated.ease_factor)
            .bind(updated.interval_days as i64)
            .bind(updated.repetitions as i64)
            .bind(dt_to_ms(updated.next_review_at))
            .bind(updated.last_reviewed_at.map(dt_to_ms))
            .bind(updated.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update progress"))?;
        } else {
            insert_progress(&mut *tx, &updated).await?;
        }

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(updated)
    }

    async fn due_queue(
        &self,
        user_id: UserId,
        deck_id: Option<DeckId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCard>, CoreError> {
        const SELECT: &str = r#"
            SELECT p.id AS p_id, p.user_id AS p_user_id, p.card_id AS p_card_id, p.deck_id AS p_deck_id,
                   p.status AS p_status, p.ease_factor AS p_ease_factor, p.interval_days AS p_interval_days,
                   p.repetitions AS p_repetitions, p.next_review_at AS p_next_review_at,
                   p.last_reviewed_at AS p_last_reviewed_at, p.created_at AS p_created_at,
                   c.id, c.deck_id, c.front_text, c.front_image_url, c.back_text, c.back_image_url,
                   c.position, c.created_at, c.updated_at
            FROM card_progress p JOIN cards c ON c.id = p.card_id
        "#;

        let rows = if let Some(deck) = deck_id {
            sqlx::query(&format!(
                "{SELECT} WHERE p.user_id=? AND p.deck_id=? AND p.next_review_at <= ?
                 ORDER BY p.next_review_at ASC, c.created_at ASC LIMIT ?"
            ))
            .bind(user_id.to_string())
            .bind(deck.to_string())
            .bind(dt_to_ms(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(&format!(
                "{SELECT} WHERE p.user_id=? AND p.next_review_at <= ?
                 ORDER BY p.next_review_at ASC, c.created_at ASC LIMIT ?"
            ))
            .bind(user_id.to_string())
            .bind(dt_to_ms(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|_| CoreError::Storage("due queue"))?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let progress = CardProgress {
                id: uuid_from_str(row.get::<String, _>("p_id"))?,
                user_id: uuid_from_str(row.get::<String, _>("p_user_id"))?,
                card_id: uuid_from_str(row.get::<String, _>("p_card_id"))?,
                deck_id: uuid_from_str(row.get::<String, _>("p_deck_id"))?,
                status: CardStatus::from_str(&row.get::<String, _>("p_status"))
                    .ok_or(CoreError::Invalid("status"))?,
                ease_factor: row.get::<f64, _>("p_ease_factor"),
                interval_days: row.get::<i64, _>("p_interval_days") as u32,
                repetitions: row.get::<i64, _>("p_repetitions") as u32,
                next_review_at: dt_from_ms(row.get::<i64, _>("p_next_review_at"))?,
                last_reviewed_at: row
                    .get::<Option<i64>, _>("p_last_reviewed_at")
                    .map(dt_from_ms)
                    .transpose()?,
                created_at: dt_from_ms(row.get::<i64, _>("p_created_at"))?,
            };
            let card = row_into_card(&row)?;
            due.push(DueCard { card, progress });
        }
        Ok(due)
    }

    // ===== Sessions & stats =====
    async fn start_session(
        &self,
        user_id: UserId,
        deck_id: DeckId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        fetch_owned_deck(&mut *tx, user_id, deck_id)
            .await?
            .ok_or(CoreError::NotFound("deck"))?;

        // A dangling session never properly ended; close it at zero
        // duration without touching stats.
        sqlx::query("UPDATE study_sessions SET ended_at = started_at WHERE user_id=? AND ended_at IS NULL")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("close session"))?;

        let session = StudySession::new(user_id, deck_id, now);
        sqlx::query(
            r#"INSERT INTO study_sessions
               (id, user_id, deck_id, started_at, ended_at, cards_studied, correct_count, incorrect_count)
               VALUES (?,?,?,?,?,?,?,?)"#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.deck_id.to_string())
        .bind(dt_to_ms(session.started_at))
        .bind(session.ended_at.map(dt_to_ms))
        .bind(session.cards_studied as i64)
        .bind(session.correct_count as i64)
        .bind(session.incorrect_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("insert session"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(session)
    }

    async fn record_answer(
        &self,
        user_id: UserId,
        session_id: SessionId,
        correct: bool,
    ) -> Result<StudySession, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let row = sqlx::query("SELECT * FROM study_sessions WHERE id=? AND user_id=?")
            .bind(session_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read session"))?
            .ok_or(CoreError::NotFound("session"))?;
        let mut session = row_into_session(row)?;
        if session.ended_at.is_some() {
            return Err(CoreError::Invalid("session already ended"));
        }

        session.cards_studied += 1;
        if correct {
            session.correct_count += 1;
        } else {
            session.incorrect_count += 1;
        }
        sqlx::query(
            "UPDATE study_sessions SET cards_studied=?, correct_count=?, incorrect_count=? WHERE id=?",
        )
        .bind(session.cards_studied as i64)
        .bind(session.correct_count as i64)
        .bind(session.incorrect_count as i64)
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("update session"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(session)
    }

    async fn end_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<StudySession, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|_| CoreError::Storage("tx"))?;

        let row = sqlx::query("SELECT * FROM study_sessions WHERE id=? AND user_id=?")
            .bind(session_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read session"))?
            .ok_or(CoreError::NotFound("session"))?;
        let mut session = row_into_session(row)?;
        if session.ended_at.is_some() {
            return Err(CoreError::Invalid("session already ended"));
        }
        session.ended_at = Some(now);

        sqlx::query("UPDATE study_sessions SET ended_at=? WHERE id=?")
            .bind(dt_to_ms(now))
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update session"))?;

        let mut stats = sqlx::query("SELECT * FROM user_stats WHERE user_id=?")
            .bind(user_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read stats"))?
            .map(row_into_stats)
            .transpose()?
            .unwrap_or_else(|| UserStats::new(user_id));
        apply_session_close(&mut stats, &session, now);

        sqlx::query(
            r#"INSERT INTO user_stats
               (user_id, current_streak, longest_streak, last_study_date, total_cards_studied, total_time_spent_secs)
               VALUES (?,?,?,?,?,?)
               ON CONFLICT(user_id) DO UPDATE SET
                 current_streak=excluded.current_streak,
                 longest_streak=excluded.longest_streak,
                 last_study_date=excluded.last_study_date,
                 total_cards_studied=excluded.total_cards_studied,
                 total_time_spent_secs=excluded.total_time_spent_secs"#,
        )
        .bind(stats.user_id.to_string())
        .bind(stats.current_streak as i64)
        .bind(stats.longest_streak as i64)
        .bind(stats.last_study_date.map(date_to_str))
        .bind(stats.total_cards_studied as i64)
        .bind(stats.total_time_spent_secs as i64)
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("update stats"))?;

        tx.commit().await.map_err(|_| CoreError::Storage("tx commit"))?;
        Ok(session)
    }

    async fn get_stats(&self, user_id: UserId) -> Result<Option<UserStats>, CoreError> {
        let row = sqlx::query("SELECT * FROM user_stats WHERE user_id=?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("read stats"))?;
        row.map(row_into_stats).transpose()
    }
}
