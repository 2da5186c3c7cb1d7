use chrono::{DateTime, Duration, TimeZone, Utc};
use revise_core::{
    repo::memory::MemoryRepo, CardContent, CardStatus, CoreError, Grade, NewDeck, Repository,
    UserId,
};
use uuid::Uuid;

fn user() -> UserId {
    Uuid::new_v4()
}

fn evening(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, 20, 0, 0).unwrap()
}

async fn seeded_deck(
    repo: &MemoryRepo,
    user_id: UserId,
    n: usize,
) -> (revise_core::Deck, Vec<revise_core::Card>) {
    let deck = repo
        .create_deck(user_id, NewDeck::named("Kanji"))
        .await
        .unwrap();
    let mut cards = Vec::new();
    for i in 0..n {
        let content = CardContent::text(format!("q{i}"), format!("a{i}"));
        cards.push(repo.add_card(user_id, deck.id, content).await.unwrap());
    }
    (deck, cards)
}

#[tokio::test]
async fn get_or_create_progress_is_idempotent() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = seeded_deck(&repo, u, 1).await;
    let now = Utc::now();

    let first = repo
        .get_or_create_progress(u, cards[0].id, now)
        .await
        .unwrap();
    assert_eq!(first.status, CardStatus::New);
    assert_eq!(first.ease_factor, 2.5);
    assert_eq!(first.interval_days, 0);
    assert_eq!(first.repetitions, 0);
    assert_eq!(first.next_review_at, now);
    assert_eq!(first.deck_id, deck.id);

    let second = repo
        .get_or_create_progress(u, cards[0].id, now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.next_review_at, first.next_review_at);
}

#[tokio::test]
async fn record_grade_creates_progress_lazily() {
    let repo = MemoryRepo::new();
    let u = user();
    let (_deck, cards) = seeded_deck(&repo, u, 1).await;
    let now = Utc::now();

    let progress = repo
        .record_grade(u, cards[0].id, Grade::Good, now)
        .await
        .unwrap();
    assert_eq!(progress.status, CardStatus::Review);
    assert_eq!(progress.interval_days, 1);
    assert_eq!(progress.repetitions, 1);

    let stored = repo.get_progress(u, cards[0].id).await.unwrap().unwrap();
    assert_eq!(stored, progress);
}

#[tokio::test]
async fn record_grade_on_unknown_card_is_not_found() {
    let repo = MemoryRepo::new();
    let err = repo
        .record_grade(user(), Uuid::new_v4(), Grade::Good, Utc::now())
        .await;
    assert!(matches!(err, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn due_queue_orders_by_due_time_and_limits() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = seeded_deck(&repo, u, 3).await;
    let t0 = Utc::now();

    // Stagger first exposures so due times differ.
    repo.get_or_create_progress(u, cards[2].id, t0).await.unwrap();
    repo.get_or_create_progress(u, cards[0].id, t0 + Duration::minutes(1))
        .await
        .unwrap();
    repo.get_or_create_progress(u, cards[1].id, t0 + Duration::minutes(2))
        .await
        .unwrap();

    let later = t0 + Duration::hours(1);
    let due = repo.due_queue(u, Some(deck.id), later, 10).await.unwrap();
    let ids: Vec<_> = due.iter().map(|d| d.card.id).collect();
    assert_eq!(ids, vec![cards[2].id, cards[0].id, cards[1].id]);

    let capped = repo.due_queue(u, Some(deck.id), later, 2).await.unwrap();
    assert_eq!(capped.len(), 2);
    assert_eq!(capped[0].card.id, cards[2].id);
}

#[tokio::test]
async fn due_queue_excludes_future_cards_and_other_decks() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = seeded_deck(&repo, u, 2).await;
    let other = repo.create_deck(u, NewDeck::named("Other")).await.unwrap();
    let other_card = repo
        .add_card(u, other.id, CardContent::text("x", "y"))
        .await
        .unwrap();

    let now = Utc::now();
    // Graded good: due tomorrow, so absent from today's queue.
    repo.record_grade(u, cards[0].id, Grade::Good, now).await.unwrap();
    repo.get_or_create_progress(u, cards[1].id, now).await.unwrap();
    repo.get_or_create_progress(u, other_card.id, now).await.unwrap();

    let due = repo
        .due_queue(u, Some(deck.id), now + Duration::minutes(5), 10)
        .await
        .unwrap();
    let ids: Vec<_> = due.iter().map(|d| d.card.id).collect();
    assert_eq!(ids, vec![cards[1].id]);

    // Unscoped queue spans decks.
    let all = repo
        .due_queue(u, None, now + Duration::minutes(5), 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    // An empty queue is an empty list, not an error.
    let empty = repo
        .due_queue(u, Some(deck.id), now - Duration::hours(1), 10)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn again_graded_card_requeues_within_session() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = seeded_deck(&repo, u, 1).await;
    let now = Utc::now();

    repo.record_grade(u, cards[0].id, Grade::Again, now).await.unwrap();

    let soon = repo
        .due_queue(u, Some(deck.id), now + Duration::minutes(15), 10)
        .await
        .unwrap();
    assert_eq!(soon.len(), 1);
    assert_eq!(soon[0].progress.status, CardStatus::Learning);
}

#[tokio::test]
async fn session_counters_track_answers() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, _cards) = seeded_deck(&repo, u, 1).await;

    let session = repo.start_session(u, deck.id, evening(1)).await.unwrap();
    repo.record_answer(u, session.id, true).await.unwrap();
    repo.record_answer(u, session.id, true).await.unwrap();
    let updated = repo.record_answer(u, session.id, false).await.unwrap();

    assert_eq!(updated.cards_studied, 3);
    assert_eq!(updated.correct_count, 2);
    assert_eq!(updated.incorrect_count, 1);
}

#[tokio::test]
async fn streak_extends_on_consecutive_days_and_resets_on_gap() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, _cards) = seeded_deck(&repo, u, 1).await;

    // Day 1.
    let s = repo.start_session(u, deck.id, evening(1)).await.unwrap();
    repo.record_answer(u, s.id, true).await.unwrap();
    repo.end_session(u, s.id, evening(1) + Duration::minutes(5))
        .await
        .unwrap();
    let stats = repo.get_stats(u).await.unwrap().unwrap();
    assert_eq!(stats.current_streak, 1);
    assert_eq!(stats.longest_streak, 1);
    assert_eq!(stats.total_cards_studied, 1);
    assert_eq!(stats.total_time_spent_secs, 300);

    // Day 2 extends.
    let s = repo.start_session(u, deck.id, evening(2)).await.unwrap();
    repo.end_session(u, s.id, evening(2) + Duration::minutes(1))
        .await
        .unwrap();
    let stats = repo.get_stats(u).await.unwrap().unwrap();
    assert_eq!(stats.current_streak, 2);
    assert_eq!(stats.longest_streak, 2);

    // Gap to day 5 resets the current streak but not the longest.
    let s = repo.start_session(u, deck.id, evening(5)).await.unwrap();
    repo.end_session(u, s.id, evening(5) + Duration::minutes(1))
        .await
        .unwrap();
    let stats = repo.get_stats(u).await.unwrap().unwrap();
    assert_eq!(stats.current_streak, 1);
    assert_eq!(stats.longest_streak, 2);
}

#[tokio::test]
async fn same_day_sessions_leave_streak_unchanged() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, _cards) = seeded_deck(&repo, u, 1).await;

    let s = repo.start_session(u, deck.id, evening(10)).await.unwrap();
    repo.end_session(u, s.id, evening(10) + Duration::minutes(2))
        .await
        .unwrap();
    let s = repo
        .start_session(u, deck.id, evening(10) + Duration::hours(1))
        .await
        .unwrap();
    repo.record_answer(u, s.id, true).await.unwrap();
    repo.end_session(u, s.id, evening(10) + Duration::hours(2))
        .await
        .unwrap();

    let stats = repo.get_stats(u).await.unwrap().unwrap();
    assert_eq!(stats.current_streak, 1);
    assert_eq!(stats.longest_streak, 1);
    // Totals still accumulate across same-day sessions.
    assert_eq!(stats.total_cards_studied, 1);
}

#[tokio::test]
async fn starting_a_session_closes_the_dangling_one() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, _cards) = seeded_deck(&repo, u, 1).await;

    let first = repo.start_session(u, deck.id, evening(1)).await.unwrap();
    let _second = repo
        .start_session(u, deck.id, evening(1) + Duration::hours(1))
        .await
        .unwrap();

    // The abandoned session was closed at zero duration; it no longer
    // accepts answers and cannot be ended again.
    let answer = repo.record_answer(u, first.id, true).await;
    assert!(matches!(answer, Err(CoreError::Invalid(_))));
    let end = repo.end_session(u, first.id, evening(1)).await;
    assert!(matches!(end, Err(CoreError::Invalid(_))));
    // And it contributed nothing to stats.
    assert!(repo.get_stats(u).await.unwrap().is_none());
}

#[tokio::test]
async fn ending_twice_and_unknown_sessions_error() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, _cards) = seeded_deck(&repo, u, 1).await;

    let s = repo.start_session(u, deck.id, evening(1)).await.unwrap();
    repo.end_session(u, s.id, evening(1) + Duration::minutes(1))
        .await
        .unwrap();
    let twice = repo
        .end_session(u, s.id, evening(1) + Duration::minutes(2))
        .await;
    assert!(matches!(twice, Err(CoreError::Invalid(_))));

    let unknown = repo.record_answer(u, Uuid::new_v4(), true).await;
    assert!(matches!(unknown, Err(CoreError::NotFound(_))));

    // A session belonging to another user is invisible.
    let s2 = repo.start_session(u, deck.id, evening(2)).await.unwrap();
    let foreign = repo.record_answer(user(), s2.id, true).await;
    assert!(matches!(foreign, Err(CoreError::NotFound(_))));
}
