use chrono::{Duration, Utc};
use revise_core::{CardContent, CardStatus, CoreError, Grade, NewDeck, Repository};
use revise_json::JsonStore;
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> JsonStore {
    JsonStore::open_with(
        dir.path().join("revise.json"),
        dir.path().join("backups"),
        3,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let u = Uuid::new_v4();
    let now = Utc::now();

    let (deck_id, card_id) = {
        let store = open_store(&dir).await;
        let deck = store.create_deck(u, NewDeck::named("Persist")).await.unwrap();
        let card = store
            .add_card(u, deck.id, CardContent::text("q", "a"))
            .await
            .unwrap();
        store.record_grade(u, card.id, Grade::Good, now).await.unwrap();
        (deck.id, card.id)
    };

    let store = open_store(&dir).await;
    let deck = store.get_deck(u, deck_id).await.unwrap();
    assert_eq!(deck.name, "Persist");
    assert_eq!(deck.card_count, 1);

    let progress = store.get_progress(u, card_id).await.unwrap().unwrap();
    assert_eq!(progress.status, CardStatus::Review);
    assert_eq!(progress.interval_days, 1);
    assert_eq!(progress.repetitions, 1);
}

#[tokio::test]
async fn consistency_rules_apply() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let u = Uuid::new_v4();
    let deck = store.create_deck(u, NewDeck::named("Rules")).await.unwrap();

    let mut cards = Vec::new();
    for i in 0..3 {
        cards.push(
            store
                .add_card(u, deck.id, CardContent::text(format!("q{i}"), format!("a{i}")))
                .await
                .unwrap(),
        );
    }

    store.delete_card(u, cards[0].id).await.unwrap();
    let listed = store.list_cards(u, deck.id).await.unwrap();
    let positions: Vec<u32> = listed.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(store.get_deck(u, deck.id).await.unwrap().card_count, 2);

    let bad = store
        .reorder_cards(u, deck.id, &[cards[1].id, Uuid::new_v4()])
        .await;
    assert!(matches!(bad, Err(CoreError::Invalid(_))));

    store
        .reorder_cards(u, deck.id, &[cards[2].id, cards[1].id])
        .await
        .unwrap();
    let ids: Vec<_> = store
        .list_cards(u, deck.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![cards[2].id, cards[1].id]);
}

#[tokio::test]
async fn study_flow_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let u = Uuid::new_v4();
    let deck = store.create_deck(u, NewDeck::named("Study")).await.unwrap();
    let card = store
        .add_card(u, deck.id, CardContent::text("q", "a"))
        .await
        .unwrap();

    let now = Utc::now();
    let session = store.start_session(u, deck.id, now).await.unwrap();
    store.get_or_create_progress(u, card.id, now).await.unwrap();

    let due = store
        .due_queue(u, Some(deck.id), now + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);

    store.record_grade(u, card.id, Grade::Good, now).await.unwrap();
    store.record_answer(u, session.id, true).await.unwrap();
    store
        .end_session(u, session.id, now + Duration::minutes(5))
        .await
        .unwrap();

    let stats = store.get_stats(u).await.unwrap().unwrap();
    assert_eq!(stats.current_streak, 1);
    assert_eq!(stats.total_cards_studied, 1);
    assert_eq!(stats.total_time_spent_secs, 300);
}

#[tokio::test]
async fn backups_rotate() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let u = Uuid::new_v4();

    for i in 0..6 {
        store
            .create_deck(u, NewDeck::named(format!("Deck {i}")))
            .await
            .unwrap();
    }

    let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    assert!(!backups.is_empty());
    assert!(backups.len() <= 3);
}
