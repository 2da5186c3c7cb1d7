use chrono::Utc;
use revise_core::{
    repo::memory::MemoryRepo, CardContent, CoreError, Grade, NewDeck, Repository, UserId,
};
use uuid::Uuid;

fn user() -> UserId {
    Uuid::new_v4()
}

async fn deck_with_cards(
    repo: &MemoryRepo,
    user_id: UserId,
    n: usize,
) -> (revise_core::Deck, Vec<revise_core::Card>) {
    let deck = repo
        .create_deck(user_id, NewDeck::named("Spanish"))
        .await
        .unwrap();
    let mut cards = Vec::new();
    for i in 0..n {
        let content = CardContent::text(format!("front {i}"), format!("back {i}"));
        cards.push(repo.add_card(user_id, deck.id, content).await.unwrap());
    }
    (deck, cards)
}

#[tokio::test]
async fn insert_assigns_dense_positions_and_counts() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = deck_with_cards(&repo, u, 4).await;

    let positions: Vec<u32> = cards.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert_eq!(repo.get_deck(u, deck.id).await.unwrap().card_count, 4);
}

#[tokio::test]
async fn delete_renumbers_remaining_positions() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = deck_with_cards(&repo, u, 5).await;

    repo.delete_card(u, cards[1].id).await.unwrap();
    repo.delete_card(u, cards[3].id).await.unwrap();

    let remaining = repo.list_cards(u, deck.id).await.unwrap();
    let positions: Vec<u32> = remaining.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    let ids: Vec<_> = remaining.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![cards[0].id, cards[2].id, cards[4].id]);
    assert_eq!(repo.get_deck(u, deck.id).await.unwrap().card_count, 3);
}

#[tokio::test]
async fn reorder_assigns_positions_by_index() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = deck_with_cards(&repo, u, 3).await;
    let (c1, c2, c3) = (cards[0].id, cards[1].id, cards[2].id);

    repo.reorder_cards(u, deck.id, &[c3, c1, c2]).await.unwrap();

    let listed = repo.list_cards(u, deck.id).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![c3, c1, c2]);
    let positions: Vec<u32> = listed.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn reorder_rejects_mismatched_lists() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = deck_with_cards(&repo, u, 3).await;
    let (c1, c2, c3) = (cards[0].id, cards[1].id, cards[2].id);

    let short = repo.reorder_cards(u, deck.id, &[c1, c2]).await;
    assert!(matches!(short, Err(CoreError::Invalid(_))));

    let duplicated = repo.reorder_cards(u, deck.id, &[c1, c1, c2]).await;
    assert!(matches!(duplicated, Err(CoreError::Invalid(_))));

    let foreign = repo.reorder_cards(u, deck.id, &[c1, c2, Uuid::new_v4()]).await;
    assert!(matches!(foreign, Err(CoreError::Invalid(_))));

    // The failed requests must not have moved anything.
    let listed = repo.list_cards(u, deck.id).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![c1, c2, c3]);
}

#[tokio::test]
async fn positions_stay_dense_across_mixed_mutations() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, mut cards) = deck_with_cards(&repo, u, 4).await;

    repo.delete_card(u, cards.remove(2).id).await.unwrap();
    let added = repo
        .add_card(u, deck.id, CardContent::text("late", "card"))
        .await
        .unwrap();
    assert_eq!(added.position, 3);

    let listed = repo.list_cards(u, deck.id).await.unwrap();
    let mut positions: Vec<u32> = listed.iter().map(|c| c.position).collect();
    positions.sort_unstable();
    assert_eq!(positions, (0..listed.len() as u32).collect::<Vec<_>>());
    assert_eq!(
        repo.get_deck(u, deck.id).await.unwrap().card_count as usize,
        listed.len()
    );
}

#[tokio::test]
async fn deck_delete_cascades_cards_progress_and_links() {
    let repo = MemoryRepo::new();
    let u = user();
    let (deck, cards) = deck_with_cards(&repo, u, 3).await;

    let now = Utc::now();
    for card in &cards {
        repo.record_grade(u, card.id, Grade::Good, now).await.unwrap();
    }
    let tag = repo.create_tag(u, "exam", Some("#ff0000")).await.unwrap();
    repo.tag_deck(u, deck.id, tag.id).await.unwrap();

    repo.delete_deck(u, deck.id).await.unwrap();

    assert!(matches!(
        repo.get_deck(u, deck.id).await,
        Err(CoreError::NotFound(_))
    ));
    for card in &cards {
        assert!(matches!(
            repo.get_card(u, card.id).await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(repo.get_progress(u, card.id).await.unwrap(), None);
    }
    // The tag itself survives; only the deck link goes away.
    assert_eq!(repo.list_tags(u).await.unwrap().len(), 1);
}

#[tokio::test]
async fn foreign_records_report_not_found() {
    let repo = MemoryRepo::new();
    let owner = user();
    let stranger = user();
    let (deck, cards) = deck_with_cards(&repo, owner, 2).await;

    assert!(matches!(
        repo.get_deck(stranger, deck.id).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        repo.get_card(stranger, cards[0].id).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        repo.delete_card(stranger, cards[0].id).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        repo.record_grade(stranger, cards[0].id, Grade::Good, Utc::now()).await,
        Err(CoreError::NotFound(_))
    ));

    // Nothing was mutated through the denied calls.
    assert_eq!(repo.get_deck(owner, deck.id).await.unwrap().card_count, 2);
}

#[tokio::test]
async fn duplicate_deck_name_conflicts() {
    let repo = MemoryRepo::new();
    let u = user();
    repo.create_deck(u, NewDeck::named("Biology")).await.unwrap();
    let err = repo.create_deck(u, NewDeck::named("biology")).await;
    assert!(matches!(err, Err(CoreError::Conflict(_))));

    // Same name under a different user is fine.
    let other = user();
    assert!(repo.create_deck(other, NewDeck::named("Biology")).await.is_ok());
}
