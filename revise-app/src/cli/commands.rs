use crate::cli::opts::*;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use revise_core::{
    CardContent, DeckPatch, Grade, NewDeck, Repository, Tag, UserId,
};
use revise_json::paths::data_root;
use revise_json::JsonStore;
use revise_sqlite::SqliteRepo;
use std::io::{stdin, stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub async fn run_cli(args: Cli) -> Result<()> {
    let repo = open_repo(&args.store, args.db_path.clone()).await?;
    let user = args.user.unwrap_or_else(local_user);
    match args.cmd {
        Command::Deck(cmd) => deck_cmd(repo, user, cmd).await,
        Command::Card(cmd) => card_cmd(repo, user, cmd).await,
        Command::Tag(cmd) => tag_cmd(repo, user, cmd).await,
        Command::Study(cmd) => study_cmd(repo, user, cmd).await,
        Command::Stats => stats_cmd(repo, user).await,
    }
}

/// Single-user CLI profile; multi-user callers pass --user explicitly.
fn local_user() -> UserId {
    Uuid::nil()
}

pub async fn open_repo(store: &StoreKind, db_path: Option<PathBuf>) -> Result<Arc<dyn Repository>> {
    match store {
        StoreKind::Json => {
            let s = JsonStore::open_default().await?;
            Ok(Arc::new(s))
        }
        StoreKind::Sqlite => {
            let p = db_path.unwrap_or_else(|| data_root().join("revise.sqlite3"));
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let s = SqliteRepo::open_file(&p).await?;
            Ok(Arc::new(s))
        }
    }
}

async fn deck_cmd(repo: Arc<dyn Repository>, user: UserId, cmd: DeckCmd) -> Result<()> {
    match cmd {
        DeckCmd::Add(a) => {
            let deck = repo
                .create_deck(
                    user,
                    NewDeck {
                        name: a.name,
                        description: a.description,
                        is_public: a.public,
                        ..NewDeck::default()
                    },
                )
                .await?;
            println!("{}", deck.id);
        }
        DeckCmd::List => {
            for d in repo.list_decks(user).await? {
                println!("{}\t{}\t{} card(s)", d.id, d.name, d.card_count);
            }
        }
        DeckCmd::Edit(e) => {
            let deck = resolve_deck(&*repo, user, &e.deck).await?;
            repo.update_deck(
                user,
                deck.id,
                DeckPatch {
                    name: e.name,
                    description: e.description,
                    is_public: e.public,
                },
            )
            .await?;
            println!("ok");
        }
        DeckCmd::Rm { deck } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            repo.delete_deck(user, d.id).await?;
            println!("ok");
        }
        DeckCmd::Tag { deck, tag } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            let t = resolve_tag(&*repo, user, &tag).await?;
            repo.tag_deck(user, d.id, t.id).await?;
            println!("ok");
        }
        DeckCmd::Untag { deck, tag } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            let t = resolve_tag(&*repo, user, &tag).await?;
            repo.untag_deck(user, d.id, t.id).await?;
            println!("ok");
        }
        DeckCmd::Tags { deck } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            for t in repo.list_deck_tags(user, d.id).await? {
                println!("{}\t{}", t.id, t.name);
            }
        }
    }
    Ok(())
}

async fn card_cmd(repo: Arc<dyn Repository>, user: UserId, cmd: CardCmd) -> Result<()> {
    match cmd {
        CardCmd::Add(a) => {
            let deck = resolve_deck(&*repo, user, &a.deck).await?;
            let card = repo
                .add_card(
                    user,
                    deck.id,
                    CardContent {
                        front_text: a.front,
                        front_image_url: a.front_image,
                        back_text: a.back,
                        back_image_url: a.back_image,
                    },
                )
                .await?;
            println!("{}", card.id);
        }
        CardCmd::List { deck } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            for c in repo.list_cards(user, d.id).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    c.position,
                    c.id,
                    side(&c.front_text, &c.front_image_url),
                    side(&c.back_text, &c.back_image_url)
                );
            }
        }
        CardCmd::Rm { card_id } => {
            let id = parse_uuid(&card_id)?;
            repo.delete_card(user, id).await?;
            println!("ok");
        }
        CardCmd::Edit(e) => {
            let id = parse_uuid(&e.card_id)?;
            let card = repo.get_card(user, id).await?;
            let content = CardContent {
                front_text: e.front.or(card.front_text),
                front_image_url: e.front_image.or(card.front_image_url),
                back_text: e.back.or(card.back_text),
                back_image_url: e.back_image.or(card.back_image_url),
            };
            repo.update_card(user, id, content).await?;
            println!("ok");
        }
        CardCmd::Reorder { deck, card_ids } => {
            let d = resolve_deck(&*repo, user, &deck).await?;
            let ids = card_ids
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<Result<Vec<_>>>()?;
            repo.reorder_cards(user, d.id, &ids).await?;
            println!("ok");
        }
    }
    Ok(())
}

async fn tag_cmd(repo: Arc<dyn Repository>, user: UserId, cmd: TagCmd) -> Result<()> {
    match cmd {
        TagCmd::Add { name, color } => {
            let tag = repo.create_tag(user, &name, color.as_deref()).await?;
            println!("{}", tag.id);
        }
        TagCmd::List => {
            for t in repo.list_tags(user).await? {
                println!("{}\t{}\t{}", t.id, t.name, t.color.as_deref().unwrap_or("-"));
            }
        }
    }
    Ok(())
}

async fn study_cmd(repo: Arc<dyn Repository>, user: UserId, cmd: StudyCmd) -> Result<()> {
    let deck = resolve_deck(&*repo, user, &cmd.deck).await?;
    let now = Utc::now();

    // First exposure creates the progress rows, which puts every new card
    // into today's queue.
    for card in repo.list_cards(user, deck.id).await? {
        if repo.get_progress(user, card.id).await?.is_none() {
            repo.get_or_create_progress(user, card.id, now).await?;
        }
    }

    let queue = repo.due_queue(user, Some(deck.id), now, cmd.max).await?;
    if queue.is_empty() {
        println!("no cards due");
        return Ok(());
    }

    let session = repo.start_session(user, deck.id, now).await?;
    let total = queue.len();
    let mut seen = 0usize;

    'cards: for item in queue {
        seen += 1;
        let card = &item.card;
        println!("\n[{seen}/{total}]");
        println!("Q: {}", side(&card.front_text, &card.front_image_url));
        prompt_enter("[enter=show]")?;
        println!("A: {}", side(&card.back_text, &card.back_image_url));
        println!("[1=Again, 2=Hard, 3=Good, 4=Easy, s=skip, q=quit]");
        let grade = loop {
            let line = read_line("grade> ")?;
            match line.trim().to_lowercase().as_str() {
                "1" | "a" | "again" => break Some(Grade::Again),
                "2" | "h" | "hard" => break Some(Grade::Hard),
                "3" | "g" | "good" => break Some(Grade::Good),
                "4" | "e" | "easy" => break Some(Grade::Easy),
                "s" | "skip" => break None,
                "q" | "quit" => break 'cards,
                _ => {
                    println!("enter 1-4, s, or q");
                }
            }
        };

        if let Some(grade) = grade {
            let progress = repo.record_grade(user, card.id, grade, Utc::now()).await?;
            repo.record_answer(user, session.id, grade.is_correct()).await?;
            if progress.interval_days == 0 {
                println!("→ again shortly");
            } else {
                println!("→ next due in {} day(s)", progress.interval_days);
            }
        }
    }

    let ended = repo.end_session(user, session.id, Utc::now()).await?;
    println!(
        "\nstudied {} card(s): {} correct, {} wrong",
        ended.cards_studied, ended.correct_count, ended.incorrect_count
    );
    if let Some(stats) = repo.get_stats(user).await? {
        println!(
            "streak: {} day(s), best {}",
            stats.current_streak, stats.longest_streak
        );
    }
    Ok(())
}

async fn stats_cmd(repo: Arc<dyn Repository>, user: UserId) -> Result<()> {
    match repo.get_stats(user).await? {
        Some(s) => {
            println!("current streak: {} day(s)", s.current_streak);
            println!("longest streak: {} day(s)", s.longest_streak);
            if let Some(d) = s.last_study_date {
                println!("last studied:   {d}");
            }
            println!("cards studied:  {}", s.total_cards_studied);
            println!("time spent:     {} min", s.total_time_spent_secs / 60);
        }
        None => println!("no study activity yet"),
    }
    Ok(())
}

// ===== Helpers =====
fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| anyhow!("invalid uuid: {s}"))
}

fn side(text: &Option<String>, image: &Option<String>) -> String {
    match (text, image) {
        (Some(t), Some(i)) => format!("{t} [image: {i}]"),
        (Some(t), None) => t.clone(),
        (None, Some(i)) => format!("[image: {i}]"),
        (None, None) => "(empty)".to_string(),
    }
}

async fn resolve_deck<R: Repository + ?Sized>(
    repo: &R,
    user: UserId,
    sel: &str,
) -> Result<revise_core::Deck> {
    if let Ok(id) = Uuid::parse_str(sel) {
        if let Ok(d) = repo.get_deck(user, id).await {
            return Ok(d);
        }
    }
    let decks = repo.list_decks(user).await?;
    if let Some(d) = decks.into_iter().find(|d| d.name.eq_ignore_ascii_case(sel)) {
        return Ok(d);
    }
    bail!("deck not found: {sel}")
}

async fn resolve_tag<R: Repository + ?Sized>(repo: &R, user: UserId, sel: &str) -> Result<Tag> {
    if let Ok(id) = Uuid::parse_str(sel) {
        if let Some(t) = repo.list_tags(user).await?.into_iter().find(|t| t.id == id) {
            return Ok(t);
        }
    }
    let tags = repo.list_tags(user).await?;
    if let Some(t) = tags.into_iter().find(|t| t.name.eq_ignore_ascii_case(sel)) {
        return Ok(t);
    }
    bail!("tag not found: {sel}")
}

fn prompt_enter(label: &str) -> Result<()> {
    print!("{label}");
    stdout().flush().ok();
    let mut s = String::new();
    stdin().read_line(&mut s)?;
    Ok(())
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    stdout().flush().ok();
    let mut s = String::new();
    stdin().read_line(&mut s)?;
    Ok(s)
}
