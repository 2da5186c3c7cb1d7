use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, ValueEnum)]
pub enum StoreKind {
    Json,
    Sqlite,
}

#[derive(Debug, Parser, Clone)]
#[command(name = "revise", version, about = "Revise — spaced-repetition flashcards CLI")]
pub struct Cli {
    /// Storage backend
    #[arg(long, value_enum, default_value_t = StoreKind::Json)]
    pub store: StoreKind,

    /// SQLite DB path when --store sqlite (defaults to app data dir)
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Acting user id (defaults to the local profile)
    #[arg(long)]
    pub user: Option<Uuid>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Deck operations
    #[command(subcommand)]
    Deck(DeckCmd),
    /// Card operations
    #[command(subcommand)]
    Card(CardCmd),
    /// Tag operations
    #[command(subcommand)]
    Tag(TagCmd),
    /// Study loop over the due queue
    Study(StudyCmd),
    /// Streak and usage statistics
    Stats,
}

#[derive(Debug, Subcommand, Clone)]
pub enum DeckCmd {
    Add(DeckAdd),
    List,
    Edit(DeckEdit),
    Rm { deck: String },
    /// Attach a tag to a deck
    Tag { deck: String, tag: String },
    /// Detach a tag from a deck
    Untag { deck: String, tag: String },
    /// List a deck's tags
    Tags { deck: String },
}

#[derive(Debug, Args, Clone)]
pub struct DeckAdd {
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub public: bool,
}

#[derive(Debug, Args, Clone)]
pub struct DeckEdit {
    pub deck: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub public: Option<bool>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CardCmd {
    Add(CardAdd),
    List {
        #[arg(long)]
        deck: String,
    },
    Rm {
        card_id: String,
    },
    Edit(CardEdit),
    /// Reassign positions: the full card id list in the new order
    Reorder {
        #[arg(long)]
        deck: String,
        card_ids: Vec<String>,
    },
}

#[derive(Debug, Args, Clone)]
pub struct CardAdd {
    #[arg(long)]
    pub deck: String,
    #[arg(long)]
    pub front: Option<String>,
    #[arg(long)]
    pub back: Option<String>,
    #[arg(long)]
    pub front_image: Option<String>,
    #[arg(long)]
    pub back_image: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct CardEdit {
    pub card_id: String,
    #[arg(long)]
    pub front: Option<String>,
    #[arg(long)]
    pub back: Option<String>,
    #[arg(long)]
    pub front_image: Option<String>,
    #[arg(long)]
    pub back_image: Option<String>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TagCmd {
    Add {
        name: String,
        #[arg(long)]
        color: Option<String>,
    },
    List,
}

#[derive(Debug, Args, Clone)]
pub struct StudyCmd {
    pub deck: String,
    #[arg(long, default_value_t = 50)]
    pub max: usize,
}
