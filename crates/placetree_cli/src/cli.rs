use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "placetree", version, about = "Place classification trees on SQLite")]
pub struct Cli {
    #[arg(long, global = true, default_value = "placetree.db", help = "SQLite database file")]
    pub db: PathBuf,
    #[arg(
        long,
        global = true,
        default_value = placetree_core::default_log_level(),
        help = "trace|debug|info|warn|error"
    )]
    pub log_level: String,
    #[arg(long, global = true, help = "Absolute directory for rolling log files")]
    pub log_dir: Option<String>,
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Place {
        #[command(subcommand)]
        command: PlaceCommands,
    },
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Builds nodes of a tag from a JSON tree description.
    Import {
        #[arg(long)]
        tag: String,
        #[arg(long, help = "Attach top-level entries under this place's node")]
        place_slug: Option<String>,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Finds the nodes standing for a place in a tag.
    Resolve {
        place: String,
        tag: String,
        #[arg(long, default_value_t = false, help = "Fail unless exactly one node matches")]
        one: bool,
    },
    /// Realigns used_trees of one tag, or of every tag.
    Maintain { tag: Option<String> },
    /// Prints the tree of a tag.
    Show { tag: String },
}

#[derive(Subcommand, Debug)]
pub enum PlaceCommands {
    AddType {
        slug: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Add {
        slug: String,
        name: String,
        #[arg(long = "type")]
        place_type: String,
        #[arg(long)]
        inhabitants: Option<i64>,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
    },
    Show {
        slug: String,
    },
    /// Looks places up by `slug:value` or `scheme:name:value`.
    Find {
        external_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum TagCommands {
    Add {
        slug: String,
        label: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
}
