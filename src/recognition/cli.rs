//! suggestions - review pending face suggestions and manage known identities.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::engine::{MatchSettings, Recognizer};
use super::files::FileStore;
use super::store::SuggestionRow;
use crate::config::FacewatchConfig;
use crate::detect::BackendRegistry;
use crate::frame::FaceRect;

#[derive(Parser, Debug)]
#[command(name = "suggestions", about = "Review unrecognized faces")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "FACEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List pending suggestions
    List {
        #[arg(long)]
        json: bool,
    },

    /// Re-match every pending suggestion against the current known faces
    Compute,

    /// Delete every pending suggestion
    Clear,

    /// Store a suggestion as a known face
    Confirm {
        query: String,
        suggestion: String,
        /// Identity to assign; defaults to the tentative match
        #[arg(long)]
        identity: Option<String>,
    },

    /// Discard a suggestion
    Delete { query: String, suggestion: String },

    /// List known identities
    Identities,

    /// Create an identity and print its id
    AddIdentity { first_name: String, last_name: String },

    /// Learn a known face from an image holding exactly one face
    Learn { identity: String, image: PathBuf },
}

#[derive(Serialize)]
struct SuggestionView<'a> {
    #[serde(flatten)]
    suggestion: &'a SuggestionRow,
    identity_name: Option<String>,
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = FacewatchConfig::load_from(args.config.as_deref())?;
    let mut recognizer = open_recognizer(&config)?;

    match args.command {
        Command::List { json } => cmd_list(&recognizer, json),
        Command::Compute => {
            let report = recognizer.compute_suggestions()?;
            println!(
                "Confirmed: {}  Updated: {}  Skipped: {}",
                report.confirmed, report.updated, report.skipped
            );
            Ok(())
        }
        Command::Clear => {
            let removed = recognizer.clear_suggestions()?;
            println!("Removed {} suggestion(s)", removed);
            Ok(())
        }
        Command::Confirm {
            query,
            suggestion,
            identity,
        } => {
            let encoding = recognizer.confirm_suggestion(&query, &suggestion, identity.as_deref())?;
            println!(
                "Suggestion {} stored as face {} of identity {}",
                suggestion, encoding.id, encoding.identity_id
            );
            Ok(())
        }
        Command::Delete { query, suggestion } => {
            recognizer.delete_suggestion(&query, &suggestion)?;
            println!("Suggestion {} deleted", suggestion);
            Ok(())
        }
        Command::Identities => {
            for identity in recognizer.identities()? {
                println!("{}  {}", identity.id, identity.display_name());
            }
            Ok(())
        }
        Command::AddIdentity {
            first_name,
            last_name,
        } => {
            let identity = recognizer.create_identity(&first_name, &last_name)?;
            println!("{}", identity.id);
            Ok(())
        }
        Command::Learn { identity, image } => cmd_learn(&mut recognizer, &identity, &image),
    }
}

fn open_recognizer(config: &FacewatchConfig) -> Result<Recognizer> {
    let backend = BackendRegistry::for_config(&config.recognition)?.create_default()?;
    Recognizer::open(
        &config.db_path,
        FileStore::new(config.file_store_root()),
        backend,
        MatchSettings::from(&config.recognition),
    )
}

fn cmd_list(recognizer: &Recognizer, json: bool) -> Result<()> {
    let suggestions = recognizer.suggestions()?;
    let mut views = Vec::with_capacity(suggestions.len());
    for suggestion in &suggestions {
        let identity_name = match &suggestion.identity_id {
            Some(id) => super::store::get_identity(recognizer.connection(), id)?
                .map(|identity| identity.display_name()),
            None => None,
        };
        views.push(SuggestionView {
            suggestion,
            identity_name,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("No pending suggestions");
        return Ok(());
    }
    for view in &views {
        let s = view.suggestion;
        let score = s
            .score
            .map(|score| format!("{:.2}", score))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {}  [{},{},{},{}]  {} ({})  {}",
            s.query_id,
            s.id,
            s.rect.top,
            s.rect.right,
            s.rect.bottom,
            s.rect.left,
            view.identity_name.as_deref().unwrap_or("unknown"),
            score,
            recognizer
                .files()
                .suggestion_path(&s.query_id, &s.id)
                .display()
        );
    }
    Ok(())
}

fn cmd_learn(recognizer: &mut Recognizer, identity: &str, path: &Path) -> Result<()> {
    let image = recognizer
        .files()
        .read_image(path)
        .with_context(|| format!("load {}", path.display()))?;
    let faces = recognizer.locate(&image)?;
    let rect = match faces.as_slice() {
        [rect] => *rect,
        [] => {
            log::warn!("No face located in {}, using the whole image", path.display());
            FaceRect::full(image.width(), image.height())
        }
        _ => return Err(anyhow!("{} faces found in {}", faces.len(), path.display())),
    };
    let encoding = recognizer.create_face_encoding(identity, &image, rect, None)?;
    println!("Face {} stored for identity {}", encoding.id, identity);
    Ok(())
}
