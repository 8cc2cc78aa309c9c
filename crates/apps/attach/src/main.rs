//! attach - Manage stored attachments and their cache
//!
//! Administrative entry point: import files, list them, and warm, prune or
//! clear the decompressed cache.

use std::io::Write;
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use attachments::{
    AttachmentFilter, AttachmentId, Attachments, ImportOutcome, ImportRequest, Settings,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info};

mod format;

use format::{attachment_line, natural_size};

/// Manage attachments
#[derive(Parser, Debug)]
#[command(name = "attach", version, about)]
struct Cli {
    /// Settings file (defaults to settings.json in the config directory)
    #[arg(long, env = "ATTACHMENTS_SETTINGS", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import files into the attachment system
    Import {
        /// Files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Set an explicit file name
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Add an explicit content type
        #[arg(short = 'C', long)]
        content_type: Option<String>,
        /// Overwrite existing attachments
        #[arg(short = 'f', long)]
        overwrite: bool,
        /// Compression algorithm
        #[arg(short = 'c', long)]
        compression: Option<String>,
        /// Digest algorithm
        #[arg(short = 'd', long)]
        digest: Option<String>,
    },
    /// List all attachments
    List {
        /// Filter by content type
        #[arg(short = 'C', long)]
        content_type: Option<String>,
        /// Show only attachments cached on disk
        #[arg(long)]
        on_disk: bool,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Warm the cache
    Warm {
        /// Filter by content type
        #[arg(short = 'C', long)]
        content_type: Option<String>,
    },
    /// Delete attachments
    Delete {
        /// Filter by content type
        #[arg(short = 'C', long)]
        content_type: Option<String>,
    },
    /// Prune the cache
    Prune,
    /// Clear the cache
    Clear,
    /// Write the content of an attachment to stdout
    Cat {
        /// Attachment id
        id: AttachmentId,
    },
}

fn filter(content_type: Option<String>) -> AttachmentFilter {
    AttachmentFilter {
        content_type,
        ..AttachmentFilter::default()
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Settings::load().context("Failed to load settings"),
    }
}

fn import(
    attachments: &Attachments,
    files: Vec<PathBuf>,
    name: Option<String>,
    content_type: Option<String>,
    overwrite: bool,
    compression: Option<String>,
    digest: Option<String>,
) -> Result<()> {
    for path in files {
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut request = ImportRequest::from_path(&path, name.as_deref(), data)?;
        request.content_type = content_type.clone();
        request.overwrite = overwrite;
        request.compression = compression.clone();
        request.digest_algorithm = digest.clone();

        match attachments.import(request)? {
            ImportOutcome::Imported(a) => println!("Imported {}", a.filename),
            ImportOutcome::Replaced(a) => println!("Replaced {}", a.filename),
            ImportOutcome::Skipped { existing } => println!("Skipping {}", existing.filename),
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_ref())?;
    info!(
        "Using database {} and cache {}",
        settings.database_location,
        settings.cache_directory.display()
    );
    let attachments =
        Attachments::from_settings(settings).context("Failed to open attachment store")?;
    let manager = attachments.cache_manager();

    match cli.command {
        Command::Import {
            files,
            name,
            content_type,
            overwrite,
            compression,
            digest,
        } => import(
            &attachments,
            files,
            name,
            content_type,
            overwrite,
            compression,
            digest,
        )?,
        Command::List {
            content_type,
            on_disk,
            json,
        } => {
            let listing = manager.list(&filter(content_type), on_disk)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                let now = Utc::now();
                for row in &listing {
                    println!("{}", attachment_line(&row.attachment, now));
                }
            }
        }
        Command::Warm { content_type } => {
            let now = Utc::now();
            let summary = manager.warm_each(&filter(content_type), |result| {
                match result {
                    Ok(report) => println!("{}", attachment_line(&report.attachment, now)),
                    Err(failure) => eprintln!(
                        "Failed to warm {} ({}): {}",
                        failure.filename, failure.id, failure.message
                    ),
                }
                ControlFlow::Continue(())
            })?;
            if !summary.failures.is_empty() {
                anyhow::bail!("{} attachments could not be warmed", summary.failures.len());
            }
        }
        Command::Delete { content_type } => {
            let deleted = manager.delete_matching(&filter(content_type))?;
            println!("Deleted {deleted} attachments");
        }
        Command::Prune => {
            manager.prune()?;
            println!("The cache is now {}", natural_size(manager.size()?));
        }
        Command::Clear => {
            manager.clear()?;
            println!("The cache is now {}", natural_size(manager.size()?));
        }
        Command::Cat { id } => {
            let mut content = attachments.open(&id)?;
            let mut stdout = std::io::stdout().lock();
            std::io::copy(&mut content, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
