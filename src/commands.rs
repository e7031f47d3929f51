mod caption;
mod folder;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::backends::BackendRegistry;
use crate::config::Settings;
use crate::error::CaptionError;
use crate::local_model::DetailLevel;
use crate::session::SessionHandle;

#[derive(Parser, Debug)]
#[command(version, about = "Caption image folders with local and hosted vision models")]
pub struct Cli {
    /// Captioning backend; remembered for later runs.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Instruction sent to hosted backends; remembered for later runs.
    #[arg(long, global = true)]
    prompt: Option<String>,

    /// Style phrase the caption should start with. An empty value clears it.
    #[arg(long, global = true)]
    trigger: Option<String>,

    /// Caption detail requested from the local model.
    #[arg(long, global = true, value_enum, default_value_t = DetailLevel::MoreDetailed)]
    detail: DetailLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available backends.
    Backends,
    /// List the images of a folder; captioned ones are marked with `*`.
    List { folder: PathBuf },
    /// Caption one image, overwriting its caption.
    Caption { image: PathBuf },
    /// Caption every uncaptioned image of a folder.
    Batch {
        folder: PathBuf,
        /// Image whose caption is printed when the run completes.
        #[arg(long)]
        focus: Option<String>,
    },
    /// Find caption lines containing a text.
    Search {
        folder: PathBuf,
        text: String,
        #[arg(long)]
        case_sensitive: bool,
    },
    /// Replace a text in every caption of a folder.
    Replace {
        folder: PathBuf,
        text: String,
        replacement: String,
        #[arg(long)]
        case_sensitive: bool,
    },
    /// Rename the images of a folder to 1, 2, 3, … keeping their captions.
    Rename { folder: PathBuf },
}

pub fn execute(cli: Cli) -> Result<ExitCode, CaptionError> {
    let settings = Settings::from_env();
    let session = SessionHandle::load(&settings.session_file);
    let registry = BackendRegistry::from_settings(&settings, cli.detail);
    apply_overrides(&cli, &registry, &session)?;

    match cli.command {
        Command::Backends => list_backends(&registry, &session),
        Command::List { folder } => folder::list(&folder, &session),
        Command::Caption { image } => caption::single(&image, &registry, &session),
        Command::Batch { folder, focus } => {
            caption::batch(&folder, focus.as_deref(), &registry, &session)
        }
        Command::Search {
            folder,
            text,
            case_sensitive,
        } => folder::search(&folder, &text, case_sensitive, &session),
        Command::Replace {
            folder,
            text,
            replacement,
            case_sensitive,
        } => folder::replace(&folder, &text, &replacement, case_sensitive, &session),
        Command::Rename { folder } => folder::rename(&folder, &session),
    }
}

fn apply_overrides(
    cli: &Cli,
    registry: &BackendRegistry,
    session: &SessionHandle,
) -> Result<(), CaptionError> {
    if let Some(backend) = &cli.backend {
        registry.get(backend)?;
        session.set_backend(backend)?;
    }
    if let Some(prompt) = &cli.prompt {
        session.set_prompt(prompt)?;
    }
    if let Some(trigger) = &cli.trigger {
        session.set_trigger_phrase(trigger)?;
    }
    Ok(())
}

fn list_backends(registry: &BackendRegistry, session: &SessionHandle) -> Result<ExitCode, CaptionError> {
    let selected = session.snapshot().backend;
    for backend in registry.iter() {
        let marker = if backend.name() == selected { "*" } else { " " };
        let kind = if backend.is_rate_limited() {
            "hosted, rate limited"
        } else {
            "unthrottled"
        };
        println!("{} {} ({})", marker, backend.name(), kind);
    }
    Ok(ExitCode::SUCCESS)
}
