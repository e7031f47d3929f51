pub mod backends;
pub mod caption_store;
pub mod config;
pub mod error;
pub mod hosted_api;
pub mod image_encoding;
pub mod library;
pub mod local_model;
pub mod rate_limit;
pub mod session;
pub mod trigger_phrase;
pub mod worker;

mod commands;

use clap::Parser;
use std::process::ExitCode;

pub use backends::{BackendRegistry, CaptionBackend, CaptionRequest};
pub use caption_store::{CaptionStore, ImageRef};
pub use error::CaptionError;
pub use worker::{CaptionWorker, ProgressEvent, RunMode, RunRequest, RunState};

/// Entry point of the `captioner` binary.
pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    image_encoding::ensure_jxl_decoder_registered();

    let cli = commands::Cli::parse();
    match commands::execute(cli) {
        Ok(code) => code,
        Err(error) => {
            log::error!("{}", error);
            ExitCode::FAILURE
        }
    }
}
