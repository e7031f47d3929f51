use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::backends::BackendRegistry;
use crate::caption_store::{CaptionStore, ImageRef};
use crate::error::CaptionError;
use crate::library;
use crate::rate_limit::{RateLimiter, SystemClock};
use crate::session::SessionHandle;
use crate::worker::{CaptionWorker, ProgressEvent, RunMode, RunRequest, RunState};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn single(
    image_path: &Path,
    registry: &BackendRegistry,
    session: &SessionHandle,
) -> Result<ExitCode, CaptionError> {
    let image = ImageRef::new(image_path);
    if !image.path.is_file() {
        return Err(CaptionError::io(
            &image.path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "image not found"),
        ));
    }
    session.open_image(&image.file_name())?;

    run(RunMode::Single(image), registry, session)
}

pub fn batch(
    folder: &Path,
    focus: Option<&str>,
    registry: &BackendRegistry,
    session: &SessionHandle,
) -> Result<ExitCode, CaptionError> {
    let images = library::list_images(folder)?;
    session.open_folder(folder, library::file_map(&images))?;

    let focus_index = match focus {
        Some(name) => {
            let index = images
                .iter()
                .position(|image| image.file_name() == name)
                .ok_or_else(|| {
                    CaptionError::io(
                        &folder.join(name),
                        std::io::Error::new(std::io::ErrorKind::NotFound, "not an image of this folder"),
                    )
                })?;
            session.open_image(name)?;
            Some(index)
        }
        None => None,
    };

    run(
        RunMode::Batch {
            images,
            focus_index,
        },
        registry,
        session,
    )
}

fn run(mode: RunMode, registry: &BackendRegistry, session: &SessionHandle) -> Result<ExitCode, CaptionError> {
    let state = session.snapshot();
    let backend = registry.get(&state.backend)?;
    let trigger_phrase = state.trigger();

    let mut worker = CaptionWorker::new(RateLimiter::new(Arc::new(SystemClock)), CaptionStore::new())
        .with_recorder(Arc::new(session.clone()));
    worker.start(RunRequest {
        mode,
        backend,
        prompt: state.prompt,
        trigger_phrase,
        last_call: state.last_call,
    })?;

    let (state, report) = drive(&mut worker);
    if report.failures > 0 {
        eprintln!("{} image(s) failed", report.failures);
    }
    Ok(match state {
        RunState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[derive(Debug, Default)]
struct RunReport {
    failures: usize,
}

impl RunReport {
    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Progress { current, total } => {
                log::info!("[{}/{}]", current, total);
            }
            ProgressEvent::CaptionUpdated { image, caption } => {
                println!("{}\t{}", image.file_name(), caption);
            }
            ProgressEvent::Completed(caption) => {
                if !caption.is_empty() {
                    log::info!("Focused image caption: {}", caption);
                }
            }
            ProgressEvent::Error(message) if event.is_cancellation() => {
                eprintln!("{}", message);
            }
            ProgressEvent::Error(message) => {
                self.failures += 1;
                eprintln!("{}", message);
            }
        }
    }
}

/// Polls the worker queue on a fixed interval until the run reaches a rest
/// state, applying every queued event on each tick.
fn drive(worker: &mut CaptionWorker) -> (RunState, RunReport) {
    let mut report = RunReport::default();
    loop {
        // Read before draining: the state only leaves Running after the last
        // event has been queued.
        let finished = !worker.is_running();
        for event in worker.poll() {
            report.apply(&event);
        }
        if finished {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    worker.wait();
    (worker.state(), report)
}
