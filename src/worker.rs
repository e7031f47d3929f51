//! Background caption runs.
//!
//! One run at a time walks a list of images on its own thread, calling the
//! selected backend for every uncaptioned image and saving the result. All
//! communication with the caller goes through an unbounded FIFO of
//! [`ProgressEvent`]s that the caller drains with [`CaptionWorker::poll`]
//! on its own schedule.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::backends::{describe_with, CaptionBackend, CaptionRequest};
use crate::caption_store::{CaptionStore, ImageRef};
use crate::error::CaptionError;
use crate::rate_limit::RateLimiter;

pub const CANCELLED_MESSAGE: &str = "Caption generation cancelled.";
const PANICKED_MESSAGE: &str = "Caption worker stopped unexpectedly.";

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// About to process image `current` of `total` (1-based).
    Progress { current: usize, total: usize },
    CaptionUpdated { image: ImageRef, caption: String },
    /// Terminal event. Carries the caption of the image of interest, or `""`.
    Completed(String),
    Error(String),
}

impl ProgressEvent {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Error(message) if message == CANCELLED_MESSAGE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub enum RunMode {
    Single(ImageRef),
    Batch {
        images: Vec<ImageRef>,
        /// Index whose new caption becomes the `Completed` payload.
        focus_index: Option<usize>,
    },
}

pub struct RunRequest {
    pub mode: RunMode,
    pub backend: Arc<dyn CaptionBackend>,
    pub prompt: String,
    pub trigger_phrase: Option<String>,
    /// Time of the previous rate-limited call, if any.
    pub last_call: Option<DateTime<Utc>>,
}

/// Receives the timestamp of every rate-limited call so it can be persisted.
pub trait CallRecorder: Send + Sync {
    fn record_call(&self, at: DateTime<Utc>);
}

/// Cancellation flag shared between the caller and the running thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CaptionWorker {
    sender: Sender<ProgressEvent>,
    receiver: Receiver<ProgressEvent>,
    limiter: RateLimiter,
    store: CaptionStore,
    recorder: Option<Arc<dyn CallRecorder>>,
    cancel: CancelHandle,
    state: Arc<Mutex<RunState>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptionWorker {
    pub fn new(limiter: RateLimiter, store: CaptionStore) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            limiter,
            store,
            recorder: None,
            cancel: CancelHandle::default(),
            state: Arc::new(Mutex::new(RunState::Idle)),
            handle: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn CallRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Starts a run, cancelling and joining any run still active first.
    pub fn start(&mut self, request: RunRequest) -> Result<(), CaptionError> {
        self.stop();
        self.cancel.reset();
        set_state(&self.state, RunState::Running);

        let run = Run {
            backend: request.backend,
            prompt: request.prompt,
            trigger_phrase: request.trigger_phrase,
            last_call: request.last_call,
            limiter: self.limiter.clone(),
            store: self.store,
            recorder: self.recorder.clone(),
            cancel: self.cancel.clone(),
            sender: self.sender.clone(),
        };
        let mode = request.mode;
        let guard = RunGuard {
            state: Arc::clone(&self.state),
            sender: self.sender.clone(),
            outcome: None,
        };

        let spawned = std::thread::Builder::new()
            .name("caption-worker".into())
            .spawn(move || {
                let mut guard = guard;
                let mut run = run;
                log::info!("Caption run started with {}", run.backend.name());
                let outcome = match mode {
                    RunMode::Single(image) => run.single(&image),
                    RunMode::Batch {
                        images,
                        focus_index,
                    } => run.batch(&images, focus_index),
                };
                log::info!("Caption run finished: {:?}", outcome);
                guard.outcome = Some(outcome);
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(error) => {
                set_state(&self.state, RunState::Failed);
                Err(CaptionError::Model(format!(
                    "could not start caption worker thread: {}",
                    error
                )))
            }
        }
    }

    /// Asks the active run to stop before its next image. Does not block.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels the active run and waits for its thread to exit.
    pub fn stop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
        }
        self.wait();
    }

    /// Waits for the active run to finish on its own.
    pub fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Caption worker thread panicked");
            }
        }
    }

    /// Every event queued since the last poll, in production order.
    pub fn poll(&self) -> Vec<ProgressEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn state(&self) -> RunState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }
}

impl Drop for CaptionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<RunState>, value: RunState) {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

/// Publishes the run's final state; a run that unwinds without an outcome
/// still reaches a rest state with an `Error` event.
struct RunGuard {
    state: Arc<Mutex<RunState>>,
    sender: Sender<ProgressEvent>,
    outcome: Option<RunState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => {
                let _ = self.sender.send(ProgressEvent::Error(PANICKED_MESSAGE.into()));
                RunState::Failed
            }
        };
        set_state(&self.state, outcome);
    }
}

struct Run {
    backend: Arc<dyn CaptionBackend>,
    prompt: String,
    trigger_phrase: Option<String>,
    last_call: Option<DateTime<Utc>>,
    limiter: RateLimiter,
    store: CaptionStore,
    recorder: Option<Arc<dyn CallRecorder>>,
    cancel: CancelHandle,
    sender: Sender<ProgressEvent>,
}

impl Run {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    fn single(&mut self, image: &ImageRef) -> RunState {
        if self.cancel.is_cancelled() {
            self.emit(ProgressEvent::Error(CANCELLED_MESSAGE.into()));
            return RunState::Cancelled;
        }

        match self.caption_and_save(image) {
            Ok(caption) => {
                self.emit(ProgressEvent::CaptionUpdated {
                    image: image.clone(),
                    caption: caption.clone(),
                });
                self.emit(ProgressEvent::Completed(caption));
                RunState::Completed
            }
            Err(error) => {
                log::error!("Captioning {} failed: {}", image.path.display(), error);
                self.emit(ProgressEvent::Error(image_error(image, &error)));
                RunState::Failed
            }
        }
    }

    fn batch(&mut self, images: &[ImageRef], focus_index: Option<usize>) -> RunState {
        let total = images.len();
        let mut staged = String::new();

        for (index, image) in images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Caption run cancelled before {}", image.file_name());
                self.emit(ProgressEvent::Error(CANCELLED_MESSAGE.into()));
                self.emit(ProgressEvent::Completed(staged));
                return RunState::Cancelled;
            }

            self.emit(ProgressEvent::Progress {
                current: index + 1,
                total,
            });

            match self.store.load(image) {
                Ok(existing) if !existing.is_empty() => {
                    log::debug!("Skipping {}, already captioned", image.file_name());
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    log::warn!("{}", error);
                    self.emit(ProgressEvent::Error(image_error(image, &error)));
                    continue;
                }
            }

            match self.caption_and_save(image) {
                Ok(caption) => {
                    if focus_index == Some(index) {
                        staged = caption.clone();
                    }
                    self.emit(ProgressEvent::CaptionUpdated {
                        image: image.clone(),
                        caption,
                    });
                }
                Err(error) => {
                    log::warn!("Captioning {} failed: {}", image.path.display(), error);
                    self.emit(ProgressEvent::Error(image_error(image, &error)));
                }
            }
        }

        self.emit(ProgressEvent::Completed(staged));
        RunState::Completed
    }

    fn caption_and_save(&mut self, image: &ImageRef) -> Result<String, CaptionError> {
        if self.backend.is_rate_limited() {
            let stamp = self.limiter.wait_if_needed(self.last_call);
            self.last_call = Some(stamp);
            if let Some(recorder) = &self.recorder {
                recorder.record_call(stamp);
            }
        }

        let request = CaptionRequest {
            image: image.clone(),
            prompt: self.prompt.clone(),
            trigger_phrase: self.trigger_phrase.clone(),
            backend: self.backend.name().to_string(),
        };
        let caption = describe_with(self.backend.as_ref(), &request)?;
        self.store.save(image, &caption)?;
        Ok(caption)
    }
}

fn image_error(image: &ImageRef, error: &CaptionError) -> String {
    format!("Error generating caption for {}: {}", image.file_name(), error)
}
