use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::{DEFAULT_BACKEND, DEFAULT_PROMPT};
use crate::error::CaptionError;
use crate::worker::CallRecorder;

/// Everything the application remembers between launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub current_folder: Option<PathBuf>,
    pub current_image: Option<String>,
    /// Image file name → full path, for the images of `current_folder`.
    pub file_map: BTreeMap<String, PathBuf>,
    pub backend: String,
    pub prompt: String,
    pub trigger_phrase: String,
    /// Time of the last rate-limited backend call.
    pub last_call: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_folder: None,
            current_image: None,
            file_map: BTreeMap::new(),
            backend: DEFAULT_BACKEND.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            trigger_phrase: String::new(),
            last_call: None,
        }
    }
}

impl SessionState {
    pub fn trigger(&self) -> Option<String> {
        let phrase = self.trigger_phrase.trim();
        (!phrase.is_empty()).then(|| phrase.to_string())
    }
}

/// Reads the session file, falling back to defaults.
///
/// A missing or malformed file gives defaults, and so does a file whose
/// image map names a path that is gone: such a session is dropped whole
/// rather than half-restored.
pub fn load_session(path: &Path) -> SessionState {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to read session {}: {}", path.display(), error);
            }
            return SessionState::default();
        }
    };

    let state: SessionState = match serde_json::from_str(&content) {
        Ok(state) => state,
        Err(error) => {
            log::warn!("Ignoring corrupt session {}: {}", path.display(), error);
            return SessionState::default();
        }
    };

    if let Some((name, missing)) = state.file_map.iter().find(|(_, path)| !path.exists()) {
        log::warn!(
            "Session image {} no longer exists at {}, starting fresh",
            name,
            missing.display()
        );
        return SessionState::default();
    }

    log::info!("Restored session from {}", path.display());
    state
}

pub fn persist_session(path: &Path, state: &SessionState) -> Result<(), CaptionError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CaptionError::io(parent, e))?;
    }
    let payload = serde_json::to_string_pretty(state)?;
    fs::write(path, payload).map_err(|e| CaptionError::io(path, e))
}

/// Shared, self-persisting session. Every setter writes the file while
/// still holding the lock, so saves never interleave.
#[derive(Clone)]
pub struct SessionHandle {
    path: PathBuf,
    state: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_session(&path);
        Self {
            path,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn update(&self, change: impl FnOnce(&mut SessionState)) -> Result<(), CaptionError> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        change(&mut *state);
        persist_session(&self.path, &state)
    }

    pub fn open_folder(
        &self,
        folder: &Path,
        file_map: BTreeMap<String, PathBuf>,
    ) -> Result<(), CaptionError> {
        self.update(|state| {
            state.current_folder = Some(folder.to_path_buf());
            state.current_image = None;
            state.file_map = file_map;
        })
    }

    pub fn open_image(&self, name: &str) -> Result<(), CaptionError> {
        self.update(|state| state.current_image = Some(name.to_string()))
    }

    pub fn set_backend(&self, backend: &str) -> Result<(), CaptionError> {
        self.update(|state| state.backend = backend.to_string())
    }

    pub fn set_prompt(&self, prompt: &str) -> Result<(), CaptionError> {
        self.update(|state| state.prompt = prompt.to_string())
    }

    pub fn set_trigger_phrase(&self, phrase: &str) -> Result<(), CaptionError> {
        self.update(|state| state.trigger_phrase = phrase.trim().to_string())
    }
}

impl CallRecorder for SessionHandle {
    fn record_call(&self, at: DateTime<Utc>) {
        if let Err(error) = self.update(|state| state.last_call = Some(at)) {
            log::warn!("Failed to save rate limit timestamp: {}", error);
        }
    }
}
