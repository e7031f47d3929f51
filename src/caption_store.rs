use crate::error::CaptionError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const CAPTION_EXTENSION: &str = "txt";
const PENDING_EXTENSION: &str = "txt.pending";

/// An image on disk plus the path of its caption sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub path: PathBuf,
    pub caption_path: PathBuf,
}

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let caption_path = path.with_extension(CAPTION_EXTENSION);
        Self { path, caption_path }
    }

    /// File name used as the key in the session's image map.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Reads and writes caption sidecars.
///
/// An image is "uncaptioned" exactly when [`CaptionStore::load`] returns an
/// empty string; a missing file and an empty (or whitespace-only) file are
/// the same thing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptionStore;

impl CaptionStore {
    pub fn new() -> Self {
        Self
    }

    /// Returns the trimmed caption, or `""` when no sidecar exists.
    pub fn load(&self, image: &ImageRef) -> Result<String, CaptionError> {
        match std::fs::read_to_string(&image.caption_path) {
            Ok(content) => Ok(content.trim().to_string()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(CaptionError::io(&image.caption_path, error)),
        }
    }

    /// Overwrites the sidecar with `caption`.
    ///
    /// The text goes to a pending file first and is renamed over the sidecar,
    /// so a reader never sees a half-written caption.
    pub fn save(&self, image: &ImageRef, caption: &str) -> Result<(), CaptionError> {
        let pending = image.path.with_extension(PENDING_EXTENSION);
        std::fs::write(&pending, caption).map_err(|e| CaptionError::io(&pending, e))?;
        if let Err(error) = std::fs::rename(&pending, &image.caption_path) {
            let _ = std::fs::remove_file(&pending);
            return Err(CaptionError::io(&image.caption_path, error));
        }
        log::debug!("Caption saved to {}", image.caption_path.display());
        Ok(())
    }

    pub fn exists(&self, image: &ImageRef) -> bool {
        image.caption_path.is_file()
    }

    /// True when the sidecar holds a non-empty caption.
    ///
    /// Unreadable sidecars count as uncaptioned; list highlighting only.
    pub fn has_caption(&self, image: &ImageRef) -> bool {
        self.load(image)
            .map(|caption| !caption.is_empty())
            .unwrap_or(false)
    }
}

/// Sidecar path for an arbitrary image path (`photos/cat.jpg` → `photos/cat.txt`).
pub fn caption_path_for(image_path: &Path) -> PathBuf {
    image_path.with_extension(CAPTION_EXTENSION)
}
