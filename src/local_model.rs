#[cfg(feature = "local-model")]
mod blip;

use image::DynamicImage;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::backends::{CaptionBackend, CaptionRequest};
use crate::error::CaptionError;
use crate::image_encoding::open_image;
use crate::trigger_phrase::rewrite_with_trigger_phrase;

const SPECIAL_TOKENS: [&str; 3] = ["</s>", "<s>", "<pad>"];

/// How much detail the local model is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DetailLevel {
    Brief,
    Detailed,
    #[default]
    MoreDetailed,
}

impl DetailLevel {
    pub fn task_token(self) -> &'static str {
        match self {
            Self::Brief => "<CAPTION>",
            Self::Detailed => "<DETAILED_CAPTION>",
            Self::MoreDetailed => "<MORE_DETAILED_CAPTION>",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalModelSpec {
    /// Backend name shown to the user.
    pub name: String,
    pub repo_id: String,
    pub files: Vec<String>,
    pub detail: DetailLevel,
}

impl LocalModelSpec {
    pub fn weights_dir(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(self.repo_id.replace('/', "_"))
    }
}

pub trait VisionModel: Send + Sync {
    fn caption(&self, image: &DynamicImage, task_token: &str) -> Result<String, CaptionError>;
}

pub trait VisionModelLoader: Send + Sync {
    fn load(
        &self,
        spec: &LocalModelSpec,
        weights: &[PathBuf],
    ) -> Result<Arc<dyn VisionModel>, CaptionError>;
}

type ModelCache = Mutex<HashMap<String, Arc<dyn VisionModel>>>;

fn loaded_models() -> &'static ModelCache {
    static LOADED: OnceLock<ModelCache> = OnceLock::new();
    LOADED.get_or_init(Default::default)
}

/// Returns the process-wide instance of `spec`'s model, loading it on first use.
///
/// The cache lock is held while loading so two callers never load the same
/// weights twice.
pub fn cached_model(
    spec: &LocalModelSpec,
    models_dir: &Path,
    loader: &dyn VisionModelLoader,
) -> Result<Arc<dyn VisionModel>, CaptionError> {
    let mut cache = loaded_models()
        .lock()
        .map_err(|_| CaptionError::Model("local model cache lock poisoned".into()))?;
    if let Some(model) = cache.get(&spec.repo_id) {
        return Ok(Arc::clone(model));
    }

    let weights = ensure_weights(spec, models_dir)?;
    log::info!("Loading local model {} ({})", spec.name, spec.repo_id);
    let model = loader.load(spec, &weights)?;
    cache.insert(spec.repo_id.clone(), Arc::clone(&model));
    Ok(model)
}

/// Paths of every weight file of `spec`, downloading the missing ones.
pub fn ensure_weights(spec: &LocalModelSpec, models_dir: &Path) -> Result<Vec<PathBuf>, CaptionError> {
    let dir = spec.weights_dir(models_dir);
    let paths: Vec<PathBuf> = spec.files.iter().map(|file| dir.join(file)).collect();
    if paths.iter().all(|path| path.is_file()) {
        return Ok(paths);
    }

    fs::create_dir_all(&dir).map_err(|e| CaptionError::io(&dir, e))?;
    download_weights(spec, &dir)?;
    Ok(paths)
}

#[cfg(feature = "local-model")]
fn download_weights(spec: &LocalModelSpec, dir: &Path) -> Result<(), CaptionError> {
    log::info!("Downloading {} into {}", spec.repo_id, dir.display());
    let api = hf_hub::api::sync::Api::new().map_err(|e| CaptionError::Model(e.to_string()))?;
    let repo = api.model(spec.repo_id.clone());

    for file in &spec.files {
        let target = dir.join(file);
        if target.is_file() {
            continue;
        }
        let cached = repo
            .get(file)
            .map_err(|e| CaptionError::Model(format!("{}: {}", file, e)))?;
        fs::copy(&cached, &target).map_err(|e| CaptionError::io(&target, e))?;
    }
    Ok(())
}

#[cfg(not(feature = "local-model"))]
fn download_weights(spec: &LocalModelSpec, dir: &Path) -> Result<(), CaptionError> {
    Err(CaptionError::Model(format!(
        "weights for {} are missing from {} and this build cannot download them (enable the local-model feature)",
        spec.repo_id,
        dir.display()
    )))
}

#[cfg(feature = "local-model")]
pub fn default_loader() -> Arc<dyn VisionModelLoader> {
    Arc::new(blip::BlipLoader)
}

#[cfg(not(feature = "local-model"))]
pub fn default_loader() -> Arc<dyn VisionModelLoader> {
    Arc::new(UnavailableLoader)
}

#[cfg(not(feature = "local-model"))]
struct UnavailableLoader;

#[cfg(not(feature = "local-model"))]
impl VisionModelLoader for UnavailableLoader {
    fn load(
        &self,
        spec: &LocalModelSpec,
        _weights: &[PathBuf],
    ) -> Result<Arc<dyn VisionModel>, CaptionError> {
        Err(CaptionError::Model(format!(
            "{} needs a build with the local-model feature",
            spec.name
        )))
    }
}

pub fn strip_special_tokens(text: &str) -> String {
    SPECIAL_TOKENS
        .iter()
        .fold(text.to_string(), |acc, token| acc.replace(token, ""))
        .trim()
        .to_string()
}

/// Caption backend running a local model. Exempt from rate limiting.
pub struct LocalModelBackend {
    spec: LocalModelSpec,
    models_dir: PathBuf,
    loader: Arc<dyn VisionModelLoader>,
}

impl LocalModelBackend {
    pub fn new(spec: LocalModelSpec, models_dir: PathBuf, loader: Arc<dyn VisionModelLoader>) -> Self {
        Self {
            spec,
            models_dir,
            loader,
        }
    }
}

impl CaptionBackend for LocalModelBackend {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn is_rate_limited(&self) -> bool {
        false
    }

    fn describe(&self, request: &CaptionRequest) -> Result<String, CaptionError> {
        let model = cached_model(&self.spec, &self.models_dir, self.loader.as_ref())?;
        let image = open_image(&request.image.path)?;
        if !request.prompt.trim().is_empty() {
            log::debug!("{} takes no instruction, prompt ignored", self.spec.name);
        }

        let caption = strip_special_tokens(&model.caption(&image, self.spec.detail.task_token())?);
        if caption.is_empty() {
            return Err(CaptionError::EmptyCaption {
                backend: self.spec.name.clone(),
            });
        }

        match request
            .trigger_phrase
            .as_deref()
            .map(str::trim)
            .filter(|phrase| !phrase.is_empty())
        {
            Some(phrase) => Ok(rewrite_with_trigger_phrase(&caption, phrase)),
            None => Ok(caption),
        }
    }
}
