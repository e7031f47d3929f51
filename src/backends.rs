use std::sync::Arc;

use crate::caption_store::ImageRef;
use crate::config::{builtin_local_models, Settings};
use crate::error::CaptionError;
use crate::hosted_api::HostedBackend;
use crate::local_model::{default_loader, DetailLevel, LocalModelBackend};

/// One caption call. Built per image and discarded afterwards.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub image: ImageRef,
    pub prompt: String,
    pub trigger_phrase: Option<String>,
    pub backend: String,
}

pub trait CaptionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Rate-limited backends are spaced by the debouncer in batch runs.
    fn is_rate_limited(&self) -> bool;

    fn describe(&self, request: &CaptionRequest) -> Result<String, CaptionError>;
}

/// Name-ordered table of the available backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn CaptionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local models first, then the hosted table from `settings`.
    pub fn from_settings(settings: &Settings, detail: DetailLevel) -> Self {
        let mut registry = Self::new();
        let loader = default_loader();

        for mut spec in builtin_local_models() {
            spec.detail = detail;
            registry.register(Arc::new(LocalModelBackend::new(
                spec,
                settings.models_dir.clone(),
                Arc::clone(&loader),
            )));
        }
        for descriptor in settings.hosted_backends() {
            registry.register(Arc::new(HostedBackend::new(descriptor, settings.http_timeout)));
        }
        registry
    }

    /// Adds `backend`, replacing any backend already registered under its name.
    pub fn register(&mut self, backend: Arc<dyn CaptionBackend>) {
        match self
            .backends
            .iter()
            .position(|existing| existing.name() == backend.name())
        {
            Some(index) => self.backends[index] = backend,
            None => self.backends.push(backend),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CaptionBackend>, CaptionError> {
        self.backends
            .iter()
            .find(|backend| backend.name() == name)
            .cloned()
            .ok_or_else(|| CaptionError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CaptionBackend>> {
        self.backends.iter()
    }

    /// Runs `request` on the backend it names. Every failure comes back as
    /// [`CaptionError::Backend`] tagged with that name.
    pub fn describe(&self, request: &CaptionRequest) -> Result<String, CaptionError> {
        let backend = self
            .get(&request.backend)
            .map_err(|error| error.tagged(&request.backend))?;
        describe_with(backend.as_ref(), request)
    }
}

pub(crate) fn describe_with(
    backend: &dyn CaptionBackend,
    request: &CaptionRequest,
) -> Result<String, CaptionError> {
    backend
        .describe(request)
        .map_err(|error| error.tagged(backend.name()))
}
