use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CaptionError;
use crate::hosted_api::HostedDescriptor;
use crate::local_model::{DetailLevel, LocalModelSpec};

pub const DEFAULT_PROMPT: &str =
    "Describe this image as one paragraph, without mentionning the style nor the atmosphere.";
pub const DEFAULT_BACKEND: &str = "BLIP";

const DEFAULT_SESSION_FILE: &str = "config/session.json";
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_BACKENDS_FILE: &str = "config/backends.yaml";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const MIN_HTTP_TIMEOUT_SECS: u64 = 10;
const MAX_HTTP_TIMEOUT_SECS: u64 = 600;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub session_file: PathBuf,
    pub models_dir: PathBuf,
    pub backends_file: PathBuf,
    pub http_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            backends_file: PathBuf::from(DEFAULT_BACKENDS_FILE),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let path_or = |key: &str, fallback: PathBuf| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };

        let http_timeout = lookup("CAPTIONER_HTTP_TIMEOUT_SECS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|secs| secs.clamp(MIN_HTTP_TIMEOUT_SECS, MAX_HTTP_TIMEOUT_SECS))
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        Self {
            session_file: path_or("CAPTIONER_SESSION_FILE", defaults.session_file),
            models_dir: path_or("CAPTIONER_MODELS_DIR", defaults.models_dir),
            backends_file: path_or("CAPTIONER_BACKENDS_FILE", defaults.backends_file),
            http_timeout,
        }
    }

    /// Built-in hosted backends with the entries of the backend table file
    /// applied on top. A malformed file is logged and ignored.
    pub fn hosted_backends(&self) -> Vec<HostedDescriptor> {
        let overrides = match load_backend_table(&self.backends_file) {
            Ok(overrides) => overrides,
            Err(error) => {
                log::warn!(
                    "Ignoring backend table {}: {}",
                    self.backends_file.display(),
                    error
                );
                Vec::new()
            }
        };
        merge_backends(builtin_hosted_backends(), overrides)
    }
}

pub fn builtin_hosted_backends() -> Vec<HostedDescriptor> {
    [
        ("Gemini 2.5 Flash", GEMINI_BASE_URL, "gemini-2.5-flash", "GEMINI_API_KEY"),
        ("Gemini 2.5 Pro", GEMINI_BASE_URL, "gemini-2.5-pro", "GEMINI_API_KEY"),
        (
            "Qwen2.5 72B",
            OPENROUTER_BASE_URL,
            "qwen/qwen2.5-vl-72b-instruct:free",
            "OPENROUTER_API_KEY",
        ),
        ("Grok", OPENROUTER_BASE_URL, "x-ai/grok-4-fast:free", "OPENROUTER_API_KEY"),
        ("GPT-4.1", "https://models.github.ai/inference", "openai/gpt-4.1", "GITHUB_TOKEN"),
        ("Pixtral", "https://api.mistral.ai/v1", "pixtral-12b-2409", "MISTRAL_API_KEY"),
    ]
    .into_iter()
    .map(|(name, base_url, model, api_key_env)| HostedDescriptor {
        name: name.to_string(),
        base_url: base_url.to_string(),
        model: model.to_string(),
        api_key_env: api_key_env.to_string(),
        rate_limited: true,
    })
    .collect()
}

pub fn builtin_local_models() -> Vec<LocalModelSpec> {
    vec![LocalModelSpec {
        name: DEFAULT_BACKEND.to_string(),
        repo_id: "Salesforce/blip-image-captioning-large".to_string(),
        files: vec!["model.safetensors".to_string(), "tokenizer.json".to_string()],
        detail: DetailLevel::default(),
    }]
}

#[derive(Debug, Deserialize)]
struct BackendTable {
    #[serde(default)]
    backends: Vec<HostedDescriptor>,
}

/// Reads the optional YAML backend table. A missing file is an empty table.
pub fn load_backend_table(path: &Path) -> Result<Vec<HostedDescriptor>, CaptionError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(CaptionError::io(path, error)),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let table: BackendTable = serde_yaml::from_str(&raw)?;
    log::info!(
        "Loaded {} backend definitions from {}",
        table.backends.len(),
        path.display()
    );
    Ok(table.backends)
}

/// Overrides replace built-ins with the same name in place; new names are
/// appended in file order.
fn merge_backends(
    mut builtins: Vec<HostedDescriptor>,
    overrides: Vec<HostedDescriptor>,
) -> Vec<HostedDescriptor> {
    let positions: HashMap<String, usize> = builtins
        .iter()
        .enumerate()
        .map(|(index, descriptor)| (descriptor.name.clone(), index))
        .collect();

    for descriptor in overrides {
        match positions.get(&descriptor.name) {
            Some(&index) => builtins[index] = descriptor,
            None => builtins.push(descriptor),
        }
    }
    builtins
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("captioner_config_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.http_timeout, Duration::from_secs(120));
    }

    #[test]
    fn settings_read_overrides_and_clamp_timeout() {
        let settings = Settings::from_lookup(|key| match key {
            "CAPTIONER_SESSION_FILE" => Some("/tmp/s.json".into()),
            "CAPTIONER_MODELS_DIR" => Some("  ".into()),
            "CAPTIONER_HTTP_TIMEOUT_SECS" => Some("5000".into()),
            _ => None,
        });
        assert_eq!(settings.session_file, PathBuf::from("/tmp/s.json"));
        assert_eq!(settings.models_dir, PathBuf::from("models"));
        assert_eq!(settings.http_timeout, Duration::from_secs(600));

        let settings = Settings::from_lookup(|key| {
            (key == "CAPTIONER_HTTP_TIMEOUT_SECS").then(|| "not a number".to_string())
        });
        assert_eq!(settings.http_timeout, Duration::from_secs(120));
    }

    #[test]
    fn builtin_names_are_unique() {
        let mut names: Vec<String> = builtin_hosted_backends()
            .into_iter()
            .map(|descriptor| descriptor.name)
            .chain(builtin_local_models().into_iter().map(|spec| spec.name))
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn backend_table_overrides_and_extends_builtins() {
        let dir = test_dir("table");
        let path = dir.join("backends.yaml");
        fs::write(
            &path,
            "backends:\n  - name: Pixtral\n    base_url: https://proxy.local/v1\n    model: pixtral-large\n    api_key_env: PROXY_KEY\n  - name: Ollama\n    base_url: http://localhost:11434/v1\n    model: llava\n    api_key_env: OLLAMA_KEY\n    rate_limited: false\n",
        )
        .unwrap();

        let settings = Settings {
            backends_file: path,
            ..Settings::default()
        };
        let backends = settings.hosted_backends();

        assert_eq!(backends.len(), builtin_hosted_backends().len() + 1);
        let pixtral = backends.iter().find(|d| d.name == "Pixtral").unwrap();
        assert_eq!(pixtral.model, "pixtral-large");
        assert!(pixtral.rate_limited);
        let ollama = backends.last().unwrap();
        assert_eq!(ollama.name, "Ollama");
        assert!(!ollama.rate_limited);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_backend_table_is_ignored() {
        let dir = test_dir("malformed");
        let path = dir.join("backends.yaml");
        fs::write(&path, "backends: [ { name: 3").unwrap();

        assert!(load_backend_table(&path).is_err());
        let settings = Settings {
            backends_file: path,
            ..Settings::default()
        };
        assert_eq!(settings.hosted_backends(), builtin_hosted_backends());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_backend_table_is_empty() {
        let dir = test_dir("missing");
        assert!(load_backend_table(&dir.join("nope.yaml")).unwrap().is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
