use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub firebase: FirebaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Which services the dashboard talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Firebase,
    /// Process-local services; nothing survives a restart except the
    /// persisted store snapshots.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirebaseConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    /// Identity Toolkit base URL (point at the auth emulator for local work)
    #[serde(default = "default_identity_url")]
    pub identity_url: String,
    /// Secure Token base URL
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Firestore REST base URL
    #[serde(default = "default_firestore_url")]
    pub firestore_url: String,
}

fn default_identity_url() -> String {
    "https://identitytoolkit.googleapis.com/v1".to_string()
}

fn default_token_url() -> String {
    "https://securetoken.googleapis.com/v1".to_string()
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            project_id: String::new(),
            identity_url: default_identity_url(),
            token_url: default_token_url(),
            firestore_url: default_firestore_url(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted store snapshots. Defaults to the platform data
    /// directory.
    pub dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        // A missing .env is fine
        let _ = dotenvy::dotenv();

        let mut config = Self::locate()?;
        config.apply_env();
        Ok(config)
    }

    fn locate() -> Result<Self> {
        if let Ok(path) = std::env::var("ROSTER_CONFIG") {
            return Self::load_from_path(Path::new(&path));
        }

        let mut default_paths = vec![
            PathBuf::from("roster.toml"),
            PathBuf::from("config/roster.toml"),
        ];
        if let Some(dirs) = project_dirs() {
            default_paths.push(dirs.config_dir().join("roster.toml"));
        }

        for path in default_paths {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        tracing::warn!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ROSTER_FIREBASE_API_KEY") {
            self.firebase.api_key = key;
        }
        if let Ok(project) = std::env::var("ROSTER_FIREBASE_PROJECT_ID") {
            self.firebase.project_id = project;
        }
    }

    /// Where store snapshots live.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.dir {
            return Ok(dir.clone());
        }
        let dirs = project_dirs()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "roster", "roster")
}
