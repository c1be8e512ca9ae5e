//! Persisted preferences: API keys, selected models, active provider, tool toggles
//!
//! Everything is stored as string pairs in a [`KeyValueStore`], scoped per
//! provider by key name (`api_key.anthropic`, `model.openai`, ...).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::catalog::{self, Provider};
use crate::providers::types::ToolOptions;

const ACTIVE_PROVIDER_KEY: &str = "active_provider";
const LEGACY_API_KEY: &str = "api_key";
const LEGACY_MODEL_KEY: &str = "model";
const MIGRATION_FLAG: &str = "migrated.v2";
const WEB_SEARCH_KEY: &str = "tools.web_search";
const WEB_FETCH_KEY: &str = "tools.web_fetch";
const CODE_EXECUTION_KEY: &str = "tools.code_execution";

/// Retired model ids and their current replacements
const LEGACY_MODELS: &[(&str, &str)] = &[
    ("claude-3-5-haiku-20241022", "claude-haiku-4-5-20251001"),
    ("claude-3-5-haiku-latest", "claude-haiku-4-5-20251001"),
    ("claude-3-haiku-20240307", "claude-haiku-4-5-20251001"),
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4-5-20250929"),
    ("claude-3-5-sonnet-latest", "claude-sonnet-4-5-20250929"),
    ("claude-3-7-sonnet-20250219", "claude-sonnet-4-5-20250929"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4-5-20250929"),
    ("gpt-4o-mini", "gpt-5-mini"),
    ("gpt-4.1-mini", "gpt-5-mini"),
    ("gpt-4o", "gpt-5"),
    ("gpt-4.1", "gpt-5"),
    ("gemini-1.5-flash", "gemini-2.5-flash"),
    ("gemini-2.0-flash", "gemini-2.5-flash"),
    ("gemini-1.5-pro", "gemini-2.5-pro"),
];

fn api_key_slot(provider: Provider) -> String {
    format!("api_key.{}", provider.id())
}

fn model_slot(provider: Provider) -> String {
    format!("model.{}", provider.id())
}

/// Current id for a possibly retired model id
pub fn remap_legacy_model(id: &str) -> &str {
    LEGACY_MODELS
        .iter()
        .find(|(old, _)| *old == id)
        .map(|(_, new)| *new)
        .unwrap_or(id)
}

/// Simple string key/value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Non-persistent store for tests and one-off runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("preference store poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("preference store poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk, rewritten on every change
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read preferences: {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse preferences: {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} preferences from {}", values.len(), path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, json.as_bytes())
            .with_context(|| format!("Failed to write preferences: {}", tmp.display()))?;

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("preference store poisoned"))?;
        let mut next = values.clone();
        change(&mut next);
        self.save(&next)?;
        *values = next;
        Ok(())
    }
}

/// Create or truncate `path` readable by the owner only, then write `bytes`
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // mode() only applies on creation; a stale tmp file keeps its old bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Typed view over a [`KeyValueStore`]
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let configured: Vec<&str> = Provider::ALL
            .iter()
            .filter(|p| self.has_api_key(**p))
            .map(|p| p.id())
            .collect();
        f.debug_struct("Preferences")
            .field("configured", &configured)
            .finish()
    }
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn get_non_empty(&self, key: &str) -> Option<String> {
        self.store.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn api_key(&self, provider: Provider) -> Option<String> {
        self.get_non_empty(&api_key_slot(provider))
    }

    pub fn has_api_key(&self, provider: Provider) -> bool {
        self.api_key(provider).is_some()
    }

    /// Store a key; an empty key clears the slot
    pub fn set_api_key(&self, provider: Provider, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return self.clear_api_key(provider);
        }
        self.store.set(&api_key_slot(provider), key)?;
        info!("Stored API key for {}", provider);
        Ok(())
    }

    pub fn clear_api_key(&self, provider: Provider) -> Result<()> {
        self.store.remove(&api_key_slot(provider))?;
        info!("Cleared API key for {}", provider);
        Ok(())
    }

    /// Providers that currently have a key, in fallback order
    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.has_api_key(*p))
            .collect()
    }

    /// Stored provider if it still has a key, else the first configured
    /// one, else anthropic
    pub fn active_provider(&self) -> Provider {
        let stored = self
            .store
            .get(ACTIVE_PROVIDER_KEY)
            .and_then(|id| Provider::from_id(&id))
            .filter(|p| self.has_api_key(*p));
        stored
            .or_else(|| self.configured_providers().into_iter().next())
            .unwrap_or(Provider::Anthropic)
    }

    /// Switch providers. Returns false, changing nothing, when the
    /// provider has no stored key.
    pub fn set_active_provider(&self, provider: Provider) -> Result<bool> {
        if !self.has_api_key(provider) {
            warn!("Refusing to activate {} without an API key", provider);
            return Ok(false);
        }
        self.store.set(ACTIVE_PROVIDER_KEY, provider.id())?;
        Ok(true)
    }

    /// Last model chosen for `provider`, if it is still in the catalog
    pub fn selected_model(&self, provider: Provider) -> Option<String> {
        self.get_non_empty(&model_slot(provider))
            .filter(|id| catalog::find_model(id).is_some_and(|m| m.provider == provider))
    }

    pub fn set_selected_model(&self, provider: Provider, model_id: &str) -> Result<()> {
        match catalog::find_model(model_id) {
            Some(model) if model.provider == provider => {
                self.store.set(&model_slot(provider), model_id)
            }
            Some(model) => Err(anyhow!(
                "Model {} belongs to {}, not {}",
                model_id,
                model.provider,
                provider
            )),
            None => Err(anyhow!("Unknown model: {}", model_id)),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.store.get(key).as_deref() == Some("true")
    }

    pub fn tool_options(&self) -> ToolOptions {
        ToolOptions {
            enable_web_search: self.flag(WEB_SEARCH_KEY),
            enable_web_fetch: self.flag(WEB_FETCH_KEY),
            enable_code_execution: self.flag(CODE_EXECUTION_KEY),
        }
    }

    pub fn set_tool_options(&self, tools: ToolOptions) -> Result<()> {
        self.store.set(WEB_SEARCH_KEY, &tools.enable_web_search.to_string())?;
        self.store.set(WEB_FETCH_KEY, &tools.enable_web_fetch.to_string())?;
        self.store
            .set(CODE_EXECUTION_KEY, &tools.enable_code_execution.to_string())
    }

    /// One-time upgrade from the single-key layout. Returns true if it ran.
    pub fn migrate(&self) -> Result<bool> {
        if self.flag(MIGRATION_FLAG) {
            return Ok(false);
        }

        if let Some(legacy) = self.get_non_empty(LEGACY_API_KEY) {
            let provider = catalog::provider_for_key(&legacy).unwrap_or(Provider::Anthropic);
            if self.has_api_key(provider) {
                warn!("Legacy API key skipped: {} already has a key", provider);
            } else {
                info!("Migrating legacy API key to {}", provider);
                self.store.set(&api_key_slot(provider), legacy.trim())?;
            }
            if self.store.get(ACTIVE_PROVIDER_KEY).is_none() {
                self.store.set(ACTIVE_PROVIDER_KEY, provider.id())?;
            }
        }
        self.store.remove(LEGACY_API_KEY)?;

        if let Some(legacy) = self.get_non_empty(LEGACY_MODEL_KEY) {
            let current = remap_legacy_model(legacy.trim());
            match catalog::find_model(current) {
                Some(model) if self.store.get(&model_slot(model.provider)).is_none() => {
                    info!("Migrating legacy model {} to {}", legacy, current);
                    self.store.set(&model_slot(model.provider), current)?;
                }
                Some(_) => {}
                None => warn!("Dropping unknown legacy model: {}", legacy),
            }
        }
        self.store.remove(LEGACY_MODEL_KEY)?;

        for provider in Provider::ALL {
            let slot = model_slot(provider);
            if let Some(stored) = self.store.get(&slot) {
                let current = remap_legacy_model(&stored);
                if current != stored {
                    info!("Remapping {} model {} to {}", provider, stored, current);
                    self.store.set(&slot, current)?;
                }
            }
        }

        self.store.set(MIGRATION_FLAG, "true")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_api_key_round_trip() {
        let prefs = Preferences::in_memory();
        prefs.set_api_key(Provider::OpenAi, "sk-proj-abc").unwrap();
        assert_eq!(prefs.api_key(Provider::OpenAi).as_deref(), Some("sk-proj-abc"));
        assert_eq!(prefs.api_key(Provider::Anthropic), None);

        prefs.clear_api_key(Provider::OpenAi).unwrap();
        assert_eq!(prefs.api_key(Provider::OpenAi), None);

        prefs.set_api_key(Provider::Gemini, "AIza-1").unwrap();
        prefs.set_api_key(Provider::Gemini, "  ").unwrap();
        assert!(!prefs.has_api_key(Provider::Gemini));
    }

    #[test]
    fn test_switch_to_provider_without_key_is_rejected() {
        let prefs = Preferences::in_memory();
        prefs.set_api_key(Provider::OpenAi, "sk-1").unwrap();
        assert!(prefs.set_active_provider(Provider::OpenAi).unwrap());

        assert!(!prefs.set_active_provider(Provider::Gemini).unwrap());
        assert_eq!(prefs.active_provider(), Provider::OpenAi);
    }

    #[test]
    fn test_active_provider_fallback() {
        let prefs = Preferences::in_memory();
        assert_eq!(prefs.active_provider(), Provider::Anthropic);

        prefs.set_api_key(Provider::Gemini, "AIza-1").unwrap();
        assert_eq!(prefs.active_provider(), Provider::Gemini);

        prefs.set_api_key(Provider::OpenAi, "sk-1").unwrap();
        prefs.set_active_provider(Provider::OpenAi).unwrap();
        prefs.clear_api_key(Provider::OpenAi).unwrap();
        assert_eq!(prefs.active_provider(), Provider::Gemini);
    }

    #[test]
    fn test_selected_model_validation() {
        let prefs = Preferences::in_memory();
        prefs
            .set_selected_model(Provider::Anthropic, "claude-sonnet-4-5-20250929")
            .unwrap();
        assert_eq!(
            prefs.selected_model(Provider::Anthropic).as_deref(),
            Some("claude-sonnet-4-5-20250929")
        );
        assert!(prefs.set_selected_model(Provider::Anthropic, "gpt-5").is_err());
        assert!(prefs.set_selected_model(Provider::OpenAi, "gpt-9").is_err());
    }

    #[test]
    fn test_tool_toggles() {
        let prefs = Preferences::in_memory();
        assert_eq!(prefs.tool_options(), ToolOptions::default());
        let tools = ToolOptions {
            enable_web_search: true,
            enable_web_fetch: false,
            enable_code_execution: true,
        };
        prefs.set_tool_options(tools).unwrap();
        assert_eq!(prefs.tool_options(), tools);
    }

    #[test]
    fn test_migration_moves_legacy_key_once() {
        let store = Arc::new(MemoryStore::new());
        store.set("api_key", "AIzaSyLegacy").unwrap();
        store.set("model", "gemini-1.5-flash").unwrap();
        store.set("model.openai", "gpt-4o").unwrap();
        let prefs = Preferences::new(store.clone());

        assert!(prefs.migrate().unwrap());
        assert_eq!(prefs.api_key(Provider::Gemini).as_deref(), Some("AIzaSyLegacy"));
        assert_eq!(prefs.active_provider(), Provider::Gemini);
        assert_eq!(
            prefs.selected_model(Provider::Gemini).as_deref(),
            Some("gemini-2.5-flash")
        );
        assert_eq!(prefs.selected_model(Provider::OpenAi).as_deref(), Some("gpt-5"));
        assert!(store.get("api_key").is_none());
        assert!(store.get("model").is_none());

        store.set("api_key", "sk-ant-late").unwrap();
        assert!(!prefs.migrate().unwrap());
        assert!(!prefs.has_api_key(Provider::Anthropic));
    }

    #[test]
    fn test_migration_keeps_existing_slot() {
        let store = Arc::new(MemoryStore::new());
        store.set("api_key", "sk-ant-old").unwrap();
        store.set("api_key.anthropic", "sk-ant-new").unwrap();
        let prefs = Preferences::new(store);
        prefs.migrate().unwrap();
        assert_eq!(prefs.api_key(Provider::Anthropic).as_deref(), Some("sk-ant-new"));
    }

    #[test]
    fn test_json_store_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/prefs.json");
        {
            let prefs = Preferences::new(Arc::new(JsonFileStore::open(&path).unwrap()));
            prefs.set_api_key(Provider::Anthropic, "sk-ant-x").unwrap();
        }
        let reopened = Preferences::new(Arc::new(JsonFileStore::open(&path).unwrap()));
        assert_eq!(reopened.api_key(Provider::Anthropic).as_deref(), Some("sk-ant-x"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_failed_save_leaves_memory_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prefs.json");
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let prefs = Preferences::new(store);
        prefs.set_api_key(Provider::OpenAi, "sk-proj-kept").unwrap();

        // A non-empty directory in place of the file makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        assert!(prefs.set_api_key(Provider::Anthropic, "sk-ant-x").is_err());
        assert!(!prefs.has_api_key(Provider::Anthropic));
        assert!(prefs.clear_api_key(Provider::OpenAi).is_err());
        assert_eq!(prefs.api_key(Provider::OpenAi).as_deref(), Some("sk-proj-kept"));
        assert!(!temp.path().join("prefs.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_tmp_file_is_narrowed() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prefs.json");
        let tmp = temp.path().join("prefs.json.tmp");
        std::fs::write(&tmp, "{}").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        store.set("tools.web_search", "true").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remap_legacy_model() {
        assert_eq!(remap_legacy_model("gpt-4o-mini"), "gpt-5-mini");
        assert_eq!(remap_legacy_model("gpt-5"), "gpt-5");
    }
}
