//! Provider registry and model catalog
//!
//! Static configuration only: which providers exist, what their keys look
//! like, which native tools they support, and the models (with pricing)
//! each one exposes.

use serde::{Deserialize, Serialize};

/// Identity of a hosted LLM vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
}

impl Provider {
    /// All providers in fallback order
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::OpenAi, Provider::Gemini];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn from_id(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" | "gpt" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Static configuration for this provider
    pub fn config(&self) -> &'static ProviderConfig {
        match self {
            Self::Anthropic => &PROVIDERS[0],
            Self::OpenAi => &PROVIDERS[1],
            Self::Gemini => &PROVIDERS[2],
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Price/quality tier of a model within its provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Better,
}

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDefinition {
    pub id: &'static str,
    pub display_name: &'static str,
    pub provider: Provider,
    pub tier: ModelTier,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

/// Per-provider static configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub id: Provider,
    pub name: &'static str,
    pub key_prefix: &'static str,
    pub key_placeholder: &'static str,
    pub console_url: &'static str,
    pub supports_web_search: bool,
    pub supports_web_fetch: bool,
    pub supports_code_execution: bool,
}

pub static PROVIDERS: [ProviderConfig; 3] = [
    ProviderConfig {
        id: Provider::Anthropic,
        name: "Anthropic",
        key_prefix: "sk-ant-",
        key_placeholder: "sk-ant-api03-...",
        console_url: "https://console.anthropic.com/settings/keys",
        supports_web_search: true,
        supports_web_fetch: true,
        supports_code_execution: true,
    },
    ProviderConfig {
        id: Provider::OpenAi,
        name: "OpenAI",
        key_prefix: "sk-",
        key_placeholder: "sk-proj-...",
        console_url: "https://platform.openai.com/api-keys",
        supports_web_search: false,
        supports_web_fetch: false,
        supports_code_execution: false,
    },
    ProviderConfig {
        id: Provider::Gemini,
        name: "Google Gemini",
        key_prefix: "AIza",
        key_placeholder: "AIzaSy...",
        console_url: "https://aistudio.google.com/app/apikey",
        supports_web_search: false,
        supports_web_fetch: false,
        supports_code_execution: false,
    },
];

pub static MODELS: [ModelDefinition; 6] = [
    ModelDefinition {
        id: "claude-haiku-4-5-20251001",
        display_name: "Claude Haiku 4.5",
        provider: Provider::Anthropic,
        tier: ModelTier::Cheap,
        input_cost_per_million: 1.0,
        output_cost_per_million: 5.0,
    },
    ModelDefinition {
        id: "claude-sonnet-4-5-20250929",
        display_name: "Claude Sonnet 4.5",
        provider: Provider::Anthropic,
        tier: ModelTier::Better,
        input_cost_per_million: 3.0,
        output_cost_per_million: 15.0,
    },
    ModelDefinition {
        id: "gpt-5-mini",
        display_name: "GPT-5 mini",
        provider: Provider::OpenAi,
        tier: ModelTier::Cheap,
        input_cost_per_million: 0.25,
        output_cost_per_million: 2.0,
    },
    ModelDefinition {
        id: "gpt-5",
        display_name: "GPT-5",
        provider: Provider::OpenAi,
        tier: ModelTier::Better,
        input_cost_per_million: 1.25,
        output_cost_per_million: 10.0,
    },
    ModelDefinition {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        provider: Provider::Gemini,
        tier: ModelTier::Cheap,
        input_cost_per_million: 0.30,
        output_cost_per_million: 2.50,
    },
    ModelDefinition {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        provider: Provider::Gemini,
        tier: ModelTier::Better,
        input_cost_per_million: 1.25,
        output_cost_per_million: 10.0,
    },
];

/// Look up a model by id
pub fn find_model(id: &str) -> Option<&'static ModelDefinition> {
    MODELS.iter().find(|m| m.id == id)
}

/// All models offered by a provider, in catalog order
pub fn models_for(provider: Provider) -> Vec<&'static ModelDefinition> {
    MODELS.iter().filter(|m| m.provider == provider).collect()
}

/// The provider's cheapest-tier model, used when nothing else is selected
pub fn default_model(provider: Provider) -> &'static ModelDefinition {
    MODELS
        .iter()
        .find(|m| m.provider == provider && m.tier == ModelTier::Cheap)
        .or_else(|| MODELS.iter().find(|m| m.provider == provider))
        .unwrap_or(&MODELS[0])
}

/// Guess which provider issued a key from its prefix
pub fn provider_for_key(key: &str) -> Option<Provider> {
    let key = key.trim();
    // "sk-ant-" must win over OpenAI's bare "sk-"
    if key.starts_with(Provider::Anthropic.config().key_prefix) {
        Some(Provider::Anthropic)
    } else if key.starts_with(Provider::Gemini.config().key_prefix) {
        Some(Provider::Gemini)
    } else if key.starts_with(Provider::OpenAi.config().key_prefix) {
        Some(Provider::OpenAi)
    } else {
        None
    }
}
