//! Run configuration shapes: `RunConfigFile`, deserialized from TOML or
//! JSON, and the provider table it feeds to the provider runtime.
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

fn require_clean_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Bool(bool),
        Other(serde_json::Value),
    }
    match Shape::deserialize(deserializer)? {
        Shape::Bool(value) => Ok(value),
        Shape::Other(other) => Err(D::Error::custom(format!(
            "git.require_clean must be a bool, found legacy table/value shape: {other}"
        ))),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunConfigFile {
    pub repo: RepoConfig,
    #[serde(default)]
    pub cxdb: CxdbConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub modeldb: ModelDbConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub artifact_policy: ArtifactPolicyConfig,
    #[serde(default)]
    pub runtime_policy: RuntimePolicyConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RepoConfig {
    pub path: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CxdbConfig {
    pub binary_addr: Option<String>,
    pub http_base_url: Option<String>,
    #[serde(default)]
    pub autostart: CxdbAutostartConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CxdbAutostartConfig {
    #[serde(default)]
    pub enabled: bool,
    pub command: Option<String>,
    pub wait_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub ui: CxdbAutostartUiConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CxdbAutostartUiConfig {
    #[serde(default)]
    pub enabled: bool,
    pub command: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliProfile {
    Real,
    TestShim,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmConfig {
    pub cli_profile: CliProfile,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderBackend {
    Api,
    Cli,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub backend: ProviderBackend,
    pub executable: Option<String>,
    pub api: Option<ProviderApiConfig>,
    #[serde(default)]
    pub failover: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderApiConfig {
    pub protocol: String,
    pub base_url: String,
    #[serde(default)]
    pub path: Option<String>,
    pub api_key_env: String,
    #[serde(default)]
    pub provider_options_key: Option<String>,
    #[serde(default)]
    pub profile_family: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelInfoUpdatePolicy {
    Pinned,
    #[default]
    OnRunStart,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelDbConfig {
    pub openrouter_model_info_path: Option<String>,
    #[serde(default)]
    pub openrouter_model_info_update_policy: ModelInfoUpdatePolicy,
    pub openrouter_model_info_url: Option<String>,
    pub openrouter_model_info_fetch_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_require_clean", deserialize_with = "require_clean_bool")]
    pub require_clean: bool,
    #[serde(default = "default_run_branch_prefix")]
    pub run_branch_prefix: String,
    #[serde(default = "default_true")]
    pub commit_per_node: bool,
    pub push_remote: Option<String>,
    #[serde(default)]
    pub checkpoint_exclude_globs: Vec<String>,
}

fn default_require_clean() -> bool {
    true
}

fn default_run_branch_prefix() -> String {
    "attractor/".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            require_clean: default_require_clean(),
            run_branch_prefix: default_run_branch_prefix(),
            commit_per_node: true,
            push_remote: None,
            checkpoint_exclude_globs: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ArtifactPolicyConfig {
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub checkpoint: ArtifactCheckpointConfig,
    #[serde(default)]
    pub env: ArtifactEnvConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ArtifactCheckpointConfig {
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ArtifactEnvConfig {
    #[serde(default)]
    pub managed_roots: Vec<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimePolicyConfig {
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default)]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    #[serde(default = "default_max_llm_retries")]
    pub max_llm_retries: u32,
}

fn default_stage_timeout_ms() -> u64 {
    600_000
}

fn default_stall_check_interval_ms() -> u64 {
    5_000
}

fn default_max_llm_retries() -> u32 {
    3
}

impl Default for RuntimePolicyConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout_ms(),
            stall_timeout_ms: 0,
            stall_check_interval_ms: default_stall_check_interval_ms(),
            max_llm_retries: default_max_llm_retries(),
        }
    }
}

impl RuntimePolicyConfig {
    pub fn stage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn stall_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stall_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stall_check_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreflightConfig {
    #[serde(default)]
    pub prompt_probes: PromptProbesConfig,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            prompt_probes: PromptProbesConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PromptProbesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub transports: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    #[serde(default = "default_probe_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_probe_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_probe_retries() -> u32 {
    2
}

fn default_probe_base_delay_ms() -> u64 {
    250
}

fn default_probe_max_delay_ms() -> u64 {
    4_000
}

impl Default for PromptProbesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transports: Vec::new(),
            timeout_ms: default_probe_timeout_ms(),
            retries: default_probe_retries(),
            base_delay_ms: default_probe_base_delay_ms(),
            max_delay_ms: default_probe_max_delay_ms(),
        }
    }
}

impl RunConfigFile {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
