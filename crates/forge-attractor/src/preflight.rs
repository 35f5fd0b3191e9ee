//! Provider preflight: catalog coverage, CLI capability probing, model
//! access probing, prompt probing, and profile policy — run once before the
//! first stage and always reported to `<logs_root>/preflight_report.json`.
use crate::config::{CliProfile, ProviderBackend, ProviderConfig};
use crate::provider_runtime::ModelCatalog;
use crate::Graph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightSeverity {
    Pass,
    Warn,
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreflightFinding {
    pub check: String,
    pub provider: Option<String>,
    pub severity: PreflightSeverity,
    pub detail: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreflightReport {
    pub findings: Vec<PreflightFinding>,
}

impl PreflightReport {
    pub fn push(&mut self, finding: PreflightFinding) {
        self.findings.push(finding);
    }

    pub fn is_fatal(&self) -> bool {
        self.findings.iter().any(|finding| finding.severity == PreflightSeverity::Fail)
    }
}

/// `KILROY_PREFLIGHT_STRICT_CAPABILITIES=1` upgrades a capability-probe warn
/// into a fail.
pub fn strict_capabilities_enabled(env: &BTreeMap<String, String>) -> bool {
    env.get("KILROY_PREFLIGHT_STRICT_CAPABILITIES")
        .map(|value| value == "1")
        .unwrap_or(false)
}

/// Env overrides forbidden under the `real` profile.
pub const FORBIDDEN_REAL_PROFILE_ENV_KEYS: [&str; 3] =
    ["KILROY_CODEX_PATH", "KILROY_CLAUDE_PATH", "KILROY_GEMINI_PATH"];

pub const PROMPT_PROBE_TEXT: &str = "This is a test. Reply with just 'OK'.";

/// 1. Catalog coverage: every used `(provider, model)` pair must exist when
/// the catalog covers the provider, unless force-models bypasses the check.
pub fn check_catalog_coverage(
    provider: &str,
    model: &str,
    catalog: &ModelCatalog,
    force_models: &BTreeMap<String, String>,
) -> PreflightFinding {
    if force_models.contains_key(provider) {
        return PreflightFinding {
            check: "catalog_coverage".to_string(),
            provider: Some(provider.to_string()),
            severity: PreflightSeverity::Pass,
            detail: "force_models bypasses catalog coverage".to_string(),
        };
    }
    if !catalog.covers_provider(provider) {
        return PreflightFinding {
            check: "catalog_coverage".to_string(),
            provider: Some(provider.to_string()),
            severity: PreflightSeverity::Pass,
            detail: "catalog does not cover provider; skipped".to_string(),
        };
    }
    if catalog.has_pair(provider, model) {
        PreflightFinding {
            check: "catalog_coverage".to_string(),
            provider: Some(provider.to_string()),
            severity: PreflightSeverity::Pass,
            detail: format!("{provider}/{model} present in catalog"),
        }
    } else {
        PreflightFinding {
            check: "catalog_coverage".to_string(),
            provider: Some(provider.to_string()),
            severity: PreflightSeverity::Warn,
            detail: format!("{provider}/{model} not present in catalog"),
        }
    }
}

/// 2. CLI capability probe: help-probe output must contain every token in
/// `capability_all` and at least one token from each `capability_any_of`
/// group.
pub fn check_cli_capabilities(
    provider: &str,
    help_output: &str,
    capability_all: &[&str],
    capability_any_of: &[Vec<&str>],
    strict: bool,
) -> PreflightFinding {
    let missing_all: Vec<&str> = capability_all
        .iter()
        .filter(|token| !help_output.contains(*token))
        .copied()
        .collect();
    let missing_any_of: Vec<usize> = capability_any_of
        .iter()
        .enumerate()
        .filter(|(_, group)| !group.iter().any(|token| help_output.contains(token)))
        .map(|(index, _)| index)
        .collect();

    if missing_all.is_empty() && missing_any_of.is_empty() {
        return PreflightFinding {
            check: "cli_capabilities".to_string(),
            provider: Some(provider.to_string()),
            severity: PreflightSeverity::Pass,
            detail: "all required capability tokens present".to_string(),
        };
    }
    let detail = format!(
        "missing required tokens {missing_all:?}; missing any-of groups at indices {missing_any_of:?}"
    );
    PreflightFinding {
        check: "cli_capabilities".to_string(),
        provider: Some(provider.to_string()),
        severity: if strict { PreflightSeverity::Fail } else { PreflightSeverity::Warn },
        detail,
    }
}

/// 3. Model access probe (Google only): classifies probe output for a
/// missing-model signature.
pub fn check_model_access(provider: &str, probe_output: &str) -> PreflightFinding {
    let lowered = probe_output.to_ascii_lowercase();
    let missing = ["model not found", "unknown model", "does not exist"]
        .iter()
        .any(|needle| lowered.contains(needle));
    PreflightFinding {
        check: "model_access".to_string(),
        provider: Some(provider.to_string()),
        severity: if missing { PreflightSeverity::Fail } else { PreflightSeverity::Pass },
        detail: if missing {
            "probe output signals missing model".to_string()
        } else {
            "model accessible".to_string()
        },
    }
}

/// 5. Profile policy: `real` forbids env path overrides and per-provider
/// `executable`; `test_shim` requires `allow_test_shim` and an explicit
/// `executable` for every CLI provider in use.
pub fn check_profile_policy(
    profile: CliProfile,
    providers: &BTreeMap<String, ProviderConfig>,
    env: &BTreeMap<String, String>,
    allow_test_shim: bool,
) -> Vec<PreflightFinding> {
    let mut findings = Vec::new();
    match profile {
        CliProfile::Real => {
            for key in FORBIDDEN_REAL_PROFILE_ENV_KEYS {
                if env.contains_key(key) {
                    findings.push(PreflightFinding {
                        check: "profile_policy".to_string(),
                        provider: None,
                        severity: PreflightSeverity::Fail,
                        detail: format!("env override '{key}' forbidden under profile real"),
                    });
                }
            }
            for (name, provider) in providers {
                if provider.backend == ProviderBackend::Cli && provider.executable.is_some() {
                    findings.push(PreflightFinding {
                        check: "profile_policy".to_string(),
                        provider: Some(name.clone()),
                        severity: PreflightSeverity::Fail,
                        detail: "executable override forbidden under profile real".to_string(),
                    });
                }
            }
        }
        CliProfile::TestShim => {
            let cli_providers_in_use =
                providers.values().any(|provider| provider.backend == ProviderBackend::Cli);
            if cli_providers_in_use && !allow_test_shim {
                findings.push(PreflightFinding {
                    check: "profile_policy".to_string(),
                    provider: None,
                    severity: PreflightSeverity::Fail,
                    detail: "test_shim profile requires allow_test_shim=true for CLI providers".to_string(),
                });
            }
            for (name, provider) in providers {
                if provider.backend == ProviderBackend::Cli && provider.executable.is_none() {
                    findings.push(PreflightFinding {
                        check: "profile_policy".to_string(),
                        provider: Some(name.clone()),
                        severity: PreflightSeverity::Fail,
                        detail: "test_shim profile requires an explicit executable".to_string(),
                    });
                }
            }
        }
    }
    if findings.is_empty() {
        findings.push(PreflightFinding {
            check: "profile_policy".to_string(),
            provider: None,
            severity: PreflightSeverity::Pass,
            detail: format!("profile policy satisfied for {profile:?}"),
        });
    }
    findings
}

/// Inputs the run path gathers before the first stage executes. CLI help
/// output and model-access probe output are collected by the caller (the
/// subprocess/HTTP dispatch lives with the transport, not the runtime loop)
/// and handed in here already captured.
#[derive(Clone, Debug, Default)]
pub struct PreflightInputs {
    pub cli_profile: Option<CliProfile>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub provider: String,
    pub force_models: BTreeMap<String, String>,
    pub catalog: ModelCatalog,
    pub env: BTreeMap<String, String>,
    pub allow_test_shim: bool,
    pub cli_help_output: BTreeMap<String, String>,
    pub capability_all: Vec<String>,
    pub capability_any_of: Vec<Vec<String>>,
    pub model_access_probe_output: BTreeMap<String, String>,
}

/// Runs checks 1 (catalog coverage), 2 (CLI capabilities), 3 (model access),
/// and 5 (profile policy) against every `llm_model` a node in `graph`
/// declares. Check 4 (prompt probe) dispatches a real request per call and
/// is run directly by the caller via [`run_prompt_probe_with_retry`]; it is
/// not part of this aggregate pass.
pub fn run_preflight(graph: &Graph, inputs: &PreflightInputs) -> PreflightReport {
    let mut report = PreflightReport::default();
    let strict = strict_capabilities_enabled(&inputs.env);

    let mut models: Vec<&str> = graph
        .nodes
        .values()
        .filter_map(|node| node.attrs.get_str("llm_model"))
        .filter(|model| !model.trim().is_empty())
        .collect();
    models.sort_unstable();
    models.dedup();
    for model in models {
        report.push(check_catalog_coverage(
            &inputs.provider,
            model,
            &inputs.catalog,
            &inputs.force_models,
        ));
    }

    if let Some(profile) = inputs.cli_profile {
        for finding in
            check_profile_policy(profile, &inputs.providers, &inputs.env, inputs.allow_test_shim)
        {
            report.push(finding);
        }
    }

    let capability_all: Vec<&str> = inputs.capability_all.iter().map(String::as_str).collect();
    let capability_any_of: Vec<Vec<&str>> = inputs
        .capability_any_of
        .iter()
        .map(|group| group.iter().map(String::as_str).collect())
        .collect();
    for (provider, help_output) in &inputs.cli_help_output {
        report.push(check_cli_capabilities(
            provider,
            help_output,
            &capability_all,
            &capability_any_of,
            strict,
        ));
    }

    for (provider, probe_output) in &inputs.model_access_probe_output {
        report.push(check_model_access(provider, probe_output));
    }

    report
}

/// Writes `report` to `<logs_root>/preflight_report.json`, creating
/// `logs_root` if needed.
pub fn write_preflight_report(
    logs_root: &std::path::Path,
    report: &PreflightReport,
) -> Result<(), crate::AttractorError> {
    std::fs::create_dir_all(logs_root).map_err(|error| {
        crate::AttractorError::Runtime(format!(
            "failed to prepare logs root '{}' for preflight report: {}",
            logs_root.display(),
            error
        ))
    })?;
    let path = logs_root.join("preflight_report.json");
    let bytes = serde_json::to_vec_pretty(report).map_err(|error| {
        crate::AttractorError::Runtime(format!("failed to serialize preflight report: {error}"))
    })?;
    std::fs::write(&path, bytes).map_err(|error| {
        crate::AttractorError::Runtime(format!(
            "failed writing preflight report '{}': {}",
            path.display(),
            error
        ))
    })
}

fn is_retryable_probe_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["context deadline", "429", "408", "connection reset", "timeout"]
        .iter()
        .any(|needle| lowered.contains(needle))
        || matches!(status_code_in(&lowered), Some(500..=599))
}

fn status_code_in(message: &str) -> Option<u16> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .find_map(|token| token.parse::<u16>().ok())
}

fn is_non_retryable_probe_error(message: &str) -> bool {
    matches!(status_code_in(&message.to_ascii_lowercase()), Some(400 | 401 | 403 | 404 | 413 | 422))
}

#[derive(Clone, Copy, Debug)]
pub struct ProbeRetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ProbeRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        let scaled = self.base_delay.saturating_mul(multiplier);
        scaled.min(self.max_delay)
    }
}

/// 4. Prompt probe retry loop with exponential backoff. `send_probe` is
/// called up to `retries + 1` times; retryable errors back off and retry,
/// non-retryable errors stop immediately.
pub async fn run_prompt_probe_with_retry<F, Fut>(
    policy: ProbeRetryPolicy,
    mut send_probe: F,
) -> Result<String, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let mut attempt = 0;
    loop {
        match send_probe().await {
            Ok(response) => return Ok(response),
            Err(message) if is_non_retryable_probe_error(&message) => return Err(message),
            Err(message) if is_retryable_probe_error(&message) && attempt < policy.retries => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(message) => return Err(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_runtime::ModelCatalogEntry;

    #[test]
    fn catalog_coverage_warns_when_pair_missing() {
        let catalog = ModelCatalog::new(vec![ModelCatalogEntry {
            provider: "anthropic".to_string(),
            model_id: "claude-3-7".to_string(),
            is_variant: false,
        }]);
        let finding = check_catalog_coverage("anthropic", "claude-4", &catalog, &BTreeMap::new());
        assert_eq!(finding.severity, PreflightSeverity::Warn);
    }

    #[test]
    fn catalog_coverage_bypassed_by_force_models() {
        let catalog = ModelCatalog::default();
        let mut force_models = BTreeMap::new();
        force_models.insert("anthropic".to_string(), "claude-4".to_string());
        let finding = check_catalog_coverage("anthropic", "claude-4", &catalog, &force_models);
        assert_eq!(finding.severity, PreflightSeverity::Pass);
    }

    #[test]
    fn cli_capabilities_strict_mode_upgrades_to_fail() {
        let finding = check_cli_capabilities(
            "codex",
            "usage: codex --json",
            &["--json", "--sandbox"],
            &[vec!["--yolo", "--dangerously-skip-permissions"]],
            true,
        );
        assert_eq!(finding.severity, PreflightSeverity::Fail);

        let lenient = check_cli_capabilities(
            "codex",
            "usage: codex --json",
            &["--json", "--sandbox"],
            &[vec!["--yolo", "--dangerously-skip-permissions"]],
            false,
        );
        assert_eq!(lenient.severity, PreflightSeverity::Warn);
    }

    #[test]
    fn model_access_probe_classifies_missing_model() {
        let finding = check_model_access("google", "Error: model not found for this project");
        assert_eq!(finding.severity, PreflightSeverity::Fail);
        let ok = check_model_access("google", "model responded fine");
        assert_eq!(ok.severity, PreflightSeverity::Pass);
    }

    #[test]
    fn profile_policy_real_rejects_executable_override() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                backend: ProviderBackend::Cli,
                executable: Some("/bin/fake-claude".to_string()),
                api: None,
                failover: Vec::new(),
            },
        );
        let findings = check_profile_policy(CliProfile::Real, &providers, &BTreeMap::new(), false);
        assert!(findings.iter().any(|finding| finding.severity == PreflightSeverity::Fail));
    }

    #[test]
    fn profile_policy_test_shim_requires_allow_flag_and_executable() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                backend: ProviderBackend::Cli,
                executable: None,
                api: None,
                failover: Vec::new(),
            },
        );
        let findings = check_profile_policy(CliProfile::TestShim, &providers, &BTreeMap::new(), false);
        assert!(findings.iter().all(|finding| finding.severity == PreflightSeverity::Fail));

        providers.get_mut("anthropic").unwrap().executable = Some("/bin/shim".to_string());
        let findings = check_profile_policy(CliProfile::TestShim, &providers, &BTreeMap::new(), true);
        assert!(findings.iter().all(|finding| finding.severity == PreflightSeverity::Pass));
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_probe_retries_on_transient_error_then_succeeds() {
        let policy = ProbeRetryPolicy {
            retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        let mut calls = 0;
        let result = run_prompt_probe_with_retry(policy, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 2 {
                    Err("timeout talking to provider".to_string())
                } else {
                    Ok("OK".to_string())
                }
            }
        })
        .await;
        assert_eq!(result, Ok("OK".to_string()));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn prompt_probe_stops_immediately_on_non_retryable_error() {
        let policy = ProbeRetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let mut calls = 0;
        let result = run_prompt_probe_with_retry(policy, || {
            calls += 1;
            async move { Err("401 unauthorized".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn run_preflight_expected_catalog_coverage_for_each_node_model() {
        use crate::parse_dot;

        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                plan [llm_model="claude-4"]
                exit [shape=Msquare]
                start -> plan -> exit
            }
            "#,
        )
        .expect("graph should parse");
        let inputs = PreflightInputs {
            provider: "anthropic".to_string(),
            catalog: ModelCatalog::new(vec![ModelCatalogEntry {
                provider: "anthropic".to_string(),
                model_id: "claude-3-7".to_string(),
                is_variant: false,
            }]),
            ..PreflightInputs::default()
        };
        let report = run_preflight(&graph, &inputs);
        assert!(report.findings.iter().any(|finding| finding.check == "catalog_coverage"
            && finding.severity == PreflightSeverity::Warn));
    }

    #[test]
    fn run_preflight_expected_fatal_when_profile_policy_rejects() {
        use crate::parse_dot;

        let graph = parse_dot("digraph G { start [shape=Mdiamond] }").expect("graph should parse");
        let mut providers = BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                backend: ProviderBackend::Cli,
                executable: Some("/bin/fake-claude".to_string()),
                api: None,
                failover: Vec::new(),
            },
        );
        let inputs = PreflightInputs {
            cli_profile: Some(CliProfile::Real),
            providers,
            ..PreflightInputs::default()
        };
        let report = run_preflight(&graph, &inputs);
        assert!(report.is_fatal());
    }

    #[test]
    fn report_is_fatal_only_with_a_fail_finding() {
        let mut report = PreflightReport::default();
        report.push(PreflightFinding {
            check: "x".to_string(),
            provider: None,
            severity: PreflightSeverity::Warn,
            detail: "warn".to_string(),
        });
        assert!(!report.is_fatal());
        report.push(PreflightFinding {
            check: "y".to_string(),
            provider: None,
            severity: PreflightSeverity::Fail,
            detail: "fail".to_string(),
        });
        assert!(report.is_fatal());
    }
}
