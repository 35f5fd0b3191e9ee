// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Who (or what) is attributed to a context, and where it came from.
///
/// Captured once at process start via [`capture_process_provenance`] and
/// threaded forward to derived contexts with [`new_provenance`], so a forked
/// conversation still carries its root process identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    #[serde(rename = "1")]
    pub service_name: String,
    #[serde(rename = "2")]
    pub service_version: String,
    #[serde(rename = "3")]
    pub service_instance_id: String,
    #[serde(rename = "4")]
    pub process_pid: i64,
    #[serde(rename = "5")]
    pub host_arch: String,
    #[serde(rename = "6")]
    pub captured_at: i64,
    #[serde(rename = "7")]
    pub on_behalf_of: String,
    #[serde(rename = "8")]
    pub on_behalf_of_source: String,
    #[serde(rename = "9")]
    pub on_behalf_of_email: String,
    #[serde(rename = "10")]
    pub correlation_id: String,
    #[serde(rename = "11")]
    pub parent_context_id: Option<u64>,
    #[serde(rename = "12")]
    pub root_context_id: Option<u64>,
    #[serde(rename = "13")]
    pub env_vars: Option<HashMap<String, String>>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A functional option applied by [`new_provenance`] after it inherits from
/// an optional base.
pub struct ProvenanceOption(Box<dyn FnOnce(&mut Provenance)>);

pub fn with_on_behalf_of(
    id: impl Into<String>,
    source: impl Into<String>,
    email: impl Into<String>,
) -> ProvenanceOption {
    let (id, source, email) = (id.into(), source.into(), email.into());
    ProvenanceOption(Box::new(move |p| {
        p.on_behalf_of = id;
        p.on_behalf_of_source = source;
        p.on_behalf_of_email = email;
    }))
}

pub fn with_correlation_id(id: impl Into<String>) -> ProvenanceOption {
    let id = id.into();
    ProvenanceOption(Box::new(move |p| p.correlation_id = id))
}

/// Sets `parent_context_id`; `root_context_id` defaults to `parent_id` when
/// `root_id` is `0` (root of a fresh fork, not an explicit ancestor).
pub fn with_parent_context(parent_id: u64, root_id: u64) -> ProvenanceOption {
    ProvenanceOption(Box::new(move |p| {
        p.parent_context_id = Some(parent_id);
        p.root_context_id = Some(if root_id == 0 { parent_id } else { root_id });
    }))
}

/// Captures the current value of each env var named in `names` that is
/// actually set, ignoring the rest.
pub fn with_env_vars(names: Option<Vec<String>>) -> ProvenanceOption {
    ProvenanceOption(Box::new(move |p| {
        let Some(names) = names else { return };
        let mut captured = HashMap::new();
        for name in names {
            if let Ok(value) = std::env::var(&name) {
                captured.insert(name, value);
            }
        }
        p.env_vars = Some(captured);
    }))
}

/// Captures a fresh [`Provenance`] for the current process.
pub fn capture_process_provenance(
    service_name: impl Into<String>,
    service_version: impl Into<String>,
    opts: Vec<ProvenanceOption>,
) -> Provenance {
    let mut provenance = Provenance {
        service_name: service_name.into(),
        service_version: service_version.into(),
        service_instance_id: uuid::Uuid::new_v4().to_string(),
        process_pid: std::process::id() as i64,
        host_arch: std::env::consts::ARCH.to_string(),
        captured_at: now_millis(),
        ..Provenance::default()
    };
    for opt in opts {
        (opt.0)(&mut provenance);
    }
    provenance
}

/// Derives a new [`Provenance`], inheriting service identity from `base`
/// (if given) and re-stamping `captured_at`, then applying `opts`.
pub fn new_provenance(base: Option<&Provenance>, opts: Vec<ProvenanceOption>) -> Provenance {
    let mut provenance = match base {
        Some(base) => Provenance {
            captured_at: std::cmp::max(base.captured_at, now_millis()),
            ..base.clone()
        },
        None => Provenance {
            captured_at: now_millis(),
            ..Provenance::default()
        },
    };
    for opt in opts {
        (opt.0)(&mut provenance);
    }
    provenance
}
