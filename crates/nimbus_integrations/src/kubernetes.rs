use nimbus_core::{ContextMapping, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Types ──────────────────────────────────────────────────────────

/// A Kubernetes pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub ready: String,
    pub restarts: u32,
    pub age: String,
    pub node: String,
    pub ip: String,
}

/// A Kubernetes deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub ready_replicas: u32,
    pub desired_replicas: u32,
    pub updated_replicas: u32,
    pub available: bool,
}

// ── KubernetesDriver ───────────────────────────────────────────────

/// Driver for `kubectl`. Context is the kubeconfig context name and the
/// identity is the cluster that context points at.
///
/// There is no login command: credential plugins are cluster specific, so an
/// expired session parks until someone reports completion.
#[derive(Debug, Clone)]
pub struct KubernetesDriver {
    program: String,
}

impl KubernetesDriver {
    pub const SCRUBBED_ENV: &'static [&'static str] = &[];
    pub const REJECTED_FLAGS: &'static [&'static str] = &["--cluster", "--kubeconfig"];

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn probe_command(&self, context: Option<&str>) -> String {
        let mut cmd = format!("{} config view --minify -o json", self.program);
        if let Some(context) = context {
            cmd.push_str(" --context ");
            cmd.push_str(context);
        }
        cmd
    }

    pub fn parse_identity(&self, stdout: &str) -> Result<Identity, String> {
        let val: Value =
            serde_json::from_str(stdout).map_err(|e| format!("invalid kubeconfig JSON: {e}"))?;

        let first = &val["contexts"][0];
        let cluster = first["context"]["cluster"].as_str().unwrap_or("");
        if cluster.is_empty() {
            return Err("kubeconfig has no cluster for the active context".into());
        }
        let selector = val["current-context"]
            .as_str()
            .filter(|s| !s.is_empty())
            .or_else(|| first["name"].as_str())
            .map(String::from);
        Ok(Identity::new(cluster, selector))
    }

    pub fn switch_command(&self, mapping: &ContextMapping) -> String {
        format!("{} config use-context {}", self.program, mapping.selector)
    }

    pub fn version_command(&self) -> String {
        format!("{} version --client", self.program)
    }

    pub fn context_flags(&self, mapping: &ContextMapping) -> Vec<String> {
        vec!["--context".into(), mapping.selector.clone()]
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

pub fn parse_pod_list(stdout: &str) -> Result<Vec<Pod>, String> {
    let val: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid pod list JSON: {e}"))?;
    Ok(val["items"]
        .as_array()
        .map(|items| items.iter().map(parse_pod).collect())
        .unwrap_or_default())
}

pub fn parse_deployment_list(stdout: &str) -> Result<Vec<Deployment>, String> {
    let val: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid deployment list JSON: {e}"))?;
    Ok(val["items"]
        .as_array()
        .map(|items| items.iter().map(parse_deployment).collect())
        .unwrap_or_default())
}

fn parse_pod(val: &Value) -> Pod {
    let metadata = &val["metadata"];
    let status = &val["status"];

    let container_statuses = status["containerStatuses"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();
    let ready_count = container_statuses
        .iter()
        .filter(|cs| cs["ready"].as_bool().unwrap_or(false))
        .count();
    let restarts: u32 = container_statuses
        .iter()
        .map(|cs| cs["restartCount"].as_u64().unwrap_or(0) as u32)
        .sum();

    Pod {
        name: metadata["name"].as_str().unwrap_or("").to_string(),
        namespace: metadata["namespace"].as_str().unwrap_or("default").to_string(),
        status: status["phase"].as_str().unwrap_or("Unknown").to_string(),
        ready: format!("{}/{}", ready_count, container_statuses.len()),
        restarts,
        age: compute_age(metadata["creationTimestamp"].as_str().unwrap_or("")),
        node: val["spec"]["nodeName"].as_str().unwrap_or("").to_string(),
        ip: status["podIP"].as_str().unwrap_or("").to_string(),
    }
}

fn parse_deployment(val: &Value) -> Deployment {
    let metadata = &val["metadata"];
    let status = &val["status"];

    let desired = val["spec"]["replicas"].as_u64().unwrap_or(0) as u32;
    let available_replicas = status["availableReplicas"].as_u64().unwrap_or(0) as u32;

    Deployment {
        name: metadata["name"].as_str().unwrap_or("").to_string(),
        namespace: metadata["namespace"].as_str().unwrap_or("default").to_string(),
        ready_replicas: status["readyReplicas"].as_u64().unwrap_or(0) as u32,
        desired_replicas: desired,
        updated_replicas: status["updatedReplicas"].as_u64().unwrap_or(0) as u32,
        available: available_replicas >= desired && desired > 0,
    }
}

fn compute_age(timestamp: &str) -> String {
    if timestamp.is_empty() {
        return "unknown".to_string();
    }
    let Ok(created) = chrono::DateTime::parse_from_rfc3339(timestamp) else {
        return timestamp.to_string();
    };

    let duration = chrono::Utc::now().signed_duration_since(created);
    if duration.num_days() > 0 {
        format!("{}d", duration.num_days())
    } else if duration.num_hours() > 0 {
        format!("{}h", duration.num_hours())
    } else if duration.num_minutes() > 0 {
        format!("{}m", duration.num_minutes())
    } else {
        "just now".to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
