use nimbus_core::{ContextMapping, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::json_str;

/// Driver for the `gcloud` CLI. Context is the named configuration.
#[derive(Debug, Clone)]
pub struct GcpDriver {
    program: String,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Active configuration as reported by `gcloud info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcloudInfo {
    pub project: String,
    pub account: Option<String>,
    pub active_config_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub status: String,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GkeCluster {
    pub name: String,
    pub location: String,
    pub status: String,
    pub node_count: u32,
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpProjectInfo {
    pub project_id: String,
    pub name: String,
    pub project_number: String,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl GcpDriver {
    pub const SCRUBBED_ENV: &'static [&'static str] =
        &["CLOUDSDK_ACTIVE_CONFIG_NAME", "CLOUDSDK_CORE_PROJECT"];
    pub const REJECTED_FLAGS: &'static [&'static str] = &["--account"];

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn probe_command(&self, configuration: Option<&str>) -> String {
        let mut cmd = format!("{} info --format=json", self.program);
        if let Some(configuration) = configuration {
            cmd.push_str(" --configuration ");
            cmd.push_str(configuration);
        }
        cmd
    }

    pub fn parse_identity(&self, stdout: &str) -> Result<Identity, String> {
        let info = parse_gcloud_info(stdout)?;
        if info.project.is_empty() {
            return Err("gcloud info reports no active project".into());
        }
        let selector = (!info.active_config_name.is_empty()).then_some(info.active_config_name);
        Ok(Identity::new(info.project, selector))
    }

    pub fn switch_command(&self, mapping: &ContextMapping) -> String {
        format!(
            "{} config configurations activate {}",
            self.program, mapping.selector
        )
    }

    pub fn login_command(&self) -> String {
        format!("{} auth login --brief", self.program)
    }

    pub fn version_command(&self) -> String {
        format!("{} --version", self.program)
    }

    pub fn context_flags(&self, mapping: &ContextMapping) -> Vec<String> {
        vec![
            "--configuration".into(),
            mapping.selector.clone(),
            "--project".into(),
            mapping.expected_identity.clone(),
        ]
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

pub fn parse_gcloud_info(stdout: &str) -> Result<GcloudInfo, String> {
    let parsed: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid gcloud info JSON: {e}"))?;
    let config = parsed.get("config").cloned().unwrap_or(Value::Null);
    Ok(GcloudInfo {
        project: json_str(&config, "project"),
        account: config
            .get("account")
            .and_then(|v| v.as_str())
            .map(String::from),
        active_config_name: json_str(&config, "active_config_name"),
    })
}

/// Keeps the last path segment of a resource URL.
fn short_name(full: &str) -> String {
    full.rsplit('/').next().unwrap_or(full).to_string()
}

pub fn parse_compute_instances(stdout: &str) -> Result<Vec<ComputeInstance>, String> {
    let raw: Vec<Value> = serde_json::from_str(stdout)
        .map_err(|e| format!("invalid Compute instances JSON: {e}"))?;

    Ok(raw
        .iter()
        .map(|item| {
            let interface = item
                .get("networkInterfaces")
                .and_then(|ni| ni.as_array())
                .and_then(|arr| arr.first());

            let external_ip = interface
                .and_then(|ni| ni.get("accessConfigs"))
                .and_then(|ac| ac.as_array())
                .and_then(|arr| arr.first())
                .and_then(|ac| ac.get("natIP"))
                .and_then(|v| v.as_str())
                .map(String::from);

            let internal_ip = interface
                .and_then(|ni| ni.get("networkIP"))
                .and_then(|v| v.as_str())
                .map(String::from);

            ComputeInstance {
                name: json_str(item, "name"),
                zone: short_name(&json_str(item, "zone")),
                machine_type: short_name(&json_str(item, "machineType")),
                status: json_str(item, "status"),
                external_ip,
                internal_ip,
                created_at: json_str(item, "creationTimestamp"),
            }
        })
        .collect())
}

pub fn parse_gke_clusters(stdout: &str) -> Result<Vec<GkeCluster>, String> {
    let raw: Vec<Value> =
        serde_json::from_str(stdout).map_err(|e| format!("invalid GKE clusters JSON: {e}"))?;

    Ok(raw
        .iter()
        .map(|c| {
            let location = match json_str(c, "location") {
                loc if loc.is_empty() => json_str(c, "zone"),
                loc => loc,
            };
            GkeCluster {
                name: json_str(c, "name"),
                location,
                status: json_str(c, "status"),
                node_count: c
                    .get("currentNodeCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                kubernetes_version: json_str(c, "currentMasterVersion"),
            }
        })
        .collect())
}

pub fn parse_project_info(stdout: &str) -> Result<GcpProjectInfo, String> {
    let parsed: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid project JSON: {e}"))?;
    Ok(GcpProjectInfo {
        project_id: json_str(&parsed, "projectId"),
        name: json_str(&parsed, "name"),
        project_number: json_str(&parsed, "projectNumber"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::{LogicalEnv, ProviderKind};

    fn driver() -> GcpDriver {
        GcpDriver::new("gcloud")
    }

    #[test]
    fn test_probe_and_switch_commands() {
        let m = ContextMapping::new(
            ProviderKind::Gcp,
            LogicalEnv::new("prod").unwrap(),
            "acme-prod",
            "acme-prod-123",
        );
        assert_eq!(
            driver().probe_command(Some("acme-prod")),
            "gcloud info --format=json --configuration acme-prod"
        );
        assert_eq!(
            driver().switch_command(&m),
            "gcloud config configurations activate acme-prod"
        );
        assert_eq!(driver().login_command(), "gcloud auth login --brief");
        assert_eq!(
            driver().context_flags(&m),
            vec!["--configuration", "acme-prod", "--project", "acme-prod-123"]
        );
    }

    #[test]
    fn test_parse_identity_from_info() {
        let stdout = r#"{
            "config": {
                "account": "ops@acme.dev",
                "active_config_name": "dev",
                "project": "acme-dev"
            },
            "installation": {"sdk_root": "/usr/lib/google-cloud-sdk"}
        }"#;
        let identity = driver().parse_identity(stdout).unwrap();
        assert_eq!(identity.principal, "acme-dev");
        assert_eq!(identity.selector.as_deref(), Some("dev"));
    }

    #[test]
    fn test_parse_identity_without_project_fails() {
        let stdout = r#"{"config": {"active_config_name": "default"}}"#;
        assert!(driver().parse_identity(stdout).is_err());
    }

    #[test]
    fn test_parse_compute_instances_shortens_urls() {
        let stdout = r#"[{
            "name": "vm-1",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west1-b",
            "machineType": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west1-b/machineTypes/e2-small",
            "status": "RUNNING",
            "networkInterfaces": [{"networkIP": "10.1.0.2", "accessConfigs": [{"natIP": "34.1.2.3"}]}]
        }]"#;
        let instances = parse_compute_instances(stdout).unwrap();
        assert_eq!(instances[0].zone, "europe-west1-b");
        assert_eq!(instances[0].machine_type, "e2-small");
        assert_eq!(instances[0].external_ip.as_deref(), Some("34.1.2.3"));
    }

    #[test]
    fn test_parse_gke_clusters_prefers_location() {
        let stdout = r#"[
            {"name": "a", "location": "europe-west1", "zone": "europe-west1-b", "status": "RUNNING", "currentNodeCount": 3},
            {"name": "b", "zone": "us-central1-a", "status": "PROVISIONING"}
        ]"#;
        let clusters = parse_gke_clusters(stdout).unwrap();
        assert_eq!(clusters[0].location, "europe-west1");
        assert_eq!(clusters[0].node_count, 3);
        assert_eq!(clusters[1].location, "us-central1-a");
    }

    #[test]
    fn test_parse_project_info() {
        let info = parse_project_info(
            r#"{"projectId": "acme-dev", "name": "Acme Dev", "projectNumber": "4242"}"#,
        )
        .unwrap();
        assert_eq!(info.project_id, "acme-dev");
        assert_eq!(info.project_number, "4242");
    }
}
