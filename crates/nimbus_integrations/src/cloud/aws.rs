use nimbus_core::{ContextMapping, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::json_str;

/// Selector reported when a probe was not pinned to a profile.
const DEFAULT_PROFILE: &str = "default";

/// Driver for the `aws` CLI. Context is the named profile.
#[derive(Debug, Clone)]
pub struct AwsDriver {
    program: String,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ec2Instance {
    pub id: String,
    pub name: Option<String>,
    pub instance_type: String,
    pub state: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub launch_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Bucket {
    pub name: String,
    pub creation_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaFunction {
    pub name: String,
    pub runtime: Option<String>,
    pub handler: Option<String>,
    pub memory_mb: u64,
    pub timeout_sec: u64,
    pub last_modified: String,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl AwsDriver {
    pub const SCRUBBED_ENV: &'static [&'static str] = &["AWS_PROFILE", "AWS_DEFAULT_PROFILE"];
    pub const REJECTED_FLAGS: &'static [&'static str] = &[];

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn probe_command(&self, profile: Option<&str>) -> String {
        let mut cmd = format!("{} sts get-caller-identity --output json", self.program);
        if let Some(profile) = profile {
            cmd.push_str(" --profile ");
            cmd.push_str(profile);
        }
        cmd
    }

    /// The STS response has no profile name, so the selector is the one the
    /// probe was pinned to.
    pub fn parse_identity(&self, stdout: &str, probed: Option<&str>) -> Result<Identity, String> {
        let identity = parse_caller_identity(stdout)?;
        if identity.account_id.is_empty() {
            return Err("STS response has no Account".into());
        }
        Ok(Identity::new(
            identity.account_id,
            Some(probed.unwrap_or(DEFAULT_PROFILE).to_string()),
        ))
    }

    /// Succeeds only when the profile exists in the local AWS config.
    pub fn switch_command(&self, mapping: &ContextMapping) -> String {
        format!("{} configure list --profile {}", self.program, mapping.selector)
    }

    pub fn login_command(&self, mapping: &ContextMapping) -> String {
        format!("{} sso login --profile {}", self.program, mapping.selector)
    }

    pub fn version_command(&self) -> String {
        format!("{} --version", self.program)
    }

    pub fn context_flags(&self, mapping: &ContextMapping, user_args: &[&str]) -> Vec<String> {
        let mut flags = vec!["--profile".to_string(), mapping.selector.clone()];
        let user_region = user_args
            .iter()
            .any(|a| *a == "--region" || a.starts_with("--region="));
        if let (Some(region), false) = (&mapping.region, user_region) {
            flags.push("--region".into());
            flags.push(region.clone());
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

pub fn parse_caller_identity(stdout: &str) -> Result<CallerIdentity, String> {
    let parsed: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid STS identity JSON: {e}"))?;
    Ok(CallerIdentity {
        account_id: json_str(&parsed, "Account"),
        arn: json_str(&parsed, "Arn"),
        user_id: json_str(&parsed, "UserId"),
    })
}

/// Expects `ec2 describe-instances --query Reservations[].Instances[]`.
pub fn parse_ec2_instances(stdout: &str) -> Result<Vec<Ec2Instance>, String> {
    let raw: Vec<Value> =
        serde_json::from_str(stdout).map_err(|e| format!("invalid EC2 instances JSON: {e}"))?;

    Ok(raw
        .iter()
        .map(|item| {
            let name = item
                .get("Tags")
                .and_then(|tags| tags.as_array())
                .and_then(|tags| {
                    tags.iter()
                        .find(|t| t.get("Key").and_then(|k| k.as_str()) == Some("Name"))
                })
                .and_then(|t| t.get("Value"))
                .and_then(|v| v.as_str())
                .map(String::from);

            Ec2Instance {
                id: json_str(item, "InstanceId"),
                name,
                instance_type: json_str(item, "InstanceType"),
                state: item
                    .get("State")
                    .and_then(|s| s.get("Name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                public_ip: item
                    .get("PublicIpAddress")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                private_ip: item
                    .get("PrivateIpAddress")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                launch_time: json_str(item, "LaunchTime"),
            }
        })
        .collect())
}

pub fn parse_s3_buckets(stdout: &str) -> Result<Vec<S3Bucket>, String> {
    let parsed: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid S3 buckets JSON: {e}"))?;
    Ok(parsed
        .get("Buckets")
        .and_then(|b| b.as_array())
        .map(|buckets| {
            buckets
                .iter()
                .map(|b| S3Bucket {
                    name: json_str(b, "Name"),
                    creation_date: json_str(b, "CreationDate"),
                })
                .collect()
        })
        .unwrap_or_default())
}

pub fn parse_lambda_functions(stdout: &str) -> Result<Vec<LambdaFunction>, String> {
    let parsed: Value =
        serde_json::from_str(stdout).map_err(|e| format!("invalid Lambda functions JSON: {e}"))?;
    Ok(parsed
        .get("Functions")
        .and_then(|f| f.as_array())
        .map(|functions| {
            functions
                .iter()
                .map(|f| LambdaFunction {
                    name: json_str(f, "FunctionName"),
                    runtime: f.get("Runtime").and_then(|v| v.as_str()).map(String::from),
                    handler: f.get("Handler").and_then(|v| v.as_str()).map(String::from),
                    memory_mb: f.get("MemorySize").and_then(|v| v.as_u64()).unwrap_or(0),
                    timeout_sec: f.get("Timeout").and_then(|v| v.as_u64()).unwrap_or(0),
                    last_modified: json_str(f, "LastModified"),
                })
                .collect()
        })
        .unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
