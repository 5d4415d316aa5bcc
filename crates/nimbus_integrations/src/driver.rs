//! Command construction and output interpretation for each tool family.
//!
//! Drivers are pure: they build command lines and read tool output, and
//! never launch anything themselves.

use nimbus_core::{ContextMapping, Identity, ProviderKind};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cloud::aws::AwsDriver;
use crate::cloud::gcp::GcpDriver;
use crate::kubernetes::KubernetesDriver;

/// Output fragments that mean a human has to log in again.
static LOGIN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile_patterns(&[
        r"(?i)not logged in",
        r"(?i)token has expired",
        r"(?i)expiredtoken",
        r"(?i)aws sso login",
        r"(?i)sso session .* (has )?expired",
        r"(?i)error loading sso token",
        r"(?i)unable to locate credentials",
        r"(?i)gcloud auth login",
        r"(?i)reauthentication",
        r"(?i)problem refreshing your current auth tokens",
        r"(?i)you must be logged in to the server",
        r"(?i)asked for the client to provide credentials",
    ])
});

fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// `true` when tool output asks for a fresh login.
pub fn requires_login(output: &str) -> bool {
    LOGIN_PATTERNS.iter().any(|re| re.is_match(output))
}

/// Shell syntax that could chain or redirect commands.
const FORBIDDEN_SEQUENCES: &[(&str, &str)] = &[
    (";", "command chaining"),
    ("|", "pipes"),
    ("&", "background or chained commands"),
    ("`", "command substitution"),
    ("$(", "command substitution"),
    ("\n", "multi-line commands"),
    ("\r", "multi-line commands"),
    (">", "output redirection"),
    ("<", "input redirection"),
];

/// Characters a shell would use to quote or escape.
const QUOTING_CHARS: &[char] = &['\'', '"', '\\'];

/// Flags that pick the tool context. They always come from the mapping.
const CONTEXT_FLAGS: &[&str] = &["--profile", "--configuration", "--project", "--context"];

/// The closed set of supported tool drivers.
#[derive(Debug, Clone)]
pub enum Driver {
    Aws(AwsDriver),
    Gcp(GcpDriver),
    Kubernetes(KubernetesDriver),
}

impl Driver {
    /// Builds the driver for `kind` using `program` as the executable.
    pub fn for_kind(kind: ProviderKind, program: impl Into<String>) -> Self {
        let program = program.into();
        match kind {
            ProviderKind::Aws => Self::Aws(AwsDriver::new(program)),
            ProviderKind::Gcp => Self::Gcp(GcpDriver::new(program)),
            ProviderKind::Kubernetes => Self::Kubernetes(KubernetesDriver::new(program)),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Aws(_) => ProviderKind::Aws,
            Self::Gcp(_) => ProviderKind::Gcp,
            Self::Kubernetes(_) => ProviderKind::Kubernetes,
        }
    }

    pub fn program(&self) -> &str {
        match self {
            Self::Aws(d) => d.program(),
            Self::Gcp(d) => d.program(),
            Self::Kubernetes(d) => d.program(),
        }
    }

    /// "Who am I" command, optionally pinned to a selector.
    pub fn probe_command(&self, selector: Option<&str>) -> String {
        match self {
            Self::Aws(d) => d.probe_command(selector),
            Self::Gcp(d) => d.probe_command(selector),
            Self::Kubernetes(d) => d.probe_command(selector),
        }
    }

    /// Reads the probe's stdout. `probed` is the selector the probe was pinned to.
    pub fn parse_identity(&self, stdout: &str, probed: Option<&str>) -> Result<Identity, String> {
        match self {
            Self::Aws(d) => d.parse_identity(stdout, probed),
            Self::Gcp(d) => d.parse_identity(stdout),
            Self::Kubernetes(d) => d.parse_identity(stdout),
        }
    }

    pub fn switch_command(&self, mapping: &ContextMapping) -> String {
        match self {
            Self::Aws(d) => d.switch_command(mapping),
            Self::Gcp(d) => d.switch_command(mapping),
            Self::Kubernetes(d) => d.switch_command(mapping),
        }
    }

    /// `None` when the tool has no login flow of its own.
    pub fn login_command(&self, mapping: &ContextMapping) -> Option<String> {
        match self {
            Self::Aws(d) => Some(d.login_command(mapping)),
            Self::Gcp(d) => Some(d.login_command()),
            Self::Kubernetes(_) => None,
        }
    }

    /// What an operator should run to get past `AuthRequired`.
    pub fn login_hint(&self, mapping: &ContextMapping) -> String {
        match self.login_command(mapping) {
            Some(cmd) => cmd,
            None => format!(
                "refresh the credentials for kube context '{}' and report completion",
                mapping.selector
            ),
        }
    }

    pub fn version_command(&self) -> String {
        match self {
            Self::Aws(d) => d.version_command(),
            Self::Gcp(d) => d.version_command(),
            Self::Kubernetes(d) => d.version_command(),
        }
    }

    /// Inherited environment variables that would override the selector.
    pub fn scrubbed_env(&self) -> &'static [&'static str] {
        match self {
            Self::Aws(_) => AwsDriver::SCRUBBED_ENV,
            Self::Gcp(_) => GcpDriver::SCRUBBED_ENV,
            Self::Kubernetes(_) => KubernetesDriver::SCRUBBED_ENV,
        }
    }

    fn extra_rejected_flags(&self) -> &'static [&'static str] {
        match self {
            Self::Aws(_) => AwsDriver::REJECTED_FLAGS,
            Self::Gcp(_) => GcpDriver::REJECTED_FLAGS,
            Self::Kubernetes(_) => KubernetesDriver::REJECTED_FLAGS,
        }
    }

    fn context_flags(&self, mapping: &ContextMapping, user_args: &[&str]) -> Vec<String> {
        match self {
            Self::Aws(d) => d.context_flags(mapping, user_args),
            Self::Gcp(d) => d.context_flags(mapping),
            Self::Kubernetes(d) => d.context_flags(mapping),
        }
    }

    /// Splits one of this driver's own command lines into arguments.
    ///
    /// The configured executable stays one argument even if its path has
    /// spaces; the rest never does.
    pub fn argv(&self, line: &str) -> Vec<String> {
        let program = self.program();
        match line.strip_prefix(program) {
            Some(rest) => std::iter::once(program.to_string())
                .chain(rest.split_whitespace().map(str::to_string))
                .collect(),
            None => line.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Like [`prepare`](Self::prepare) for a single command string.
    ///
    /// The string is split on whitespace. Quotes and backslashes are
    /// rejected since nothing would interpret them.
    pub fn prepare_line(
        &self,
        mapping: &ContextMapping,
        command_text: &str,
    ) -> Result<Vec<String>, String> {
        reject_shell_syntax(command_text)?;
        if let Some(c) = command_text.chars().find(|c| QUOTING_CHARS.contains(c)) {
            return Err(format!(
                "quoting is not supported ('{c}'); arguments are split on whitespace"
            ));
        }
        let args: Vec<String> = command_text.split_whitespace().map(str::to_string).collect();
        self.prepare(mapping, &args)
    }

    /// Validates a caller's arguments and pins them to `mapping`.
    ///
    /// `args[0]` must name this driver's tool. The result starts with the
    /// configured executable followed by the context flags, and is executed
    /// without a shell.
    pub fn prepare(&self, mapping: &ContextMapping, args: &[String]) -> Result<Vec<String>, String> {
        for arg in args {
            reject_shell_syntax(arg)?;
        }

        let Some((first, rest)) = args.split_first() else {
            return Err("empty command".into());
        };
        let default_program = self.kind().default_program();
        if first != default_program && first != self.program() {
            return Err(format!(
                "command must start with '{default_program}', got '{first}'"
            ));
        }

        for arg in rest {
            if let Some(flag) = self.context_flag_in(arg) {
                return Err(format!(
                    "'{flag}' is taken from the context mapping and cannot be overridden"
                ));
            }
        }

        let user_args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let mut prepared = vec![self.program().to_string()];
        prepared.extend(self.context_flags(mapping, &user_args));
        prepared.extend(rest.iter().cloned());
        Ok(prepared)
    }

    /// The context flag `arg` would set, if any.
    ///
    /// Quote and backslash characters are ignored, and unambiguous prefixes
    /// such as `--prof` count, since some tools accept abbreviated flags.
    fn context_flag_in(&self, arg: &str) -> Option<&'static str> {
        let normalized: String = arg.chars().filter(|c| !QUOTING_CHARS.contains(c)).collect();
        let name = normalized.split('=').next().unwrap_or_default();
        if !name.starts_with("--") || name.len() < 3 {
            return None;
        }
        CONTEXT_FLAGS
            .iter()
            .chain(self.extra_rejected_flags())
            .copied()
            .find(|flag| flag.starts_with(name))
    }
}

fn reject_shell_syntax(text: &str) -> Result<(), String> {
    for (needle, what) in FORBIDDEN_SEQUENCES {
        if text.contains(needle) {
            return Err(format!("{what} are not allowed ('{}')", needle.escape_default()));
        }
    }
    Ok(())
}

/// Reads a string field, empty when missing.
pub(crate) fn json_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
