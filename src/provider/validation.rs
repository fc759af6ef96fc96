//! Shape-common worker template validation.
//!
//! Providers share these rules so a template rejected by one backend is
//! rejected by all of them. Provider-specific checks layer on top via
//! [`validate_template_with`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::WorkerTemplate;

/// Default cap on volume mounts per worker.
pub const DEFAULT_MAX_VOLUMES: usize = 8;

/// Linux capabilities that are never allowed on a worker.
pub const DANGEROUS_CAPABILITIES: [&str; 8] = [
    "SYS_ADMIN",
    "NET_ADMIN",
    "SYS_TIME",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_PTRACE",
    "DAC_READ_SEARCH",
    "DAC_OVERRIDE",
];

/// Host paths that must never be mounted into a worker.
pub const SENSITIVE_HOST_PATHS: [&str; 3] = ["/var/run/docker.sock", "/proc", "/sys"];

/// A single template validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// The template field the issue concerns.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn dns_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"))
}

fn env_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // registry/repository[:tag][@digest], lowercase repository path.
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+([._/-][a-z0-9]+)*(:[A-Za-z0-9._-]+)?(@sha256:[a-f0-9]{64})?$")
            .expect("static regex")
    })
}

/// Returns whether `name` is a valid DNS-1123 label.
pub fn is_dns_label(name: &str) -> bool {
    name.len() <= 63 && dns_label_re().is_match(name)
}

/// Validates a template against the shared rules with the default limits.
pub fn validate_template(template: &WorkerTemplate) -> Vec<ValidationIssue> {
    validate_template_with(template, DEFAULT_MAX_VOLUMES)
}

/// Validates a template with a provider-specific volume cap.
pub fn validate_template_with(
    template: &WorkerTemplate,
    max_volumes: usize,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if template.name.is_empty() {
        issues.push(ValidationIssue::new("name", "must not be empty"));
    } else if !is_dns_label(&template.name) {
        issues.push(ValidationIssue::new(
            "name",
            "must be a DNS-1123 label (lowercase alphanumerics and '-', max 63 chars)",
        ));
    }

    if template.image.is_empty() {
        issues.push(ValidationIssue::new("image", "must not be empty"));
    } else if !image_re().is_match(&template.image) {
        issues.push(ValidationIssue::new(
            "image",
            format!("'{}' is not a valid image reference", template.image),
        ));
    }

    if let Err(err) = template.resources.parse() {
        issues.push(ValidationIssue::new("resources", err.to_string()));
    }

    for key in template.labels.keys() {
        // A label key may carry a DNS-name prefix ("example.com/role").
        let name = key.rsplit('/').next().unwrap_or(key);
        if !is_dns_label(name) {
            issues.push(ValidationIssue::new(
                "labels",
                format!("label key '{key}' is not a valid DNS label"),
            ));
        }
    }

    for key in template.env.keys() {
        if !env_name_re().is_match(key) {
            issues.push(ValidationIssue::new(
                "env",
                format!("environment variable name '{key}' is not a valid identifier"),
            ));
        }
    }

    if template.volumes.len() > max_volumes {
        issues.push(ValidationIssue::new(
            "volumes",
            format!(
                "{} volume mounts exceed the limit of {max_volumes}",
                template.volumes.len()
            ),
        ));
    }

    for volume in &template.volumes {
        if is_sensitive_host_path(&volume.host_path) {
            issues.push(ValidationIssue::new(
                "volumes",
                format!("host path '{}' must not be mounted", volume.host_path),
            ));
        }
    }

    for port in &template.ports {
        if port.container_port < 1024 {
            issues.push(ValidationIssue::new(
                "ports",
                format!(
                    "container port {} is outside the allowed range 1024-65535",
                    port.container_port
                ),
            ));
        }
    }

    if template.security.privileged {
        issues.push(ValidationIssue::new(
            "security",
            "privileged workers are not allowed",
        ));
    }
    if template.security.allow_privilege_escalation {
        issues.push(ValidationIssue::new(
            "security",
            "privilege escalation is not allowed",
        ));
    }
    for capability in &template.security.added_capabilities {
        let upper = capability.trim_start_matches("CAP_").to_ascii_uppercase();
        if DANGEROUS_CAPABILITIES.contains(&upper.as_str()) {
            issues.push(ValidationIssue::new(
                "security",
                format!("capability '{capability}' is not allowed"),
            ));
        }
    }

    issues
}

fn is_sensitive_host_path(path: &str) -> bool {
    let normalized = path.trim_end_matches('/');
    SENSITIVE_HOST_PATHS.iter().any(|sensitive| {
        normalized == *sensitive || normalized.starts_with(&format!("{sensitive}/"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{PortMapping, PortProtocol, VolumeMount, WorkerTemplate};

    fn template() -> WorkerTemplate {
        WorkerTemplate::new("builders", "registry.example.com/fleet/builder:1.4")
    }

    #[test]
    fn test_valid_template_has_no_issues() {
        assert!(validate_template(&template()).is_empty());
    }

    #[test]
    fn test_name_rules() {
        let mut t = template();
        t.name = String::new();
        assert!(!validate_template(&t).is_empty());

        t.name = "Has_Underscores".to_string();
        assert!(validate_template(&t)
            .iter()
            .any(|i| i.field == "name"));

        t.name = "a".repeat(64);
        assert!(!validate_template(&t).is_empty());
    }

    #[test]
    fn test_image_rules() {
        let mut t = template();
        t.image = String::new();
        assert!(validate_template(&t).iter().any(|i| i.field == "image"));

        t.image = "UPPERCASE/image".to_string();
        assert!(validate_template(&t).iter().any(|i| i.field == "image"));

        t.image = "python:3.11-slim".to_string();
        assert!(validate_template(&t).is_empty());
    }

    #[test]
    fn test_unparseable_resources_rejected() {
        let mut t = template();
        t.resources.cpu = "lots".to_string();
        assert!(validate_template(&t)
            .iter()
            .any(|i| i.field == "resources"));
    }

    #[test]
    fn test_env_identifier_rules() {
        let mut t = template();
        t.env.insert("VALID_NAME".to_string(), "1".to_string());
        assert!(validate_template(&t).is_empty());

        t.env.insert("1BAD".to_string(), "1".to_string());
        assert!(validate_template(&t).iter().any(|i| i.field == "env"));
    }

    #[test]
    fn test_dangerous_capabilities_rejected() {
        for capability in DANGEROUS_CAPABILITIES {
            let mut t = template();
            t.security.added_capabilities = vec![capability.to_string()];
            assert!(
                validate_template(&t).iter().any(|i| i.field == "security"),
                "expected {capability} to be rejected"
            );
        }

        // CAP_ prefix and case differences do not slip through.
        let mut t = template();
        t.security.added_capabilities = vec!["cap_sys_admin".to_string()];
        assert!(validate_template(&t).iter().any(|i| i.field == "security"));

        let mut t = template();
        t.security.added_capabilities = vec!["NET_BIND_SERVICE".to_string()];
        assert!(validate_template(&t).is_empty());
    }

    #[test]
    fn test_privileged_rejected() {
        let mut t = template();
        t.security.privileged = true;
        t.security.allow_privilege_escalation = true;
        let issues = validate_template(&t);
        assert_eq!(issues.iter().filter(|i| i.field == "security").count(), 2);
    }

    #[test]
    fn test_sensitive_host_paths_rejected() {
        for path in [
            "/var/run/docker.sock",
            "/proc",
            "/proc/sys/kernel",
            "/sys",
            "/sys/fs/cgroup",
        ] {
            let mut t = template();
            t.volumes = vec![VolumeMount {
                host_path: path.to_string(),
                container_path: "/mnt".to_string(),
                read_only: true,
            }];
            assert!(
                validate_template(&t).iter().any(|i| i.field == "volumes"),
                "expected {path} to be rejected"
            );
        }

        let mut t = template();
        t.volumes = vec![VolumeMount {
            host_path: "/data/cache".to_string(),
            container_path: "/cache".to_string(),
            read_only: false,
        }];
        assert!(validate_template(&t).is_empty());
    }

    #[test]
    fn test_volume_limit() {
        let mut t = template();
        t.volumes = (0..DEFAULT_MAX_VOLUMES + 1)
            .map(|i| VolumeMount {
                host_path: format!("/data/{i}"),
                container_path: format!("/mnt/{i}"),
                read_only: false,
            })
            .collect();
        assert!(validate_template(&t).iter().any(|i| i.field == "volumes"));
    }

    #[test]
    fn test_port_range() {
        let mut t = template();
        t.ports = vec![PortMapping {
            container_port: 80,
            protocol: PortProtocol::Tcp,
        }];
        assert!(validate_template(&t).iter().any(|i| i.field == "ports"));

        t.ports = vec![PortMapping {
            container_port: 8080,
            protocol: PortProtocol::Sctp,
        }];
        assert!(validate_template(&t).is_empty());
    }
}
