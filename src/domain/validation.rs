use super::{
    error::{DeployError, Result},
    model::{ApplicationSpec, Autoscaling, AutoscalingRequest, HealthCheck},
};

const DEFAULT_MIN_REPLICAS: i32 = 1;
const DEFAULT_MAX_REPLICAS: i32 = 10;

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, at most 63 chars.
pub fn dns_label(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(DeployError::validation(format!(
            "{field} '{value}' must be a lowercase DNS label of at most 63 characters"
        )))
    }
}

pub fn hostname(value: &str) -> Result<()> {
    let valid = value.len() <= 253
        && value.contains('.')
        && value.split('.').all(|label| dns_label("domain", label).is_ok());
    if valid {
        Ok(())
    } else {
        Err(DeployError::validation(format!("'{value}' is not a valid domain name")))
    }
}

/// Secret keys end up as keys of a cluster secret and as env var names.
pub fn secret_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DeployError::validation(format!(
            "secret key '{key}' may only contain alphanumerics, '-', '_' and '.'"
        )))
    }
}

pub fn spec(spec: &ApplicationSpec) -> Result<()> {
    if spec.image.trim().is_empty() {
        return Err(DeployError::validation("image is required"));
    }
    if spec.replicas < 0 {
        return Err(DeployError::validation("replicas must not be negative"));
    }
    if spec.port == Some(0) {
        return Err(DeployError::validation("port must be between 1 and 65535"));
    }
    if spec.env_vars.keys().any(|name| name.trim().is_empty()) {
        return Err(DeployError::validation("environment variable names must not be empty"));
    }
    if let Some(health) = &spec.health_check {
        health_check(health)?;
    }
    if let Some(domain) = &spec.domain {
        hostname(domain)?;
    }
    Ok(())
}

fn health_check(health: &HealthCheck) -> Result<()> {
    if health.port == Some(0) {
        return Err(DeployError::validation("health check port must be between 1 and 65535"));
    }
    let negative = |value: Option<i32>| value.map_or(false, |v| v < 0);
    if negative(health.initial_delay_seconds) || negative(health.period_seconds) {
        return Err(DeployError::validation("health check timings must not be negative"));
    }
    Ok(())
}

/// Fills autoscaling defaults (min 1, max 10) and checks bounds.
pub fn autoscaling(request: &AutoscalingRequest) -> Result<Autoscaling> {
    let min_replicas = request.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS);
    let max_replicas = request.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS);
    if min_replicas < 1 {
        return Err(DeployError::validation("min_replicas must be at least 1"));
    }
    if max_replicas < min_replicas {
        return Err(DeployError::validation("max_replicas must be >= min_replicas"));
    }
    for (name, target) in [
        ("target_cpu_percent", request.target_cpu_percent),
        ("target_memory_percent", request.target_memory_percent),
    ] {
        if let Some(value) = target {
            if !(1..=100).contains(&value) {
                return Err(DeployError::validation(format!("{name} must be between 1 and 100")));
            }
        }
    }
    Ok(Autoscaling {
        enabled: request.enabled,
        min_replicas,
        max_replicas,
        target_cpu_percent: request.target_cpu_percent,
        target_memory_percent: request.target_memory_percent,
    })
}
