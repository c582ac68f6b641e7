use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use k8s_openapi::api::{
    apps::v1::Deployment, autoscaling::v2::HorizontalPodAutoscaler, core::v1::Pod,
    networking::v1::Ingress,
};

use super::model::{AutoscalerStatus, DeploymentStatus, IngressStatus, PodStatus};

pub fn deployment_status(
    name: &str,
    deployment: &Deployment,
    pods: &[Pod],
    now: DateTime<Utc>,
) -> DeploymentStatus {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    let status = if ready == desired {
        "running"
    } else if ready > 0 {
        "partial"
    } else {
        "pending"
    };
    DeploymentStatus {
        name: name.to_string(),
        replicas: desired,
        ready_replicas: ready,
        desired_replicas: desired,
        status: status.to_string(),
        pods: pods.iter().map(|pod| pod_status(pod, now)).collect(),
    }
}

fn pod_status(pod: &Pod, now: DateTime<Utc>) -> PodStatus {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let restarts = status
        .and_then(|s| s.container_statuses.as_ref())
        .map_or(0, |containers| containers.iter().map(|c| c.restart_count).sum());
    let age = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|created| format_age(now - created.0))
        .unwrap_or_default();
    PodStatus {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready,
        restarts,
        age,
    }
}

/// Coarse age: seconds under a minute, then minutes, hours, days.
pub fn format_age(age: Duration) -> String {
    if age < Duration::minutes(1) {
        format!("{}s", age.num_seconds().max(0))
    } else if age < Duration::hours(1) {
        format!("{}m", age.num_minutes())
    } else if age < Duration::days(1) {
        format!("{}h", age.num_hours())
    } else {
        format!("{}d", age.num_days())
    }
}

/// A missing autoscaler reads as disabled.
pub fn autoscaler_status(hpa: Option<&HorizontalPodAutoscaler>) -> AutoscalerStatus {
    let Some(hpa) = hpa else {
        return AutoscalerStatus::default();
    };
    let mut readout = AutoscalerStatus {
        enabled: true,
        ..Default::default()
    };
    if let Some(spec) = &hpa.spec {
        readout.min_replicas = spec.min_replicas.unwrap_or(1);
        readout.max_replicas = spec.max_replicas;
        for metric in spec.metrics.iter().flatten() {
            if let Some(resource) = &metric.resource {
                match resource.name.as_str() {
                    "cpu" => readout.target_cpu_percent = resource.target.average_utilization,
                    "memory" => readout.target_memory_percent = resource.target.average_utilization,
                    _ => {}
                }
            }
        }
    }
    if let Some(status) = &hpa.status {
        readout.current_replicas = status.current_replicas.unwrap_or(0);
        readout.desired_replicas = status.desired_replicas;
        for metric in status.current_metrics.iter().flatten() {
            if let Some(resource) = &metric.resource {
                match resource.name.as_str() {
                    "cpu" => readout.current_cpu_percent = resource.current.average_utilization,
                    "memory" => readout.current_memory_percent = resource.current.average_utilization,
                    _ => {}
                }
            }
        }
    }
    readout
}

pub fn ingress_status(ingress: &Ingress) -> IngressStatus {
    let spec = ingress.spec.as_ref();
    let hosts: Vec<String> = spec
        .and_then(|s| s.rules.as_ref())
        .map(|rules| rules.iter().filter_map(|rule| rule.host.clone()).unique().collect())
        .unwrap_or_default();
    let load_balancer = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.hostname.clone().or_else(|| entry.ip.clone()));
    IngressStatus {
        domain: hosts.last().cloned().unwrap_or_default(),
        tls_enabled: spec
            .and_then(|s| s.tls.as_ref())
            .map_or(false, |tls| !tls.is_empty()),
        ready: load_balancer.is_some(),
        load_balancer,
        hosts,
    }
}
