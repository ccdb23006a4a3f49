//! Status derivation: a pure function of a resource, its owned children, and the clock.

use chrono::{DateTime, Duration, Utc};
use lookout_core::{Resource, StatusSummary};
use serde_json::Value;

/// Containers whose runs are shorter than this are considered flapping.
pub const FLAP_THRESHOLD_SECS: i64 = 15 * 60;

pub fn status_for_resource(r: &Resource, owned: &[&Resource], now: DateTime<Utc>) -> StatusSummary {
    let spec = r.spec();
    let status = r.status();
    match r.kind.as_str() {
        "ReplicaSet" | "ReplicationController" => replicas(int(spec, "replicas"), int(status, "readyReplicas")),
        "Deployment" => deployment(spec, status),
        "Pod" => pod(status, now),
        "DaemonSet" => {
            let (Some(current), Some(desired)) = (int(status, "currentNumberScheduled"), int(status, "desiredNumberScheduled")) else {
                return StatusSummary::Unknown;
            };
            match current.cmp(&desired) {
                std::cmp::Ordering::Equal => StatusSummary::Ok,
                std::cmp::Ordering::Less => StatusSummary::ScalingUp,
                std::cmp::Ordering::Greater => StatusSummary::ScalingDown,
            }
        }
        "Service" | "Endpoints" | "Secret" => StatusSummary::None,
        "StatefulSet" => stateful_set(spec, status, owned),
        "PersistentVolume" | "PersistentVolumeClaim" => match status.get("phase").and_then(|v| v.as_str()) {
            Some("Bound") => StatusSummary::Ok,
            Some("Lost") => StatusSummary::Error,
            _ => StatusSummary::ScalingUp,
        },
        "Node" => node(status),
        _ => StatusSummary::Unknown,
    }
}

fn int(v: &Value, field: &str) -> Option<i64> { v.get(field).and_then(|x| x.as_i64()) }

fn replicas(desired: Option<i64>, ready: Option<i64>) -> StatusSummary {
    let desired = desired.unwrap_or(0);
    let ready = ready.unwrap_or(0);
    if desired == 0 && ready == 0 {
        StatusSummary::Disabled
    } else if ready == desired {
        StatusSummary::Ok
    } else if ready < desired {
        StatusSummary::ScalingUp
    } else {
        StatusSummary::ScalingDown
    }
}

fn conditions(status: &Value) -> Option<&Vec<Value>> { status.get("conditions").and_then(|c| c.as_array()) }

fn condition<'a>(status: &'a Value, ty: &str) -> Option<&'a str> {
    conditions(status)?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(ty))
        .and_then(|c| c.get("status").and_then(|s| s.as_str()))
}

fn deployment(spec: &Value, status: &Value) -> StatusSummary {
    let base = replicas(int(spec, "replicas"), int(status, "readyReplicas"));
    if base != StatusSummary::ScalingUp {
        return base;
    }
    if condition(status, "Progressing") == Some("False") {
        return StatusSummary::TimedOut;
    }
    match int(status, "unavailableReplicas") {
        Some(n) if n > 0 => {
            if Some(n) == int(status, "replicas") { StatusSummary::Error } else { StatusSummary::Warning }
        }
        _ => StatusSummary::ScalingUp,
    }
}

fn stateful_set(spec: &Value, status: &Value, owned: &[&Resource]) -> StatusSummary {
    let current = int(status, "replicas");
    let base = replicas(int(spec, "replicas"), current);
    if base != StatusSummary::ScalingUp {
        return base;
    }
    let failing = owned
        .iter()
        .filter(|p| matches!(p.status_summary, StatusSummary::Error | StatusSummary::Warning))
        .count() as i64;
    if failing == 0 {
        StatusSummary::ScalingUp
    } else if Some(failing) == current {
        StatusSummary::Error
    } else {
        StatusSummary::Warning
    }
}

fn timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn pod(status: &Value, now: DateTime<Utc>) -> StatusSummary {
    if conditions(status).is_none() {
        return StatusSummary::ScalingUp;
    }
    let is_true = |ty: &str| condition(status, ty) == Some("True");
    let (ready, scheduled, initialized) = (is_true("Ready"), is_true("PodScheduled"), is_true("Initialized"));
    if ready && scheduled && initialized {
        if is_flapping(status, now) { StatusSummary::Warning } else { StatusSummary::Ok }
    } else if ready || scheduled {
        StatusSummary::ScalingUp
    } else {
        StatusSummary::Unknown
    }
}

fn is_flapping(status: &Value, now: DateTime<Utc>) -> bool {
    let threshold = Duration::seconds(FLAP_THRESHOLD_SECS);
    let pod_age = timestamp(&status["startTime"]).map(|t| now - t);
    let Some(containers) = status.get("containerStatuses").and_then(|c| c.as_array()) else { return false; };
    containers.iter().any(|cs| {
        let Some(last) = cs.get("lastState").and_then(|s| s.get("terminated")) else { return false; };
        let last_run = match (timestamp(&last["startedAt"]), timestamp(&last["finishedAt"])) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        };
        let current_run = timestamp(&cs["state"]["running"]["startedAt"]).map(|s| now - s);
        let completed = last.get("reason").and_then(|r| r.as_str()) == Some("Completed");
        if let Some(current) = current_run {
            if current < threshold && (!completed || last_run.map(|d| d < threshold).unwrap_or(true)) {
                return true;
            }
        }
        let restarts = cs.get("restartCount").and_then(|r| r.as_i64()).unwrap_or(0);
        match pod_age {
            Some(age) if restarts > 1 => age / (restarts as i32) < threshold,
            _ => false,
        }
    })
}

fn node(status: &Value) -> StatusSummary {
    let Some(conds) = conditions(status) else { return StatusSummary::ScalingUp; };
    let mut out = StatusSummary::ScalingUp;
    for c in conds {
        let on = c.get("status").and_then(|s| s.as_str());
        match c.get("type").and_then(|t| t.as_str()) {
            Some("DiskPressure") | Some("MemoryPressure") if on == Some("True") => out = StatusSummary::Warning,
            Some("OutOfDisk") if on == Some("True") => return StatusSummary::Error,
            Some("Ready") => match on {
                Some("True") if out == StatusSummary::ScalingUp => out = StatusSummary::Ok,
                Some("False") | Some("Unknown") => out = StatusSummary::Error,
                _ => {}
            },
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(v: Value) -> Resource { Resource::from_value(v).expect("resource") }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").expect("ts").with_timezone(&Utc)
    }

    fn deploy(spec_replicas: i64, status: Value) -> Resource {
        res(json!({ "kind": "Deployment", "metadata": { "name": "web", "namespace": "default" },
                    "spec": { "replicas": spec_replicas }, "status": status }))
    }

    #[test]
    fn deployment_rules() {
        assert_eq!(status_for_resource(&deploy(3, json!({ "readyReplicas": 3 })), &[], now()), StatusSummary::Ok);
        assert_eq!(status_for_resource(&deploy(0, json!({})), &[], now()), StatusSummary::Disabled);
        assert_eq!(status_for_resource(&deploy(1, json!({ "readyReplicas": 2 })), &[], now()), StatusSummary::ScalingDown);
        let timed_out = json!({ "readyReplicas": 1, "conditions": [{ "type": "Progressing", "status": "False" }] });
        assert_eq!(status_for_resource(&deploy(3, timed_out), &[], now()), StatusSummary::TimedOut);
        let down = json!({ "replicas": 3, "unavailableReplicas": 3, "conditions": [{ "type": "Progressing", "status": "True" }] });
        assert_eq!(status_for_resource(&deploy(3, down), &[], now()), StatusSummary::Error);
        let partial = json!({ "replicas": 3, "readyReplicas": 1, "unavailableReplicas": 2 });
        assert_eq!(status_for_resource(&deploy(3, partial), &[], now()), StatusSummary::Warning);
        assert_eq!(status_for_resource(&deploy(3, json!({ "readyReplicas": 1 })), &[], now()), StatusSummary::ScalingUp);
    }

    fn pod_with(containers: Value) -> Resource {
        res(json!({
            "kind": "Pod",
            "metadata": { "name": "p", "namespace": "default" },
            "status": {
                "startTime": "2024-05-01T08:00:00Z",
                "conditions": [
                    { "type": "Initialized", "status": "True" },
                    { "type": "PodScheduled", "status": "True" },
                    { "type": "Ready", "status": "True" }
                ],
                "containerStatuses": containers
            }
        }))
    }

    #[test]
    fn pod_conditions_and_flapping() {
        let steady = pod_with(json!([{ "restartCount": 0, "state": { "running": { "startedAt": "2024-05-01T08:00:10Z" } }, "lastState": {} }]));
        assert_eq!(status_for_resource(&steady, &[], now()), StatusSummary::Ok);

        let flapping = pod_with(json!([{
            "restartCount": 1,
            "state": { "running": { "startedAt": "2024-05-01T11:55:00Z" } },
            "lastState": { "terminated": { "reason": "Error", "startedAt": "2024-05-01T11:50:00Z", "finishedAt": "2024-05-01T11:54:00Z" } }
        }]));
        assert_eq!(status_for_resource(&flapping, &[], now()), StatusSummary::Warning);

        let restarty = pod_with(json!([{
            "restartCount": 40,
            "state": { "running": { "startedAt": "2024-05-01T10:00:00Z" } },
            "lastState": { "terminated": { "reason": "Completed", "startedAt": "2024-05-01T09:00:00Z", "finishedAt": "2024-05-01T09:59:00Z" } }
        }]));
        assert_eq!(status_for_resource(&restarty, &[], now()), StatusSummary::Warning);

        let pending = res(json!({ "kind": "Pod", "metadata": { "name": "p", "namespace": "default" }, "status": {} }));
        assert_eq!(status_for_resource(&pending, &[], now()), StatusSummary::ScalingUp);
        let scheduled = res(json!({ "kind": "Pod", "metadata": { "name": "p", "namespace": "default" },
            "status": { "conditions": [{ "type": "PodScheduled", "status": "True" }] } }));
        assert_eq!(status_for_resource(&scheduled, &[], now()), StatusSummary::ScalingUp);
    }

    #[test]
    fn stateful_set_counts_failing_pods() {
        let sts = res(json!({ "kind": "StatefulSet", "metadata": { "name": "db", "namespace": "default" },
                              "spec": { "replicas": 3 }, "status": { "replicas": 2 } }));
        let mut bad = res(json!({ "kind": "Pod", "metadata": { "name": "db-0", "namespace": "default" } }));
        bad.status_summary = StatusSummary::Warning;
        let mut good = res(json!({ "kind": "Pod", "metadata": { "name": "db-1", "namespace": "default" } }));
        good.status_summary = StatusSummary::Ok;
        assert_eq!(status_for_resource(&sts, &[], now()), StatusSummary::ScalingUp);
        assert_eq!(status_for_resource(&sts, &[&bad, &good], now()), StatusSummary::Warning);
        let mut bad2 = good.clone();
        bad2.status_summary = StatusSummary::Error;
        assert_eq!(status_for_resource(&sts, &[&bad, &bad2], now()), StatusSummary::Error);
    }

    #[test]
    fn simple_kinds() {
        let svc = res(json!({ "kind": "Service", "metadata": { "name": "s", "namespace": "default" } }));
        assert_eq!(status_for_resource(&svc, &[], now()), StatusSummary::None);
        let pvc = res(json!({ "kind": "PersistentVolumeClaim", "metadata": { "name": "c", "namespace": "default" }, "status": { "phase": "Lost" } }));
        assert_eq!(status_for_resource(&pvc, &[], now()), StatusSummary::Error);
        let cm = res(json!({ "kind": "ConfigMap", "metadata": { "name": "c", "namespace": "default" } }));
        assert_eq!(status_for_resource(&cm, &[], now()), StatusSummary::Unknown);
        let ds = res(json!({ "kind": "DaemonSet", "metadata": { "name": "d", "namespace": "default" },
                             "status": { "currentNumberScheduled": 2, "desiredNumberScheduled": 3 } }));
        assert_eq!(status_for_resource(&ds, &[], now()), StatusSummary::ScalingUp);
    }

    #[test]
    fn node_conditions() {
        let node = |conds: Value| res(json!({ "kind": "Node", "metadata": { "name": "n1" }, "status": { "conditions": conds } }));
        assert_eq!(status_for_resource(&node(json!([{ "type": "Ready", "status": "True" }])), &[], now()), StatusSummary::Ok);
        assert_eq!(
            status_for_resource(&node(json!([{ "type": "MemoryPressure", "status": "True" }, { "type": "Ready", "status": "True" }])), &[], now()),
            StatusSummary::Warning
        );
        assert_eq!(status_for_resource(&node(json!([{ "type": "Ready", "status": "Unknown" }])), &[], now()), StatusSummary::Error);
        assert_eq!(
            status_for_resource(&node(json!([{ "type": "OutOfDisk", "status": "True" }, { "type": "Ready", "status": "True" }])), &[], now()),
            StatusSummary::Error
        );
    }
}
