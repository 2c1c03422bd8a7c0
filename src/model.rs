use crate::session::Host;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One point-in-time measurement of a host's resources, as published to
/// subscribers and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub host: Host,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disks: Vec<DiskUsage>,
    pub gpus: Vec<GpuStat>,
    pub observed_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub filesystem: String,
    pub size: String,
    pub used: String,
    pub avail: String,
    pub use_percent: f64,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStat {
    pub index: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub utilization_percent: f64,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("metrics payload is not a JSON object")]
    NotObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' has invalid type, expected {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },
    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: String, value: f64 },
}

/// Parses a raw metrics payload into a [`MetricsSnapshot`].
///
/// Validation is strict: out-of-range percentages are rejected rather than
/// clamped, so a dashboard never shows a silently corrected value. Disk
/// `use_percent` arrives as either a number or a string like `"82%"`; the
/// canonical form is numeric, with surrounding whitespace and one trailing
/// `%` stripped before parsing.
pub fn normalize(host: &Host, payload: &Value, observed_at_unix: i64) -> Result<MetricsSnapshot, ParseError> {
    let obj = payload.as_object().ok_or(ParseError::NotObject)?;

    let cpu_percent = require_percent(obj, "cpu_percent")?;
    let mem_percent = require_percent(obj, "mem_percent")?;

    let disks = match obj.get("disk") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => {
            let mut out = Vec::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                out.push(normalize_disk(entry, i)?);
            }
            out
        }
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "disk".to_string(),
                expected: "array",
            })
        }
    };

    let gpus = match obj.get("gpus") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => {
            let mut out = Vec::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                out.push(normalize_gpu(entry, i)?);
            }
            out
        }
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "gpus".to_string(),
                expected: "array",
            })
        }
    };

    Ok(MetricsSnapshot {
        host: host.clone(),
        cpu_percent,
        mem_percent,
        disks,
        gpus,
        observed_at_unix,
    })
}

fn normalize_disk(entry: &Value, index: usize) -> Result<DiskUsage, ParseError> {
    let obj = entry.as_object().ok_or_else(|| ParseError::InvalidField {
        field: format!("disk[{index}]"),
        expected: "object",
    })?;

    let mountpoint = obj
        .get("mountpoint")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField("mountpoint"))?
        .to_string();

    let use_percent = match obj.get("use_percent") {
        Some(v) => percent_value(v, &format!("disk[{index}].use_percent"))?,
        None => return Err(ParseError::MissingField("use_percent")),
    };

    Ok(DiskUsage {
        filesystem: label(obj.get("filesystem")),
        size: label(obj.get("size")),
        used: label(obj.get("used")),
        avail: label(obj.get("avail")),
        use_percent,
        mountpoint,
    })
}

fn normalize_gpu(entry: &Value, index: usize) -> Result<GpuStat, ParseError> {
    let obj = entry.as_object().ok_or_else(|| ParseError::InvalidField {
        field: format!("gpus[{index}]"),
        expected: "object",
    })?;

    let gpu_index = obj
        .get("index")
        .and_then(Value::as_u64)
        .ok_or_else(|| ParseError::InvalidField {
            field: format!("gpus[{index}].index"),
            expected: "non-negative integer",
        })?;

    let utilization_percent = match obj.get("utilization") {
        Some(v) => {
            let field = format!("gpus[{index}].utilization");
            let value = v.as_f64().ok_or_else(|| ParseError::InvalidField {
                field: field.clone(),
                expected: "number",
            })?;
            if !(0.0..=100.0).contains(&value) {
                return Err(ParseError::OutOfRange { field, value });
            }
            value
        }
        None => return Err(ParseError::MissingField("utilization")),
    };

    Ok(GpuStat {
        index: gpu_index as u32,
        memory_used_mb: obj.get("memory_used").and_then(Value::as_u64).unwrap_or(0),
        memory_total_mb: obj.get("memory_total").and_then(Value::as_u64).unwrap_or(0),
        utilization_percent,
    })
}

fn require_percent(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<f64, ParseError> {
    let value = obj.get(field).ok_or(ParseError::MissingField(field))?;
    let value = value.as_f64().ok_or(ParseError::InvalidField {
        field: field.to_string(),
        expected: "number",
    })?;
    if !(0.0..=100.0).contains(&value) {
        return Err(ParseError::OutOfRange {
            field: field.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Percentage fields appear both as numbers and as strings like `"82%"`.
fn percent_value(value: &Value, field: &str) -> Result<f64, ParseError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    let parsed = parsed.ok_or_else(|| ParseError::InvalidField {
        field: field.to_string(),
        expected: "number or percent string",
    })?;
    if !(0.0..=100.0).contains(&parsed) {
        return Err(ParseError::OutOfRange {
            field: field.to_string(),
            value: parsed,
        });
    }
    Ok(parsed)
}

fn label(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host() -> Host {
        Host::from("10.0.0.5")
    }

    #[test]
    fn normalizes_full_payload() {
        let payload = json!({
            "cpu_percent": 42.0,
            "mem_percent": 60.5,
            "disk": [{
                "filesystem": "/dev/sda1",
                "size": "98G",
                "used": "61G",
                "avail": "32G",
                "use_percent": "66%",
                "mountpoint": "/"
            }],
            "gpus": [{
                "index": 0,
                "memory_used": 2048,
                "memory_total": 16384,
                "utilization": 37.5
            }]
        });

        let snapshot = normalize(&host(), &payload, 1000).expect("payload must normalize");
        assert_eq!(snapshot.cpu_percent, 42.0);
        assert_eq!(snapshot.mem_percent, 60.5);
        assert_eq!(snapshot.disks.len(), 1);
        assert_eq!(snapshot.disks[0].mountpoint, "/");
        assert_eq!(snapshot.disks[0].use_percent, 66.0);
        assert_eq!(snapshot.gpus.len(), 1);
        assert_eq!(snapshot.gpus[0].utilization_percent, 37.5);
        assert_eq!(snapshot.observed_at_unix, 1000);
    }

    #[test]
    fn empty_disk_and_gpu_lists_are_fine() {
        let payload = json!({"cpu_percent": 42.0, "mem_percent": 60.5, "disk": [], "gpus": []});
        let snapshot = normalize(&host(), &payload, 0).expect("payload must normalize");
        assert!(snapshot.disks.is_empty());
        assert!(snapshot.gpus.is_empty());
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let payload = json!({"cpu_percent": 10.0, "mem_percent": 20.0});
        let snapshot = normalize(&host(), &payload, 0).expect("payload must normalize");
        assert!(snapshot.disks.is_empty());
        assert!(snapshot.gpus.is_empty());
    }

    #[test]
    fn missing_mem_percent_is_rejected() {
        let payload = json!({"cpu_percent": 42.0});
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("mem_percent")));
    }

    #[test]
    fn non_numeric_cpu_percent_is_rejected() {
        let payload = json!({"cpu_percent": "lots", "mem_percent": 1.0});
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { .. }));
    }

    #[test]
    fn numeric_use_percent_is_accepted() {
        let payload = json!({
            "cpu_percent": 1.0,
            "mem_percent": 1.0,
            "disk": [{"mountpoint": "/data", "use_percent": 82.0}]
        });
        let snapshot = normalize(&host(), &payload, 0).expect("payload must normalize");
        assert_eq!(snapshot.disks[0].use_percent, 82.0);
    }

    #[test]
    fn empty_mountpoint_is_rejected() {
        let payload = json!({
            "cpu_percent": 1.0,
            "mem_percent": 1.0,
            "disk": [{"mountpoint": "  ", "use_percent": 10.0}]
        });
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("mountpoint")));
    }

    #[test]
    fn out_of_range_gpu_utilization_is_rejected_not_clamped() {
        let payload = json!({
            "cpu_percent": 1.0,
            "mem_percent": 1.0,
            "gpus": [{"index": 0, "utilization": 120.0}]
        });
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::OutOfRange { .. }));
    }

    #[test]
    fn negative_gpu_index_is_rejected() {
        let payload = json!({
            "cpu_percent": 1.0,
            "mem_percent": 1.0,
            "gpus": [{"index": -1, "utilization": 50.0}]
        });
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { .. }));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let payload = json!([1, 2, 3]);
        let err = normalize(&host(), &payload, 0).unwrap_err();
        assert!(matches!(err, ParseError::NotObject));
    }
}
