//! Translation of structured limit requests into cgroup interface tokens

use jobd_core::{JobError, Result};
use nix::sys::stat::{major, minor, stat};

/// Fixed CPU quota period, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

const IO_RATE_LOW: &str = "1048576";
const IO_RATE_MED: &str = "10485760";

/// One `(interface file, value)` pair destined for a job cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub key: String,
    pub value: String,
}

impl Limit {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Limit request as it arrives from a start call. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    /// CPU quota: `"500m"` (millicores), `"2"` (whole cores), or `"max"`.
    pub cpu: Option<String>,
    /// Memory ceiling: bytes, `"<n>M"`, or `"max"`.
    pub memory: Option<String>,
    /// I/O bandwidth class: `"low"`, `"med"`, or `"high"`.
    pub io_class: Option<String>,
}

/// Translate a request into the exact tokens the cgroup interface files
/// accept, in cpu/memory/io order. The io limit targets the device backing
/// the root filesystem.
pub fn translate(req: &ResourceRequest) -> Result<Vec<Limit>> {
    translate_for_device(req, root_device()?)
}

fn translate_for_device(req: &ResourceRequest, dev: (u64, u64)) -> Result<Vec<Limit>> {
    let mut out = Vec::new();
    if let Some(cpu) = &req.cpu {
        out.push(Limit::new("cpu.max", cpu_max_value(cpu)?));
    }
    if let Some(memory) = &req.memory {
        out.push(Limit::new("memory.max", memory_max_value(memory)?));
    }
    if let Some(class) = &req.io_class {
        out.push(Limit::new("io.max", io_max_value(class, dev)?));
    }
    Ok(out)
}

/// `major:minor` of the device backing `/`.
fn root_device() -> Result<(u64, u64)> {
    let st = stat("/").map_err(|e| JobError::Cgroup(format!("stat /: {}", e)))?;
    Ok((major(st.st_dev), minor(st.st_dev)))
}

fn cpu_max_value(spec: &str) -> Result<String> {
    let spec = spec.trim();
    if spec == "max" {
        return Ok(format!("max {}", CPU_PERIOD_US));
    }
    if let Some(milli) = spec.strip_suffix('m') {
        let n: u64 = milli
            .parse()
            .map_err(|_| JobError::InvalidArgument(format!("invalid cpu limit: {}", spec)))?;
        return Ok(format!("{} {}", n * 100, CPU_PERIOD_US));
    }
    let cores: u64 = spec
        .parse()
        .map_err(|_| JobError::InvalidArgument(format!("invalid cpu limit: {}", spec)))?;
    Ok(format!("{} {}", cores * CPU_PERIOD_US, CPU_PERIOD_US))
}

fn memory_max_value(spec: &str) -> Result<String> {
    let spec = spec.trim();
    if spec == "max" {
        return Ok("max".to_string());
    }
    if let Some(mebi) = spec.strip_suffix('M') {
        let n: u64 = mebi
            .parse()
            .map_err(|_| JobError::InvalidArgument(format!("invalid memory limit: {}", spec)))?;
        let bytes = n.checked_mul(1048576).ok_or_else(|| {
            JobError::InvalidArgument(format!("memory limit overflow: {}", spec))
        })?;
        return Ok(bytes.to_string());
    }
    let bytes: u64 = spec
        .parse()
        .map_err(|_| JobError::InvalidArgument(format!("invalid memory limit: {}", spec)))?;
    Ok(bytes.to_string())
}

fn io_max_value(class: &str, (maj, min): (u64, u64)) -> Result<String> {
    let rate = match class.trim() {
        "low" => IO_RATE_LOW,
        "med" => IO_RATE_MED,
        "high" => "max",
        other => {
            return Err(JobError::InvalidArgument(format!(
                "invalid io class: {}",
                other
            )));
        }
    };
    Ok(format!("{}:{} rbps={} wbps={}", maj, min, rate, rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: (u64, u64) = (8, 1);

    fn request(cpu: Option<&str>, memory: Option<&str>, io_class: Option<&str>) -> ResourceRequest {
        ResourceRequest {
            cpu: cpu.map(str::to_string),
            memory: memory.map(str::to_string),
            io_class: io_class.map(str::to_string),
        }
    }

    #[test]
    fn empty_request_translates_to_no_limits() {
        let limits = translate_for_device(&ResourceRequest::default(), DEV).unwrap();
        assert!(limits.is_empty());
    }

    #[test]
    fn cpu_millicores() {
        let limits = translate_for_device(&request(Some("500m"), None, None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("cpu.max", "50000 100000")]);
    }

    #[test]
    fn cpu_whole_cores() {
        let limits = translate_for_device(&request(Some("2"), None, None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("cpu.max", "200000 100000")]);
    }

    #[test]
    fn cpu_unlimited() {
        let limits = translate_for_device(&request(Some("max"), None, None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("cpu.max", "max 100000")]);
    }

    #[test]
    fn cpu_garbage_is_rejected() {
        assert!(translate_for_device(&request(Some("lots"), None, None), DEV).is_err());
        assert!(translate_for_device(&request(Some("1.5"), None, None), DEV).is_err());
    }

    #[test]
    fn memory_mebibytes() {
        let limits = translate_for_device(&request(None, Some("100M"), None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("memory.max", "104857600")]);
    }

    #[test]
    fn memory_raw_bytes() {
        let limits = translate_for_device(&request(None, Some("1048576"), None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("memory.max", "1048576")]);
    }

    #[test]
    fn memory_unlimited() {
        let limits = translate_for_device(&request(None, Some("max"), None), DEV).unwrap();
        assert_eq!(limits, vec![Limit::new("memory.max", "max")]);
    }

    #[test]
    fn memory_garbage_is_rejected() {
        assert!(translate_for_device(&request(None, Some("plenty"), None), DEV).is_err());
    }

    #[test]
    fn io_classes() {
        let low = translate_for_device(&request(None, None, Some("low")), DEV).unwrap();
        assert_eq!(
            low,
            vec![Limit::new("io.max", "8:1 rbps=1048576 wbps=1048576")]
        );

        let med = translate_for_device(&request(None, None, Some("med")), DEV).unwrap();
        assert_eq!(
            med,
            vec![Limit::new("io.max", "8:1 rbps=10485760 wbps=10485760")]
        );

        let high = translate_for_device(&request(None, None, Some("high")), DEV).unwrap();
        assert_eq!(high, vec![Limit::new("io.max", "8:1 rbps=max wbps=max")]);
    }

    #[test]
    fn io_unknown_class_is_rejected() {
        assert!(translate_for_device(&request(None, None, Some("turbo")), DEV).is_err());
    }

    #[test]
    fn limits_keep_cpu_memory_io_order() {
        let limits =
            translate_for_device(&request(Some("1"), Some("max"), Some("high")), DEV).unwrap();
        let keys: Vec<&str> = limits.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["cpu.max", "memory.max", "io.max"]);
    }

    #[test]
    fn translate_uses_root_device() {
        // Only checks shape; the device numbers depend on the host.
        let limits = translate(&request(None, None, Some("high"))).unwrap();
        assert_eq!(limits.len(), 1);
        let value = &limits[0].value;
        assert!(value.contains(':'));
        assert!(value.ends_with("rbps=max wbps=max"));
    }
}
