//! Resource-quantity string parsing, generalized from the Kubernetes resource
//! quantity suffixes (`m`, `k`/`Ki`, `M`/`Mi`, `G`/`Gi`).

/// Parse a CPU quantity (`"250m"`, `"2"`) into millicores.
pub fn parse_cpu_millis(cpu_str: &str) -> u64 {
    let cpu_str = cpu_str.trim();
    if cpu_str.is_empty() {
        return 0;
    }
    if let Some(m) = cpu_str.strip_suffix('m') {
        m.parse::<u64>().unwrap_or(0)
    } else {
        (cpu_str.parse::<f64>().unwrap_or(0.0) * 1000.0) as u64
    }
}

/// Parse a memory quantity (`"8Gi"`, `"512Mi"`, `"1000000"`) into bytes.
pub fn parse_memory_bytes(memory_str: &str) -> u64 {
    let memory_str = memory_str.trim().to_lowercase();
    if memory_str.is_empty() {
        return 0;
    }
    const KI: u64 = 1024;
    const MI: u64 = KI * 1024;
    const GI: u64 = MI * 1024;
    const TI: u64 = GI * 1024;
    if let Some(v) = memory_str.strip_suffix("ki") {
        v.parse::<u64>().unwrap_or(0) * KI
    } else if let Some(v) = memory_str.strip_suffix("mi") {
        v.parse::<u64>().unwrap_or(0) * MI
    } else if let Some(v) = memory_str.strip_suffix("gi") {
        v.parse::<u64>().unwrap_or(0) * GI
    } else if let Some(v) = memory_str.strip_suffix("ti") {
        v.parse::<u64>().unwrap_or(0) * TI
    } else if let Some(v) = memory_str.strip_suffix('k') {
        v.parse::<u64>().unwrap_or(0) * 1_000
    } else if let Some(v) = memory_str.strip_suffix('m') {
        v.parse::<u64>().unwrap_or(0) * 1_000_000
    } else if let Some(v) = memory_str.strip_suffix('g') {
        v.parse::<u64>().unwrap_or(0) * 1_000_000_000
    } else if let Some(v) = memory_str.strip_suffix('t') {
        v.parse::<u64>().unwrap_or(0) * 1_000_000_000_000
    } else {
        memory_str.parse::<u64>().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millis() {
        assert_eq!(parse_cpu_millis("250m"), 250);
        assert_eq!(parse_cpu_millis("2"), 2000);
        assert_eq!(parse_cpu_millis(""), 0);
        assert_eq!(parse_cpu_millis("0.5"), 500);
    }

    #[test]
    fn memory_bytes() {
        assert_eq!(parse_memory_bytes("8Gi"), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("512Mi"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("80Gi"), 80u64 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1000000"), 1_000_000);
        assert_eq!(parse_memory_bytes("16Gi"), 16u64 * 1024 * 1024 * 1024);
    }
}
