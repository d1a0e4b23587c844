//! Process memory pressure from procfs.

use std::fs;
use std::io;

const STATM: &str = "/proc/self/statm";
const MEMINFO: &str = "/proc/meminfo";
const PAGE_SIZE: u64 = 4096;

/// Resident set size over physical memory, in `[0, 1]`.
pub fn usage_fraction() -> io::Result<f64> {
    let rss = resident_bytes(&fs::read_to_string(STATM)?)?;
    let total = mem_total_bytes(&fs::read_to_string(MEMINFO)?)?;
    if total == 0 {
        return Err(invalid("MemTotal is zero"));
    }
    Ok(rss as f64 / total as f64)
}

/// Second field of `statm` is resident pages.
fn resident_bytes(statm: &str) -> io::Result<u64> {
    let pages = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| invalid("malformed statm"))?;
    Ok(pages * PAGE_SIZE)
}

fn mem_total_bytes(meminfo: &str) -> io::Result<u64> {
    meminfo
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some(kb * 1024)
        })
        .ok_or_else(|| invalid("MemTotal not found"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statm() {
        assert_eq!(resident_bytes("5000 250 100 10 0 300 0\n").unwrap(), 250 * 4096);
        assert!(resident_bytes("").is_err());
    }

    #[test]
    fn parses_meminfo() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1234567 kB\n";
        assert_eq!(mem_total_bytes(meminfo).unwrap(), 16318480 * 1024);
        assert!(mem_total_bytes("MemFree: 1 kB\n").is_err());
    }
}
