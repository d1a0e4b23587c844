//! Core capture engine: opens a pcap handle, works out the monitored host
//! addresses, installs the BPF filter and pumps packets into the pipeline.

use pcap::{Activated, Active, Capture, Device, Offline};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::CaptureConfig;
use crate::pipeline::OwnedPacket;

/// Errors from the capture engine.
#[derive(Debug)]
pub enum CaptureError {
    /// Failed to find a suitable network device.
    NoDevice(String),
    /// No IPv4 address to classify traffic against.
    NoHosts(String),
    /// pcap error.
    Pcap(pcap::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoDevice(msg) => write!(f, "no capture device: {}", msg),
            CaptureError::NoHosts(msg) => write!(f, "no host addresses: {}", msg),
            CaptureError::Pcap(e) => write!(f, "pcap error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

/// Why a capture loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// `running` was cleared.
    Stopped,
    /// Offline file fully read.
    EndOfFile,
}

enum Source {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

/// An open, filtered capture plus the host addresses it was built for.
pub struct OpenedCapture {
    source: Source,
    hosts: Vec<Ipv4Addr>,
    filter: String,
    label: String,
}

impl OpenedCapture {
    pub fn hosts(&self) -> &[Ipv4Addr] {
        &self.hosts
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Interface name or file path.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True when replaying a capture file rather than sniffing live.
    pub fn is_offline(&self) -> bool {
        matches!(self.source, Source::Offline(_))
    }

    /// Read packets until `running` clears, the file ends or the handle
    /// fails. Read timeouts just re-check `running`.
    pub fn pump<F>(&mut self, running: &AtomicBool, on_packet: F) -> Result<CaptureEnd, CaptureError>
    where
        F: FnMut(OwnedPacket),
    {
        match &mut self.source {
            Source::Live(cap) => pump(cap, running, on_packet),
            Source::Offline(cap) => pump(cap, running, on_packet),
        }
    }

    /// Log kernel-side counters for live captures.
    pub fn log_stats(&mut self) {
        if let Source::Live(cap) = &mut self.source {
            match cap.stats() {
                Ok(stat) => tracing::info!(
                    received = stat.received,
                    dropped = stat.dropped,
                    if_dropped = stat.if_dropped,
                    "capture statistics"
                ),
                Err(e) => tracing::debug!(error = %e, "capture statistics unavailable"),
            }
        }
    }
}

/// List all available network interfaces.
pub fn list_interfaces() -> Result<Vec<Device>, CaptureError> {
    Device::list().map_err(CaptureError::Pcap)
}

/// Open the capture described by `config`: an offline file when
/// `pcap_file` is set, otherwise a non-promiscuous live capture.
pub fn open(config: &CaptureConfig) -> Result<OpenedCapture, CaptureError> {
    let (source, mut hosts, label) = match &config.pcap_file {
        Some(path) => {
            let cap = Capture::from_file(path)?;
            (Source::Offline(cap), Vec::new(), path.display().to_string())
        }
        None => {
            let device = select_device(config.interface.as_deref())?;
            let label = device.name.clone();
            let hosts = device_ipv4_addrs(&device);
            let cap = Capture::from_device(device)?
                .promisc(false)
                .snaplen(config.snaplen)
                .timeout(config.timeout_ms)
                .open()?;
            (Source::Live(cap), hosts, label)
        }
    };

    for ip in &config.ips {
        if !hosts.contains(ip) {
            hosts.push(*ip);
        }
    }
    if hosts.is_empty() {
        return Err(CaptureError::NoHosts(format!(
            "{} has no IPv4 address and none were configured",
            label
        )));
    }

    let filter = build_filter(&config.filter, &hosts);
    let mut opened = OpenedCapture {
        source,
        hosts,
        filter,
        label,
    };
    match &mut opened.source {
        Source::Live(cap) => cap.filter(&opened.filter, true)?,
        Source::Offline(cap) => cap.filter(&opened.filter, true)?,
    }

    tracing::info!(
        source = %opened.label,
        hosts = ?opened.hosts,
        filter = %opened.filter,
        "capture started"
    );
    Ok(opened)
}

fn select_device(name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        Some(name) => Device::list()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| CaptureError::NoDevice(format!("interface '{}' not found", name))),
        None => Device::lookup()?
            .ok_or_else(|| CaptureError::NoDevice("no default device found".into())),
    }
}

fn device_ipv4_addrs(device: &Device) -> Vec<Ipv4Addr> {
    let mut hosts = Vec::new();
    for address in &device.addresses {
        match address.addr {
            IpAddr::V4(v4) => hosts.push(v4),
            IpAddr::V6(v6) => {
                tracing::info!(interface = %device.name, addr = %v6, "ignoring IPv6 address");
            }
        }
    }
    hosts
}

/// `<user> and not host 127.0.0.1 and (host a or host b ...)`.
pub fn build_filter(user: &str, hosts: &[Ipv4Addr]) -> String {
    let base = user.trim();
    let mut filter = if base.is_empty() {
        "tcp".to_string()
    } else {
        base.to_string()
    };
    filter.push_str(" and not host 127.0.0.1");
    if !hosts.is_empty() {
        let clause: Vec<String> = hosts.iter().map(|h| format!("host {}", h)).collect();
        filter.push_str(" and (");
        filter.push_str(&clause.join(" or "));
        filter.push(')');
    }
    filter
}

fn pump<T, F>(
    cap: &mut Capture<T>,
    running: &AtomicBool,
    mut on_packet: F,
) -> Result<CaptureEnd, CaptureError>
where
    T: Activated + ?Sized,
    F: FnMut(OwnedPacket),
{
    while running.load(Ordering::SeqCst) {
        match cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let captured_ns = (ts.tv_sec as u64)
                    .saturating_mul(1_000_000_000)
                    .saturating_add(ts.tv_usec as u64 * 1_000);
                on_packet(OwnedPacket {
                    captured_ns,
                    data: packet.data.to_vec(),
                });
            }
            Err(pcap::Error::TimeoutExpired) => {}
            Err(pcap::Error::NoMorePackets) => return Ok(CaptureEnd::EndOfFile),
            Err(e) => {
                tracing::error!(error = %e, "capture error");
                return Err(CaptureError::Pcap(e));
            }
        }
    }
    Ok(CaptureEnd::Stopped)
}
