//! Console output for the CLI: the per-flow summary printed on exit and
//! the pipeline counters.

use crate::analysis::SmoothingMode;
use crate::flow::record::FlowSnapshot;
use crate::pipeline::StatsSnapshot;

const RULE_WIDTH: usize = 96;

/// Render one line per flow that ever produced a sample, sorted by key.
pub fn format_flow_summary(flows: &[FlowSnapshot], smoothing: SmoothingMode) -> String {
    let mut sampled: Vec<&FlowSnapshot> = flows.iter().filter(|f| f.total_samples > 0).collect();
    sampled.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out = String::new();
    out.push_str(&format!(
        "{:<44} {:>8} {:>10} {:>10} {:>10} {:>8}\n",
        "Flow", "State", "SRTT ms", "Jitter ms", "Last ms", "Samples"
    ));
    out.push_str(&"-".repeat(RULE_WIDTH));
    out.push('\n');
    for flow in &sampled {
        out.push_str(&format!(
            "{:<44} {:>8} {:>10.3} {:>10.3} {:>10.3} {:>8}\n",
            flow.key,
            flow.lifecycle.to_string(),
            smoothing.to_millis(flow.srtt_ns),
            smoothing.to_millis(flow.jitter_ns),
            smoothing.to_millis(flow.last_rtt_ns as f64),
            flow.total_samples,
        ));
    }
    if sampled.is_empty() {
        out.push_str("  (no RTT samples collected)\n");
    }
    out
}

pub fn print_flow_summary(flows: &[FlowSnapshot], smoothing: SmoothingMode) {
    println!();
    print!("{}", format_flow_summary(flows, smoothing));
}

pub fn print_capture_summary(stats: &StatsSnapshot, active_flows: usize) {
    println!("{}", "=".repeat(50));
    println!("Capture complete.");
    println!("  Packets captured:  {}", stats.captured);
    println!("  Packets dropped:   {}", stats.dropped);
    println!("  Decode errors:     {}", stats.decode_errors);
    println!("  TCP segments:      {}", stats.segments);
    println!("  Flows seen:        {}", stats.flows_created);
    println!("  Flows active:      {}", active_flows);
    println!("  RTT samples:       {}", stats.samples);
    if stats.clock_anomalies > 0 {
        println!("  Clock anomalies:   {}", stats.clock_anomalies);
    }
    println!("{}", "=".repeat(50));
}
