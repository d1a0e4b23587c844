//! Criterion benchmarks for the tcprtt hot path:
//! - `protocol::parse_packet` + `TcpSegment::from_packet` (decode)
//! - `Dispatcher::dispatch` (flow lookup, timer arm, correlation)
//! - `pipeline::router::shard_for_packet` (shard routing)

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tcprtt::flow::{FlowTable, HostSet, TimerService};
use tcprtt::pipeline::{DispatchConfig, Dispatcher};
use tcprtt::protocol::{parse_packet, TcpSegment};

const LOCAL: [u8; 4] = [10, 0, 0, 1];
const REMOTE: [u8; 4] = [10, 0, 0, 2];

/// Ethernet + IPv4 + TCP with the timestamp option (NOP, NOP, TS).
fn make_ts_packet(
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    seq: u32,
    ack: u32,
    ts: (u32, u32),
    payload_len: usize,
) -> Vec<u8> {
    let tcp_len = 32;
    let ip_total = 20 + tcp_len + payload_len;
    let mut pkt = vec![0u8; 14 + ip_total];

    // Ethernet header
    pkt[0..6].copy_from_slice(&[0xff; 6]);
    pkt[6..12].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    pkt[12] = 0x08;
    pkt[13] = 0x00;

    // IPv4 header
    let ip = &mut pkt[14..34];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(ip_total as u16).to_be_bytes());
    ip[6] = 0x40; // DF
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&src.0);
    ip[16..20].copy_from_slice(&dst.0);

    // TCP header
    let tcp = &mut pkt[34..34 + tcp_len];
    tcp[0..2].copy_from_slice(&src.1.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.1.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((tcp_len / 4) as u8) << 4;
    tcp[13] = 0x18; // PSH|ACK
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    tcp[20..24].copy_from_slice(&[1, 1, 8, 10]);
    tcp[24..28].copy_from_slice(&ts.0.to_be_bytes());
    tcp[28..32].copy_from_slice(&ts.1.to_be_bytes());

    for (i, byte) in pkt[14 + 20 + tcp_len..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
    pkt
}

fn segment(pkt: &[u8], captured_ns: u64) -> TcpSegment {
    let parsed = parse_packet(pkt).expect("bench frame parses");
    TcpSegment::from_packet(&parsed, captured_ns).expect("bench frame is TCP")
}

fn bench_decode(c: &mut Criterion) {
    let pure_ack = make_ts_packet((REMOTE, 443), (LOCAL, 40000), 1, 1000, (7, 100), 0);
    let data = make_ts_packet((LOCAL, 40000), (REMOTE, 443), 1000, 1, (100, 7), 1400);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ts_ack_66B", |b| {
        b.iter(|| {
            let parsed = parse_packet(black_box(&pure_ack)).ok();
            parsed.and_then(|p| TcpSegment::from_packet(&p, 0))
        })
    });

    group.bench_function("ts_data_1466B", |b| {
        b.iter(|| {
            let parsed = parse_packet(black_box(&data)).ok();
            parsed.and_then(|p| TcpSegment::from_packet(&p, 0))
        })
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let running = Arc::new(AtomicBool::new(true));
    let table = Arc::new(FlowTable::new());
    let mut timers =
        TimerService::spawn(table.expiry_sender(), running.clone()).expect("timer thread");
    let dispatcher = Dispatcher::new(
        Arc::clone(&table),
        Arc::new(HostSet::new([Ipv4Addr::from(LOCAL)])),
        timers.handle(),
        DispatchConfig {
            idle_ttl: Some(Duration::from_secs(45)),
            exp_ttl: Some(Duration::from_secs(5)),
            max_pending: 4096,
        },
    );

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(2));

    group.bench_function("data_then_ack", |b| {
        let mut n: u32 = 0;
        b.iter(|| {
            n = n.wrapping_add(1);
            let out = make_ts_packet((LOCAL, 40000), (REMOTE, 443), n, 1, (n, 7), 100);
            let back = make_ts_packet((REMOTE, 443), (LOCAL, 40000), 1, n, (7, n), 0);
            let sent = u64::from(n) * 1_000_000;
            dispatcher.dispatch(black_box(&segment(&out, sent)));
            dispatcher.dispatch(black_box(&segment(&back, sent + 250_000)))
        })
    });

    group.finish();
    running.store(false, Ordering::SeqCst);
    timers.shutdown();
}

fn bench_shard_routing(c: &mut Criterion) {
    let pkt = make_ts_packet((LOCAL, 40000), (REMOTE, 443), 1000, 1, (100, 7), 100);

    let mut group = c.benchmark_group("shard_routing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("shard_for_packet_4", |b| {
        b.iter(|| tcprtt::pipeline::router::shard_for_packet(black_box(&pkt), 4))
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_dispatch, bench_shard_routing);
criterion_main!(benches);
