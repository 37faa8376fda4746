use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use feclink::packet::{
    frame_info_symbol, frame_redundancy_symbol, parse_packet, PacketHeader, WIRE_VERSION,
};

fn header(symbol_id: u16, t: u16) -> PacketHeader {
    PacketHeader {
        version: WIRE_VERSION,
        ext_count: 0,
        flags: 0,
        engine_id: 1,
        matrix_id: 77,
        symbol_id,
        info_segments_added: 16,
        k: 16,
        n: 24,
        t,
    }
}

fn bench_framing(c: &mut Criterion) {
    for t in [64u16, 512, 1400] {
        let mut row = vec![0u8; t as usize];
        row[..2].copy_from_slice(&(t - 2).to_be_bytes());
        for byte in row[2..].iter_mut() {
            *byte = 0xab;
        }

        c.bench_with_input(BenchmarkId::new("frame_info", t), &row, |b, row| {
            let h = header(3, t);
            b.iter(|| frame_info_symbol(&h, row).unwrap());
        });

        let datagram = frame_info_symbol(&header(3, t), &row).unwrap();
        c.bench_with_input(BenchmarkId::new("parse", t), &datagram, |b, datagram| {
            b.iter(|| parse_packet(datagram).unwrap());
        });

        // Parity rows are typically dense up front with a zero tail.
        let mut parity = vec![0xcdu8; t as usize];
        for byte in parity[t as usize / 2..].iter_mut() {
            *byte = 0;
        }
        c.bench_with_input(
            BenchmarkId::new("frame_redundancy", t),
            &parity,
            |b, row| {
                let h = header(20, t);
                b.iter(|| frame_redundancy_symbol(&h, row).unwrap());
            },
        );
    }
}

criterion_group!(framing_benches, bench_framing);
criterion_main!(framing_benches);
