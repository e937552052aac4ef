use criterion::{Criterion, criterion_group, criterion_main};
use order_model::{decode, encode};

fn payload(line_items: usize) -> String {
    let items: Vec<String> = (0..line_items)
        .map(|i| format!(r#"{{"productId":"SKU-{i}","quantity":{},"unitPriceCents":{}}}"#, i + 1, 100 * i))
        .collect();
    format!(
        r#"{{"createdAt":"2023-05-01T10:00:00+02:00","customerId":42,"sellerId":7,"lineItems":[{}]}}"#,
        items.join(",")
    )
}

fn bench_decode_small(c: &mut Criterion) {
    let body = payload(2);
    c.bench_function("decode/two_line_items", |b| {
        b.iter(|| decode(&body).unwrap());
    });
}

fn bench_decode_large(c: &mut Criterion) {
    let body = payload(200);
    c.bench_function("decode/two_hundred_line_items", |b| {
        b.iter(|| decode(&body).unwrap());
    });
}

fn bench_encode(c: &mut Criterion) {
    let doc = decode(&payload(20)).unwrap();
    c.bench_function("encode/twenty_line_items", |b| {
        b.iter(|| encode(&doc).unwrap());
    });
}

criterion_group!(benches, bench_decode_small, bench_decode_large, bench_encode);
criterion_main!(benches);
