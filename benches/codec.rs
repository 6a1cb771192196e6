use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dictpipe::{CommandEncoder, QuotingEncoder, ResponseParser, TokenParser};

fn encode(c: &mut Criterion) {
    let encoder = QuotingEncoder::new(1024);
    let args: Vec<String> = ["MATCH", "*", "prefix", "new york city"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    c.bench_function("encode match", |b| {
        b.iter(|| encoder.encode(black_box(&args)).unwrap())
    });
}

fn parse(c: &mut Criterion) {
    let line = r#"151 "hello" wn "WordNet (r) 3.0 (2006)""#;

    c.bench_function("parse definition header", |b| {
        b.iter(|| TokenParser.parse(black_box(line)).unwrap())
    });
}

criterion_group!(benches, encode, parse);
criterion_main!(benches);
