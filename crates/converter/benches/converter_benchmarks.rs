use std::collections::HashMap;
use std::sync::OnceLock;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use refsync_converter::{
    ColumnDescriptor, ColumnPlan, DeclaredType, Record, RecordSchema, TabularResponse, convert,
};

#[derive(Debug, Default, Clone)]
struct BenchRow {
    sec_id: String,
    short_name: String,
    is_traded: Option<bool>,
    emitent_id: Option<i32>,
}

impl Record for BenchRow {
    fn schema() -> &'static RecordSchema<Self> {
        static SCHEMA: OnceLock<RecordSchema<BenchRow>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            RecordSchema::<BenchRow>::new("BenchRow")
                .text("secid", |r, v| r.sec_id = v)
                .text("shortname", |r, v| r.short_name = v)
                .flag("is_traded", |r, v| r.is_traded = v)
                .int32("emitent_id", |r, v| r.emitent_id = v)
        })
    }
}

fn build_response(rows: usize) -> TabularResponse {
    let columns = [
        ("secid", "string"),
        ("shortname", "string"),
        ("is_traded", "int32"),
        ("emitent_id", "int32"),
    ];
    let metadata: HashMap<String, ColumnDescriptor> = columns
        .iter()
        .map(|(n, t)| {
            (
                n.to_string(),
                ColumnDescriptor {
                    declared_type: DeclaredType::from(*t),
                },
            )
        })
        .collect();

    TabularResponse {
        columns: columns.iter().map(|(n, _)| n.to_string()).collect(),
        column_metadata: metadata,
        rows: (0..rows)
            .map(|i| vec![json!(format!("SEC{i}")), json!(null), json!(i % 2), json!(i as i32)])
            .collect(),
    }
}

fn bench_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert");
    for rows in [100usize, 1_000, 10_000] {
        let response = build_response(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &response, |b, resp| {
            b.iter(|| {
                let out: Vec<BenchRow> = convert(black_box(resp)).expect("convert");
                black_box(out)
            })
        });
    }
    group.finish();
}

fn bench_plan_resolution(c: &mut Criterion) {
    let response = build_response(0);
    c.bench_function("column_plan_resolve", |b| {
        b.iter(|| ColumnPlan::<BenchRow>::resolve(BenchRow::schema(), black_box(&response)))
    });
}

criterion_group!(benches, bench_convert, bench_plan_resolution);
criterion_main!(benches);
