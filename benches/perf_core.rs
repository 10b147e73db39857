use criterion::{black_box, criterion_group, criterion_main, Criterion};
use editflow::index::{self, Language};
use editflow::patch::{self, Edit, FileSet};

fn synthetic_module(function_count: usize) -> String {
    let mut source = String::with_capacity(function_count * 64);
    for i in 0..function_count {
        source.push_str(&format!(
            "export function handler_{i:04}(input) {{\n  const value = input * {i};\n  return value + 1;\n}}\n\n"
        ));
    }
    source
}

fn bench_extract(c: &mut Criterion) {
    let source = synthetic_module(2_000);
    c.bench_function("extract_js_2000_functions", |b| {
        b.iter(|| {
            let declarations = index::extract(black_box(&source), Language::JavaScript).unwrap();
            black_box(declarations.len());
        })
    });
}

fn bench_verify(c: &mut Criterion) {
    let source = synthetic_module(2_000);
    c.bench_function("verify_js_2000_functions", |b| {
        b.iter(|| black_box(index::verify(black_box(&source), Language::JavaScript).unwrap().ok))
    });
}

fn bench_apply_many_edits(c: &mut Criterion) {
    let source = synthetic_module(2_000);
    let files: FileSet = [("src/handlers.js".to_string(), source)].into();
    // One replacement per function body line, spread across the file.
    let edits: Vec<Edit> = (0..2_000)
        .map(|i| Edit::Replace {
            path: "src/handlers.js".to_string(),
            start_line: i * 5 + 2,
            end_line: i * 5 + 2,
            content: format!("  const value = input * {};", i + 1),
        })
        .collect();
    c.bench_function("apply_2000_replacements", |b| {
        b.iter(|| {
            let outcome = patch::apply(black_box(&files), "bench", black_box(&edits));
            black_box(outcome.touched.len());
        })
    });
}

criterion_group!(perf_core, bench_extract, bench_verify, bench_apply_many_edits);
criterion_main!(perf_core);
