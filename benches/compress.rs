/// Benchmarks for event compression.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use powder_reduction::operations;
use powder_reduction::types::{Dataset, Event, EventList, RunInfo, Units};

/// Focused events with d-spacings spread over [0.5, 3.0).
fn get_test_dataset(spectra: i32, events_per_spectrum: usize) -> Dataset {
    let spectra = (1..=spectra)
        .map(|spectrum_number| {
            let events = (0..events_per_spectrum)
                .map(|i| {
                    let d = 0.5 + 2.5 * ((i * 7919) % events_per_spectrum) as f64
                        / events_per_spectrum as f64;
                    Event::new(d, (i % 60) as i64 * 16_666_667)
                })
                .collect();
            EventList::new(spectrum_number, events)
        })
        .collect();
    Dataset::events("PG3_1", Units::DSpacing, spectra, RunInfo::new(1, 0))
}

fn criterion_benchmark(c: &mut Criterion) {
    for size_k in [16, 64, 256] {
        let dataset = get_test_dataset(4, size_k * 1024);
        for tolerance in [0.0, 0.001, 0.01] {
            let name = format!("compress({}, {})", size_k * 1024 * 4, tolerance);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    let mut dataset = dataset.clone();
                    operations::compress(black_box(&mut dataset), tolerance);
                })
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
