//! Hot-path benchmark: line rasterisation feeding the run grouper, the
//! per-pixel work behind every cut command.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use core_plot::{PulseModulator, group_plots, plot_line};

fn bench_line_group(c: &mut Criterion) {
    c.bench_function("plot_line_10k", |b| {
        b.iter(|| plot_line(black_box(0), black_box(0), black_box(10_000), black_box(3_333)).count())
    });

    c.bench_function("group_modulated_line_10k", |b| {
        b.iter(|| {
            let line = plot_line(0, 0, black_box(10_000), black_box(3_333));
            group_plots(0, 0, line, PulseModulator::new(500.0)).count()
        })
    });
}

criterion_group!(benches, bench_line_group);
criterion_main!(benches);
