use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use dyadsync_core::{FieldValue, TrialData, resolve_marker_template};
use dyadsync_experiment::{Constraint, RandomizationConfig, RandomizationMethod, TrialList};

fn trial_list(n: usize) -> TrialList {
    let emotions = ["happy", "sad", "angry", "neutral"];
    TrialList::from_rows((0..n).map(|i| {
        let mut row = TrialData::new();
        row.insert("video1".into(), format!("p1_{i}.mp4").into());
        row.insert("video2".into(), format!("p2_{i}.mp4").into());
        row.insert("emotion".into(), emotions[i % emotions.len()].into());
        row
    }))
}

/// Constrained shuffles at increasing list lengths, fixed seed.
pub fn bench_constrained(c: &mut Criterion) {
    let mut group = c.benchmark_group("constrained_shuffle");
    group
        .sample_size(50)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));

    for n in [16usize, 64, 256] {
        let list = trial_list(n);
        let config = RandomizationConfig::new(RandomizationMethod::Constrained, Some(42))
            .with_constraint(Constraint::MaxConsecutive {
                attribute: "emotion".into(),
                value: None,
                limit: 2,
            })
            .with_constraint(Constraint::NoRepeat {
                attribute: "video1".into(),
                within: 3,
            });
        group.bench_with_input(BenchmarkId::from_parameter(n), &list, |b, list| {
            b.iter(|| black_box(list.get_trials(black_box(&config))));
        });
    }
    group.finish();
}

pub fn bench_templates(c: &mut Criterion) {
    let mut group = c.benchmark_group("marker_template");
    let mut data = TrialData::new();
    data.insert("trial_index".into(), FieldValue::Int(12));
    data.insert("emotion".into(), "happy".into());

    group.bench_function("integer_with_response", |b| {
        b.iter(|| resolve_marker_template(black_box("300#0$"), &data, Some(7)))
    });
    group.bench_function("string_variable", |b| {
        b.iter(|| resolve_marker_template(black_box("{emotion}_start"), &data, None))
    });
    group.bench_function("render_full_list", |b| {
        b.iter_batched(
            || trial_list(64),
            |list| {
                for trial in list.trials() {
                    let _ = resolve_marker_template("100#", &trial.fields, None);
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_constrained, bench_templates);
criterion_main!(benches);
