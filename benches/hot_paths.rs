use criterion::{black_box, criterion_group, criterion_main, Criterion};

use appstats::rollup::{
    build, collapse, normalize_dimension, reaggregate, window_start, DailyCounts, Dimension,
    Granularity,
};
use chrono::{Days, NaiveDate};

const WINDOW_DAYS: u32 = 366;

const PLATFORMS: [&str; 9] = [
    "iOS", "android", "Web", "windows", "macOS", "linux", "HarmonyOS", "symbian", "",
];

fn build_counts() -> (NaiveDate, DailyCounts) {
    let today = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default();
    let start = window_start(today, WINDOW_DAYS).unwrap_or(today);
    let mut counts = DailyCounts::default();

    for offset in 0..u64::from(WINDOW_DAYS) {
        let Some(day) = start.checked_add_days(Days::new(offset)) else {
            break;
        };

        counts.new_users.insert(day, offset % 17);
        counts.active_users.insert(day, 1_000 + offset);

        let platforms = counts.platform_active.entry(day).or_default();
        for (i, platform) in PLATFORMS.iter().enumerate() {
            platforms.insert((*platform).to_string(), 10 * i as u64 + offset % 5);
        }

        let regions = counts.region_active.entry(day).or_default();
        for region in 0..40u64 {
            regions.insert(format!("region-{region}"), region * 3 + offset % 7);
        }
    }

    (start, counts)
}

fn bench_build(c: &mut Criterion) {
    let (start, counts) = build_counts();

    c.bench_function("daily_build_366d", |b| {
        b.iter(|| {
            let records = build(black_box(start), WINDOW_DAYS, black_box(&counts));
            black_box(records)
        })
    });
}

fn bench_reaggregate(c: &mut Criterion) {
    let (start, counts) = build_counts();
    let Ok(daily) = build(start, WINDOW_DAYS, &counts) else {
        return;
    };

    c.bench_function("reaggregate_week_366d", |b| {
        b.iter(|| black_box(reaggregate(black_box(&daily), Granularity::Week)))
    });

    c.bench_function("reaggregate_month_366d", |b| {
        b.iter(|| black_box(reaggregate(black_box(&daily), Granularity::Month)))
    });
}

fn bench_collapse(c: &mut Criterion) {
    let categories: Vec<(String, u64)> = (0..500u64)
        .map(|i| (format!("region-{i}"), (i * 7_919) % 1_000))
        .collect();

    c.bench_function("collapse_top5_of_500", |b| {
        b.iter(|| {
            let entries = collapse(black_box(categories.iter().cloned()), 5);
            black_box(entries)
        })
    });
}

fn bench_normalize(c: &mut Criterion) {
    c.bench_function("normalize_platform", |b| {
        b.iter(|| {
            for platform in PLATFORMS {
                black_box(normalize_dimension(Dimension::Platform, black_box(platform)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_build,
    bench_reaggregate,
    bench_collapse,
    bench_normalize
);
criterion_main!(benches);
