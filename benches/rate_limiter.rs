use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use traffic_guard::core::local_store::LocalStore;
use traffic_guard::core::{EndpointClass, PatternSet, RateLimiter};
use traffic_guard::models::{ClassLimits, RateLimitConfig};

fn rate_limiter_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut config = RateLimitConfig::default();
    config.default = ClassLimits {
        per_minute: u32::MAX,
        per_hour: u32::MAX,
    };
    let limiter = RateLimiter::new(Arc::new(LocalStore::default()), config);

    c.bench_function("classify", |b| {
        b.iter(|| limiter.classify(black_box("/api/products/42")))
    });

    let mut n = 0u32;
    c.bench_function("rate_limiter_check", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            let identity = format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff);
            runtime.block_on(limiter.check_rate_limit(black_box(&identity), EndpointClass::Default))
        })
    });
}

fn pattern_benchmark(c: &mut Criterion) {
    let patterns = PatternSet::default();

    c.bench_function("patterns_clean_request", |b| {
        b.iter(|| patterns.is_suspicious_request(black_box("/api/products/42"), black_box("page=2&sort=price")))
    });
    c.bench_function("patterns_injection", |b| {
        b.iter(|| patterns.is_suspicious_request(black_box("/search"), black_box("q=1%27%20OR%20%271%27%3D%271")))
    });
}

criterion_group!(benches, rate_limiter_benchmark, pattern_benchmark);
criterion_main!(benches);
