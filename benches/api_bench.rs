//! Hot-path benchmarks: route resolution (C2) and filter chain
//! application (C3). Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_route_matching(c: &mut Criterion) {
    use gateway_core::route::{PathMatch, Route, RouteSnapshot};
    use http::Method;

    fn route(id: &str, host: &str, path: PathMatch, priority: i32) -> Route {
        Route {
            id: id.into(),
            host: host.into(),
            path,
            methods: vec![],
            priority,
            target_service: Some("svc".into()),
            target_upstream: None,
            filter_chain_id: None,
            security_config_id: None,
        }
        .compiled()
        .unwrap()
    }

    let mut routes = vec![
        route("catchall", "*", PathMatch::Prefix { value: "/".into() }, 100),
        route("wildcard", "*.example.com", PathMatch::Prefix { value: "/api".into() }, 50),
    ];
    for i in 0..200 {
        routes.push(route(
            &format!("svc-{i}"),
            &format!("svc{i}.example.com"),
            PathMatch::Prefix { value: format!("/svc{i}") },
            10,
        ));
    }
    routes.push(route("exact", "api.example.com", PathMatch::Exact { value: "/v1/users".into() }, 1));
    let snapshot = RouteSnapshot::new(routes);

    let mut group = c.benchmark_group("route_matching");
    group.throughput(Throughput::Elements(1));

    group.bench_function("exact_host_exact_path", |b| {
        b.iter(|| black_box(snapshot.resolve(black_box("api.example.com"), black_box("/v1/users"), &Method::GET)))
    });

    group.bench_function("wildcard_host_prefix_path", |b| {
        b.iter(|| black_box(snapshot.resolve(black_box("foo.example.com"), black_box("/api/widgets"), &Method::GET)))
    });

    group.bench_function("no_match", |b| {
        b.iter(|| black_box(snapshot.resolve(black_box("unknown.example.com"), black_box("/nowhere"), &Method::GET)))
    });

    group.finish();
}

fn bench_filter_chain(c: &mut Criterion) {
    use gateway_core::context::Context;
    use gateway_core::filter::{Filter, FilterAction, FilterChain, FilterKind, OnError};

    let filters: Vec<Filter> = (0..50)
        .map(|i| Filter {
            id: format!("f{i}"),
            kind: FilterKind::Request,
            order: i,
            enabled: true,
            action: FilterAction::AddHeader { name: format!("x-filter-{i}"), value: "applied".into() },
            condition: None,
            on_error: OnError::WarnContinue,
            chain_id: None,
        })
        .collect();
    let chain = FilterChain::new(filters);

    let mut group = c.benchmark_group("filter_chain");
    group.throughput(Throughput::Elements(1));

    group.bench_function("apply_pre_50_filters", |b| {
        b.iter(|| {
            let mut ctx = Context::new(
                "127.0.0.1:1234".parse().unwrap(),
                http::Method::GET,
                "api.example.com".into(),
                "/v1/users".into(),
                String::new(),
                http::HeaderMap::new(),
            );
            black_box(chain.apply_pre(&mut ctx).unwrap());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_route_matching, bench_filter_chain);
criterion_main!(benches);
