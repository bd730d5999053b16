//! End-to-end tests: discovery, aggregation and context enrichment together

use sibscope::aggregator::aggregate;
use sibscope::config::{AnalysisConfig, LookupStrategy};
use sibscope::context::{ContextEnricher, MetricSource, Tier};
use sibscope::dependencies::context_specific_dependencies;
use sibscope::record::{CallRateSample, CallRecord, SystemLoadSample};
use sibscope::sibling::discover;

fn call(trace: &str, rpc: &str, um: &str, dm: &str, ts: i64, rt: f64) -> CallRecord {
    CallRecord::new(trace, rpc, um, dm, ts, rt)
}

fn config() -> AnalysisConfig {
    AnalysisConfig {
        workers: 2,
        ..AnalysisConfig::default()
    }
}

#[test]
fn test_two_x_calls_one_y_call() {
    // X at [0,5) and [20,25), Y at [2,7): one overlap, one "Y then X"
    let records = vec![
        call("t1", "0.1", "UM", "X", 0, 5.0),
        call("t1", "0.2", "UM", "Y", 2, 5.0),
        call("t1", "0.3", "UM", "X", 20, 5.0),
    ];
    let discovery = discover(&records);
    assert_eq!(discovery.pairs.len(), 1);

    let result = aggregate(&records, &discovery.pair_list(), &config(), None).unwrap();
    assert_eq!(result.records.len(), 1);

    let record = &result.records[0];
    assert_eq!(record.pair.first, "X");
    assert_eq!(record.pair.second, "Y");
    assert_eq!(record.total_observations, 2);
    assert!((record.p_concurrent - 0.5).abs() < 1e-12);
    assert!((record.p_second_then_first - 0.5).abs() < 1e-12);
    assert_eq!(record.p_first_then_second, 0.0);
}

#[test]
fn test_sequential_pipeline_across_traces() {
    let mut records = Vec::new();
    for t in 0..10 {
        let trace = format!("t{}", t);
        let base = t * 1000;
        records.push(call(&trace, "0.1", "UM", "auth", base, 10.0));
        records.push(call(&trace, "0.2", "UM", "db", base + 10, 10.0));
    }
    let discovery = discover(&records);
    let result = aggregate(&records, &discovery.pair_list(), &config(), None).unwrap();

    let record = &result.records[0];
    assert_eq!(record.pair.first, "auth");
    assert_eq!(record.total_observations, 10);
    assert_eq!(record.first_then_second_count, 10);
    assert_eq!(record.p_first_then_second, 1.0);
}

#[test]
fn test_replay_uses_all_calls_of_the_trace() {
    // A/B are siblings under "0"; another A/B call pair exists under "0.5"
    // in the same trace and is replayed for both pairs.
    let records = vec![
        call("t1", "0.1", "UM", "A", 0, 5.0),
        call("t1", "0.2", "UM", "B", 10, 5.0),
        call("t1", "0.5.1", "C", "A", 100, 5.0),
        call("t1", "0.5.2", "C", "B", 100, 5.0),
    ];
    let discovery = discover(&records);
    assert_eq!(discovery.pairs.len(), 2);

    let result = aggregate(&records, &discovery.pair_list(), &config(), None).unwrap();
    for record in &result.records {
        assert_eq!(record.total_observations, 4);
    }
}

#[test]
fn test_context_tiers_end_to_end() {
    let cfg = config();
    let load = vec![
        SystemLoadSample::new(0, "UM", 0.1, 0.1),
        SystemLoadSample::new(600, "UM", 0.9, 0.9),
    ];
    let rate = vec![
        CallRateSample::new(0, "UM", 1.0),
        CallRateSample::new(600, "UM", 100.0),
        CallRateSample::new(0, "OTHER", 10.0),
        CallRateSample::new(0, "OTHER", 20.0),
    ];
    let enricher = ContextEnricher::new(&cfg)
        .with_system_load(MetricSource::from_samples(load, &cfg))
        .with_call_rate(rate, &cfg);
    assert_eq!(enricher.load_tier("UM", 10), Some(Tier::Low));
    assert_eq!(enricher.load_tier("UM", 610), Some(Tier::High));

    let records = vec![
        // Low load, concurrent
        call("t1", "0.1", "UM", "A", 10, 5.0),
        call("t1", "0.2", "UM", "B", 11, 5.0),
        // High load, sequential
        call("t2", "0.1", "UM", "A", 610, 5.0),
        call("t2", "0.2", "UM", "B", 620, 5.0),
    ];
    let discovery = discover(&records);
    let result = aggregate(&records, &discovery.pair_list(), &cfg, Some(&enricher)).unwrap();

    let context = result.records[0].context.as_ref().unwrap();
    assert_eq!(context.system_load.low.concurrent, 1);
    assert_eq!(context.system_load.high.sequential, 1);
    assert_eq!(context.system_load.low.p_concurrent(), Some(1.0));
    assert_eq!(context.system_load.high.p_sequential(), Some(1.0));
    assert_eq!(context.system_load.missing, 0);

    // Rate column [1, 10, 20, 100]: p25 = 7.75, p75 = 40
    assert_eq!(context.call_rate.low.total, 1);
    assert_eq!(context.call_rate.high.total, 1);
    assert_eq!(result.stats.enrichment.rate_hits, 2);
}

#[test]
fn test_linear_scan_gives_same_context() {
    let indexed_cfg = config();
    let linear_cfg = AnalysisConfig {
        lookup: LookupStrategy::LinearScan,
        ..config()
    };
    let load: Vec<SystemLoadSample> = (0..40)
        .map(|i| SystemLoadSample::new(i * 97, "UM", (i % 10) as f64 / 10.0, 0.5))
        .collect();

    let mut records = Vec::new();
    for t in 0..30 {
        let trace = format!("t{}", t);
        records.push(call(&trace, "0.1", "UM", "A", t * 131, 20.0));
        records.push(call(&trace, "0.2", "UM", "B", t * 131 + (t % 3) * 10, 15.0));
    }
    let pairs = discover(&records).pair_list();

    let indexed = ContextEnricher::new(&indexed_cfg)
        .with_system_load(MetricSource::from_samples(load.clone(), &indexed_cfg));
    let linear = ContextEnricher::new(&linear_cfg)
        .with_system_load(MetricSource::from_samples(load, &linear_cfg));

    let a = aggregate(&records, &pairs, &indexed_cfg, Some(&indexed)).unwrap();
    let b = aggregate(&records, &pairs, &linear_cfg, Some(&linear)).unwrap();
    assert_eq!(a.records, b.records);
}

#[test]
fn test_same_services_under_two_callers_share_replay() {
    let mut records = Vec::new();
    for t in 0..5 {
        let trace = format!("t{}", t);
        // Under UM1 the two services overlap
        records.push(call(&trace, "0.1", "UM1", "A", 0, 10.0));
        records.push(call(&trace, "0.2", "UM1", "B", 5, 10.0));
    }
    for t in 5..10 {
        let trace = format!("t{}", t);
        // Under UM2 they run one after the other
        records.push(call(&trace, "0.1", "UM2", "A", 0, 10.0));
        records.push(call(&trace, "0.2", "UM2", "B", 50, 10.0));
    }
    let discovery = discover(&records);
    assert_eq!(discovery.pairs.len(), 2);

    // Timing is replayed per trace and service, so both parent contexts see
    // all ten traces and end up with the same ratios.
    let result = aggregate(&records, &discovery.pair_list(), &config(), None).unwrap();
    assert_eq!(result.records.len(), 2);
    for record in &result.records {
        assert_eq!(record.total_observations, 10);
        assert!((record.p_concurrent - 0.5).abs() < 1e-12);
    }

    let report = context_specific_dependencies(&result.records, 0.4);
    assert_eq!(report.multi_context_pairs, 1);
    assert!(report.dependencies.is_empty());
}
