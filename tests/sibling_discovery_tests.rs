//! Integration tests for sibling discovery and execution-order classification

use sibscope::classifier::{classify, ExecutionOrder};
use sibscope::record::{CallRecord, TimingInterval};
use sibscope::sibling::{discover, SiblingPair};

fn call(trace: &str, rpc: &str, um: &str, dm: &str) -> CallRecord {
    CallRecord::new(trace, rpc, um, dm, 0, 1.0)
}

#[test]
fn test_three_siblings_yield_three_pairs() {
    let records = vec![
        call("t1", "0.1", "UM", "A"),
        call("t1", "0.2", "UM", "B"),
        call("t1", "0.3", "UM", "C"),
    ];
    let discovery = discover(&records);
    let pairs: Vec<(String, String)> = discovery
        .pairs
        .iter()
        .map(|p| (p.first.clone(), p.second.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("A".to_string(), "B".to_string()),
            ("A".to_string(), "C".to_string()),
            ("B".to_string(), "C".to_string()),
        ]
    );
}

#[test]
fn test_nested_levels_are_separate_contexts() {
    // 0.1 and 0.2 are siblings under "0"; 0.1.1 and 0.1.2 under "0.1"
    let records = vec![
        call("t1", "0.1", "UM", "A"),
        call("t1", "0.2", "UM", "B"),
        call("t1", "0.1.1", "A", "C"),
        call("t1", "0.1.2", "A", "D"),
    ];
    let discovery = discover(&records);
    assert!(discovery
        .pairs
        .contains(&SiblingPair::new("A", "B", "0", "UM").unwrap()));
    assert!(discovery
        .pairs
        .contains(&SiblingPair::new("C", "D", "0.1", "A").unwrap()));
    assert_eq!(discovery.pairs.len(), 2);
    assert_eq!(discovery.stats.sibling_contexts, 2);
}

#[test]
fn test_same_callee_twice_is_not_a_pair() {
    let records = vec![
        call("t1", "0.1", "UM", "A"),
        call("t1", "0.2", "UM", "A"),
        call("t1", "0.3", "UM", "A"),
    ];
    assert!(discover(&records).pairs.is_empty());
}

#[test]
fn test_pairs_from_many_traces_deduplicate() {
    let mut records = Vec::new();
    for t in 0..50 {
        let trace = format!("trace-{}", t);
        records.push(call(&trace, "0.1", "UM", "B"));
        records.push(call(&trace, "0.2", "UM", "A"));
    }
    let discovery = discover(&records);
    assert_eq!(discovery.pairs.len(), 1);
    assert_eq!(discovery.stats.traces, 50);
    assert_eq!(discovery.stats.sibling_contexts, 50);
}

#[test]
fn test_whitespace_rpc_path_counted_invalid() {
    let records = vec![call("t1", "   ", "UM", "A"), call("t1", "0.2", "UM", "B")];
    let discovery = discover(&records);
    assert_eq!(discovery.stats.invalid_rpc_paths, 1);
    assert!(discovery.pairs.is_empty());
}

#[test]
fn test_classification_with_zero_response_times() {
    let eps = 0.001;
    let a = TimingInterval::from_call(100, 0.0, eps).unwrap();
    let b = TimingInterval::from_call(100, 0.0, eps).unwrap();
    assert_eq!(classify(&a, &b), ExecutionOrder::Concurrent);

    let c = TimingInterval::from_call(101, 0.0, eps).unwrap();
    assert_eq!(classify(&a, &c), ExecutionOrder::FirstThenSecond);
    assert_eq!(classify(&c, &a), ExecutionOrder::SecondThenFirst);
}

#[test]
fn test_classification_touching_and_overlapping() {
    let first = TimingInterval::from_call(0, 10.0, 0.001).unwrap();
    let touching = TimingInterval::from_call(10, 10.0, 0.001).unwrap();
    let overlapping = TimingInterval::from_call(9, 10.0, 0.001).unwrap();
    assert_eq!(classify(&first, &touching), ExecutionOrder::FirstThenSecond);
    assert_eq!(classify(&first, &overlapping), ExecutionOrder::Concurrent);
}
