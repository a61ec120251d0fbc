//! Allocation rule integration tests
//!
//! Runs an in-place allocation rule through the PostProcessor with an
//! allocation report on disk.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use ice_model::time::parse_month;
use ice_model::{CostAndUsage, CostAndUsageData, ResourceGroup, TagGroup};
use ice_postproc::{MetadataServices, PostProcessor, PostProcessorOptions, PostProcessorStats, RuleConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing_test::traced_test;

const RULE: &str = r#"
- name: alloc
  start: 2019-01
  end: 2022-01
  in:
    filter:
      product: [EC2Instance]
  allocation:
    in:
      _product: inProduct
      Cluster: inCluster
    out:
      Environment: Env
"#;

fn keys() -> Vec<String> {
    vec!["Cluster".into(), "Environment".into()]
}

fn tg(cluster: &str, env: &str) -> TagGroup {
    TagGroup::new(
        "111",
        "us-east-1",
        None,
        "EC2Instance",
        "RunInstances",
        "m5.large",
        Some(ResourceGroup::new(vec![cluster.into(), env.into()])),
    )
}

fn data(num_hours: usize, cost: f64) -> CostAndUsageData {
    let mut data = CostAndUsageData::new(parse_month("2019-11").unwrap(), keys()).with_num_hours(num_hours);
    let store = data.get_or_create(Some("EC2Instance"));
    for hour in 0..num_hours {
        store.put(hour, tg("k8s-a", ""), CostAndUsage::new(cost, 1.0));
    }
    data
}

fn write_report(dir: &Path, header: &str, rows: &[&str]) {
    let mut text = format!("{}\n", header);
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    fs::write(dir.join("alloc-2019-11.csv"), text).unwrap();
}

fn hourly_report(dir: &Path, rows: &[&str]) {
    write_report(dir, "Hour,Allocation,inCluster,inProduct,Env", rows);
}

fn run(dir: &Path, num_threads: usize, data: &mut CostAndUsageData) -> Vec<PostProcessorStats> {
    let configs = RuleConfig::from_yaml(RULE).unwrap();
    let period = *data.start();
    let mut processor = PostProcessor::new(PostProcessorOptions {
        num_threads,
        report_dir: dir.to_path_buf(),
        archive_dir: None,
    })
    .unwrap();
    processor.process(&period, &configs, data, &MetadataServices::default())
}

fn cost(data: &CostAndUsageData, hour: usize, tg: &TagGroup) -> Option<f64> {
    data.get(Some("EC2Instance")).unwrap().get(hour, tg).map(|v| v.cost)
}

fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.unwrap();
    assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
}

// ============================================================================
// Split semantics
// ============================================================================

#[test]
fn test_shortfall_leaves_remainder_on_source() {
    let dir = TempDir::new().unwrap();
    hourly_report(dir.path(), &["2019-11-01T00:00:00Z,0.6,k8s-a,EC2Instance,prod"]);
    let mut data = data(1, 100.0);

    let stats = run(dir.path(), 0, &mut data);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].rule_name, "alloc");
    assert_close(cost(&data, 0, &tg("k8s-a", "prod")), 60.0);
    assert_close(cost(&data, 0, &tg("k8s-a", "")), 40.0);
}

#[test]
fn test_overshoot_drives_source_negative() {
    let dir = TempDir::new().unwrap();
    hourly_report(
        dir.path(),
        &[
            "2019-11-01T00:00:00Z,0.7,k8s-a,EC2Instance,prod",
            "2019-11-01T00:00:00Z,0.7,k8s-a,EC2Instance,dev",
        ],
    );
    let mut data = data(1, 50.0);

    let stats = run(dir.path(), 0, &mut data);
    assert_close(cost(&data, 0, &tg("k8s-a", "prod")), 35.0);
    assert_close(cost(&data, 0, &tg("k8s-a", "dev")), 35.0);
    assert_close(cost(&data, 0, &tg("k8s-a", "")), -20.0);
    assert!(stats[0].info.contains("Allocations exceeded 100%"), "{}", stats[0].info);
}

#[test]
fn test_full_allocation_conserves_cost() {
    let dir = TempDir::new().unwrap();
    hourly_report(
        dir.path(),
        &[
            "2019-11-01T00:00:00Z,0.2,k8s-a,EC2Instance,prod",
            "2019-11-01T00:00:00Z,0.3,k8s-a,EC2Instance,dev",
            "2019-11-01T00:00:00Z,0.5,k8s-a,EC2Instance,test",
        ],
    );
    let mut data = data(1, 10.0);

    run(dir.path(), 0, &mut data);
    assert!(cost(&data, 0, &tg("k8s-a", "")).is_none());
    let total: f64 = ["prod", "dev", "test"]
        .iter()
        .map(|env| cost(&data, 0, &tg("k8s-a", env)).unwrap())
        .sum();
    assert!((total - 10.0).abs() < 1e-9);
}

#[test]
fn test_duplicate_rows_accumulate() {
    let dir = TempDir::new().unwrap();
    hourly_report(
        dir.path(),
        &[
            "2019-11-01T00:00:00Z,0.3,k8s-a,EC2Instance,prod",
            "2019-11-01T00:00:00Z,0.3,k8s-a,EC2Instance,prod",
        ],
    );
    let mut data = data(1, 10.0);

    run(dir.path(), 0, &mut data);
    assert_close(cost(&data, 0, &tg("k8s-a", "prod")), 6.0);
    assert_close(cost(&data, 0, &tg("k8s-a", "")), 4.0);
}

#[test]
fn test_source_that_is_also_an_output_splits_its_own_value() {
    let dir = TempDir::new().unwrap();
    hourly_report(
        dir.path(),
        &[
            "2019-11-01T00:00:00Z,0.5,k8s-a,EC2Instance,prod",
            "2019-11-01T00:00:00Z,0.5,k8s-a,EC2Instance,dev",
        ],
    );
    for num_threads in [0, 2] {
        let mut data = data(1, 100.0);
        data.get_or_create(Some("EC2Instance"))
            .put(0, tg("k8s-a", "prod"), CostAndUsage::new(100.0, 1.0));

        let stats = run(dir.path(), num_threads, &mut data);
        assert_eq!(stats[0].in_count, 2);
        assert!(cost(&data, 0, &tg("k8s-a", "")).is_none());
        assert_close(cost(&data, 0, &tg("k8s-a", "prod")), 100.0);
        assert_close(cost(&data, 0, &tg("k8s-a", "dev")), 100.0);
    }
}

#[test]
fn test_unmatched_cluster_is_untouched() {
    let dir = TempDir::new().unwrap();
    hourly_report(dir.path(), &["2019-11-01T00:00:00Z,1,k8s-b,EC2Instance,prod"]);
    let mut data = data(1, 10.0);

    run(dir.path(), 0, &mut data);
    assert_close(cost(&data, 0, &tg("k8s-a", "")), 10.0);
    assert!(cost(&data, 0, &tg("k8s-b", "prod")).is_none());
}

// ============================================================================
// Workers and reports
// ============================================================================

#[test]
fn test_worker_pool_matches_sequential_run() {
    let dir = TempDir::new().unwrap();
    write_report(
        dir.path(),
        "StartDate,EndDate,Allocation,inCluster,inProduct,Env",
        &[
            "2019-11-01T00:00:00Z,2019-11-02T00:00:00Z,0.25,k8s-a,EC2Instance,prod",
            "2019-11-01T00:00:00Z,2019-11-01T12:00:00Z,0.5,k8s-a,EC2Instance,dev",
        ],
    );
    let mut sequential = data(24, 4.0);
    let mut pooled = data(24, 4.0);

    run(dir.path(), 0, &mut sequential);
    run(dir.path(), 4, &mut pooled);

    for hour in 0..24 {
        for env in ["", "prod", "dev"] {
            assert_eq!(
                cost(&sequential, hour, &tg("k8s-a", env)),
                cost(&pooled, hour, &tg("k8s-a", env)),
                "hour {} env {:?}",
                hour,
                env
            );
        }
    }
    assert_close(cost(&pooled, 3, &tg("k8s-a", "")), 1.0);
    assert_close(cost(&pooled, 20, &tg("k8s-a", "")), 3.0);
    assert!(cost(&pooled, 20, &tg("k8s-a", "dev")).is_none());
}

#[test]
#[traced_test]
fn test_missing_report_skips_rule() {
    let dir = TempDir::new().unwrap();
    let mut data = data(1, 10.0);

    let stats = run(dir.path(), 0, &mut data);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].out_count, 0);
    assert_close(cost(&data, 0, &tg("k8s-a", "")), 10.0);
    assert!(logs_contain("No allocation report to process for rule alloc"));
}
