//! Fixed rule integration tests
//!
//! Runs rule documents through the PostProcessor against an in-memory
//! data set:
//! - operand broadcast and expression results
//! - re-run idempotence
//! - rule isolation and active windows
//! - chained rules and single tag group lookups

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use ice_model::time::parse_month;
use ice_model::{CostAndUsage, CostAndUsageData, ResourceGroup, TagGroup, TagGroupStore};
use ice_postproc::{MetadataServices, PostProcessor, PostProcessorOptions, PostProcessorStats, RuleConfig};
use std::sync::Arc;
use tracing_test::traced_test;

fn ec2(env: &str) -> TagGroup {
    TagGroup::new(
        "111",
        "us-east-1",
        None,
        "EC2Instance",
        "RunInstances",
        "m5.large",
        Some(ResourceGroup::new(vec![env.to_string()])),
    )
}

/// EC2 cost per hour for the prod environment, plus a monthly rate
///
/// Every entry is also present, untagged, in the non-resource store.
fn data(ec2_costs: &[f64]) -> CostAndUsageData {
    let mut data = CostAndUsageData::new(parse_month("2019-11").unwrap(), vec!["Env".into()])
        .with_num_hours(ec2_costs.len());
    let non_resource = data.get_or_create(None);
    let store = data.get_or_create(Some("EC2Instance"));
    for (hour, cost) in ec2_costs.iter().enumerate() {
        if *cost != 0.0 {
            let tg = ec2("prod");
            non_resource.put(hour, tg.with_resource_group(None), CostAndUsage::new(*cost, 1.0));
            store.put(hour, tg, CostAndUsage::new(*cost, 1.0));
        }
    }
    let rates = data.get_or_create(Some("Rates"));
    let rate = TagGroup::new("111", "global", None, "Rates", "", "rate", Some(ResourceGroup::empty(1)));
    non_resource.put(0, rate.with_resource_group(None), CostAndUsage::new(2.0, 0.0));
    rates.put(0, rate, CostAndUsage::new(2.0, 0.0));
    data
}

fn run(yaml: &str, data: &mut CostAndUsageData) -> Vec<PostProcessorStats> {
    let configs = RuleConfig::from_yaml(yaml).unwrap();
    let period = *data.start();
    let mut processor = PostProcessor::new(PostProcessorOptions::default()).unwrap();
    processor.process(&period, &configs, data, &MetadataServices::default())
}

/// Hourly cost of the only tag group in a product's store
fn series(data: &CostAndUsageData, product: &str) -> Vec<f64> {
    let store: Arc<dyn TagGroupStore> = data.get(Some(product)).unwrap();
    let tag_groups = store.tag_groups();
    assert_eq!(tag_groups.len(), 1, "{} should hold one tag group", product);
    (0..store.num_hours())
        .map(|hour| store.get(hour, &tag_groups[0]).map_or(0.0, |v| v.cost))
        .collect()
}

const RATE_RULE: &str = r#"
- name: rated
  start: 2019-01
  end: 2022-01
  operands:
    rate:
      filter: {product: [Rates]}
      groupBy: []
      groupByTags: []
      monthly: true
  in:
    filter: {product: [EC2Instance]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Computed, usageType: fee}
      cost: "${in} * ${rate}"
"#;

// ============================================================================
// Expression results
// ============================================================================

#[test]
fn test_monthly_operand_is_broadcast_to_every_hour() {
    let mut data = data(&[10.0, 20.0]);
    let stats = run(RATE_RULE, &mut data);

    assert_eq!(series(&data, "Computed"), vec![20.0, 40.0]);
    // One entry per pass
    assert_eq!(stats.len(), 2);
    assert!(stats[0].non_resource);
    assert_eq!(stats[1].in_count, 1);
    assert_eq!(stats[1].out_count, 1);
}

#[test]
fn test_rerun_overwrites_instead_of_accumulating() {
    let mut data = data(&[10.0, 20.0]);
    run(RATE_RULE, &mut data);
    let first = series(&data, "Computed");
    run(RATE_RULE, &mut data);
    assert_eq!(series(&data, "Computed"), first);
}

// ============================================================================
// Isolation and windows
// ============================================================================

#[test]
fn test_failing_rule_does_not_stop_later_rules() {
    let mut data = data(&[1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
    let stats = run(
        r#"
- name: inverse
  start: 2019-01
  end: 2022-01
  in:
    filter: {product: [EC2Instance]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Inverse}
      cost: "10 / ${in}"
- name: doubled
  start: 2019-01
  end: 2022-01
  in:
    filter: {product: [EC2Instance]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Doubled}
      cost: "${in} * 2"
"#,
        &mut data,
    );

    let failed = &stats[0];
    assert_eq!(failed.rule_name, "inverse");
    assert!(failed.info.starts_with("Error: "), "{}", failed.info);
    assert!(failed.info.contains("\"10 / 0\""), "{}", failed.info);
    assert!(failed.info.contains("hour 5"), "{}", failed.info);

    assert!(stats.iter().any(|s| s.rule_name == "doubled" && !s.non_resource));
    assert_eq!(series(&data, "Doubled"), vec![2.0, 2.0, 2.0, 2.0, 2.0, 0.0]);
}

#[test]
fn test_failing_result_keeps_earlier_results_of_the_rule() {
    let mut data = data(&[1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
    let stats = run(
        r#"
- name: mixed
  start: 2019-01
  end: 2022-01
  in:
    filter: {product: [EC2Instance]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Doubled}
      cost: "${in} * 2"
    - out: {product: Inverse}
      cost: "10 / ${in}"
"#,
        &mut data,
    );

    // The non-resource pass fails, so the resource pass never runs
    assert_eq!(stats.len(), 1);
    assert!(stats[0].info.starts_with("Error: "), "{}", stats[0].info);
    assert!(data.get(Some("Doubled")).is_none());
    assert!(data.get(Some("Inverse")).is_none());

    let non_resource = data.get(None).unwrap();
    let products: Vec<String> = non_resource.tag_groups().into_iter().map(|tg| tg.product).collect();
    assert!(products.iter().any(|p| p == "Doubled"), "{:?}", products);
    assert!(!products.iter().any(|p| p == "Inverse"), "{:?}", products);
    let doubled = non_resource
        .tag_groups()
        .into_iter()
        .find(|tg| tg.product == "Doubled")
        .unwrap();
    let costs: Vec<f64> = (0..6)
        .map(|hour| non_resource.get(hour, &doubled).map_or(0.0, |v| v.cost))
        .collect();
    assert_eq!(costs, vec![2.0, 2.0, 2.0, 2.0, 2.0, 0.0]);
}

#[test]
#[traced_test]
fn test_rule_outside_window_is_skipped() {
    let mut data = data(&[10.0, 20.0]);
    let products_before = data.products();
    let stats = run(&RATE_RULE.replace("2019-01", "2020-01"), &mut data);

    assert!(stats.is_empty());
    assert_eq!(data.products(), products_before);
    assert!(logs_contain("Post-process rule rated is not active for this month"));
}

// ============================================================================
// Chaining and lookups
// ============================================================================

#[test]
fn test_later_rules_see_earlier_results() {
    let mut data = data(&[10.0, 20.0]);
    run(
        r#"
- name: surcharge
  start: 2019-01
  end: 2022-01
  in:
    filter: {product: [EC2Instance]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Surcharge, usageType: fee}
      cost: "${in} * 0.1"
- name: total
  start: 2019-01
  end: 2022-01
  in:
    filter: {product: [Surcharge]}
    groupBy: [account]
    groupByTags: []
  results:
    - out: {product: Total, usageType: fee}
      cost: "${in} * 10"
"#,
        &mut data,
    );

    let total = series(&data, "Total");
    assert!((total[0] - 10.0).abs() < 1e-9);
    assert!((total[1] - 20.0).abs() < 1e-9);
}

#[test]
fn test_single_tag_group_lookup_matches_scan() {
    let mut data = data(&[10.0, 20.0]);
    data.get_or_create(Some("EC2Instance"))
        .put(0, ec2("dev"), CostAndUsage::new(5.0, 1.0));
    let stats = run(
        r#"
- name: lookup
  start: 2019-01
  end: 2022-01
  operands:
    point:
      filter:
        account: ['111']
        region: [us-east-1]
        product: [EC2Instance]
        operation: [RunInstances]
        usageType: [m5.large]
        userTags: {Env: [prod]}
        singleTagGroup: true
      groupBy: []
      groupByTags: []
    scan:
      filter:
        account: ['111']
        region: [us-east-1]
        product: [EC2Instance]
        operation: [RunInstances]
        usageType: [m5.large]
        userTags: {Env: [prod]}
      groupBy: []
      groupByTags: []
  in:
    filter: {product: [EC2Instance]}
  results:
    - out: {account: '111', region: us-east-1, product: Point, usageType: fee}
      single: true
      cost: "${point}"
    - out: {account: '111', region: us-east-1, product: Scan, usageType: fee}
      single: true
      cost: "${scan}"
"#,
        &mut data,
    );

    assert!(stats.iter().all(|s| !s.info.starts_with("Error")));
    assert_eq!(series(&data, "Point"), vec![10.0, 20.0]);
    assert_eq!(series(&data, "Point"), series(&data, "Scan"));
}
