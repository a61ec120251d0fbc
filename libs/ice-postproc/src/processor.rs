//! Aggregation scan shared by the rule processors

use crate::aggregation::AggregationTagGroup;
use crate::error::Result;
use crate::query::Query;
use crate::stats::PostProcessorStats;
use ice_model::{
    AccountService, BasicAccountService, BasicProductService, CostAndUsage, CostAndUsageData,
    ProductService, TagGroup, TagGroupStore, TagKey,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Aggregated series keyed by aggregation tag group
pub type QueryResult = BTreeMap<AggregationTagGroup, Vec<CostAndUsage>>;

/// Account and product lookups used while processing
#[derive(Clone)]
pub struct MetadataServices {
    pub accounts: Arc<dyn AccountService>,
    pub products: Arc<dyn ProductService>,
}

impl MetadataServices {
    pub fn new(accounts: Arc<dyn AccountService>, products: Arc<dyn ProductService>) -> Self {
        Self { accounts, products }
    }
}

impl Default for MetadataServices {
    fn default() -> Self {
        Self {
            accounts: Arc::new(BasicAccountService::default()),
            products: Arc::new(BasicProductService::default()),
        }
    }
}

/// Executes one rule against a data set
pub trait RuleProcessor {
    /// Apply the rule, returning one stats entry per pass
    fn process(&mut self, data: &mut CostAndUsageData) -> Result<Vec<PostProcessorStats>>;
}

/// Aggregate the data matching `query`
///
/// Each series has one slot when the query is monthly, `max_hours` otherwise.
/// Usage is only summed when the query keeps usage types distinct.
pub fn run_query(
    query: &Query,
    data: &CostAndUsageData,
    services: &MetadataServices,
    non_resource: bool,
    max_hours: usize,
    rule_name: &str,
) -> Result<QueryResult> {
    let slots = if query.is_monthly() { 1 } else { max_hours };
    let with_usage = query.aggregation().groups(TagKey::UsageType);
    let mut result = QueryResult::new();

    if query.is_single_tag_group() {
        let tg = query.single_tag_group(services, non_resource)?;
        let product = (!non_resource).then_some(tg.product.as_str());
        let atg = query.aggregation().aggregate(&tg);
        let mut values = vec![CostAndUsage::ZERO; slots];
        if let Some(store) = data.get(product) {
            accumulate(store.as_ref(), &tg, query.is_monthly(), with_usage, &mut values);
        }
        debug!("Single tag group lookup for rule {}: {}", rule_name, tg);
        result.insert(atg, values);
    } else {
        let products: Vec<Option<String>> = if non_resource {
            vec![None]
        } else {
            query.products(data).into_iter().map(Some).collect()
        };
        for product in products {
            let Some(store) = data.get(product.as_deref()) else {
                continue;
            };
            for tg in store.tag_groups() {
                let Some(atg) = query.aggregate_tag_group(&tg) else {
                    continue;
                };
                let values = result
                    .entry(atg)
                    .or_insert_with(|| vec![CostAndUsage::ZERO; slots]);
                accumulate(store.as_ref(), &tg, query.is_monthly(), with_usage, values);
            }
        }
    }

    if result.is_empty() {
        warn!("No query results for rule {}. Query: {}", rule_name, query);
    } else {
        info!(
            "  - query for rule {} returned {} aggregations from {} data",
            rule_name,
            result.len(),
            if non_resource { "non-resource" } else { "resource" }
        );
    }
    Ok(result)
}

fn accumulate(
    store: &dyn TagGroupStore,
    tg: &TagGroup,
    monthly: bool,
    with_usage: bool,
    values: &mut [CostAndUsage],
) {
    for hour in 0..store.num_hours() {
        let slot = if monthly { 0 } else { hour };
        if slot >= values.len() {
            break;
        }
        if let Some(v) = store.get(hour, tg) {
            let usage = if with_usage { v.usage } else { 0.0 };
            values[slot] += CostAndUsage::new(v.cost, usage);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use ice_model::time::parse_month;
    use ice_model::ResourceGroup;

    fn data() -> CostAndUsageData {
        let mut data = CostAndUsageData::new(parse_month("2019-11").unwrap(), vec!["Env".into()])
            .with_num_hours(3);
        let ec2 = data.get_or_create(Some("EC2Instance"));
        let non_resource = data.get_or_create(None);
        for (account, env, usage_type, cost) in [
            ("111", "prod", "m5.large", 10.0),
            ("111", "dev", "c5.large", 5.0),
            ("222", "prod", "m5.large", 1.0),
        ] {
            let tg = TagGroup::new(
                account,
                "us-east-1",
                None,
                "EC2Instance",
                "RunInstances",
                usage_type,
                Some(ResourceGroup::new(vec![env.to_string()])),
            );
            for hour in 0..3 {
                ec2.add(hour, tg.clone(), CostAndUsage::new(cost, 1.0));
                non_resource.add(hour, tg.with_resource_group(None), CostAndUsage::new(cost, 1.0));
            }
        }
        data
    }

    fn query(yaml: &str) -> Query {
        let config: QueryConfig = serde_yaml::from_str(yaml).unwrap();
        Query::new(&config, &["Env".to_string()]).unwrap()
    }

    #[test]
    fn test_scan_groups_and_sums() {
        let data = data();
        let services = MetadataServices::default();
        let q = query("groupBy: [account]\ngroupByTags: []");
        let result = run_query(&q, &data, &services, false, 3, "test").unwrap();
        assert_eq!(result.len(), 2);

        let (atg, values) = result.iter().next().unwrap();
        assert_eq!(atg.value(TagKey::Account), Some("111"));
        assert_eq!(values, &vec![CostAndUsage::new(15.0, 0.0); 3]);
    }

    #[test]
    fn test_monthly_collapses_hours() {
        let data = data();
        let services = MetadataServices::default();
        let q = query("filter: {account: ['222']}\ngroupBy: []\ngroupByTags: []\nmonthly: true");
        let result = run_query(&q, &data, &services, true, 3, "test").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.values().next().unwrap(), &vec![CostAndUsage::new(3.0, 0.0)]);
    }

    #[test]
    fn test_usage_kept_when_usage_type_grouped() {
        let data = data();
        let services = MetadataServices::default();
        let q = query("filter: {userTags: {Env: [prod]}}\ngroupBy: [usageType]\ngroupByTags: []");
        let result = run_query(&q, &data, &services, false, 3, "test").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.values().next().unwrap()[0], CostAndUsage::new(11.0, 2.0));
    }

    #[test]
    fn test_single_tag_group_lookup_matches_scan() {
        let data = data();
        let services = MetadataServices::default();
        let point = query(
            "filter: {account: ['111'], region: [us-east-1], product: [EC2Instance], operation: [RunInstances], usageType: [m5.large], singleTagGroup: true}\ngroupBy: []\ngroupByTags: []",
        );
        let scan = query(
            "filter: {account: ['111'], region: [us-east-1], product: [EC2Instance], operation: [RunInstances], usageType: [m5.large]}\ngroupBy: []\ngroupByTags: []",
        );
        assert!(point.is_single_tag_group());
        assert!(!scan.is_single_tag_group());

        let by_lookup = run_query(&point, &data, &services, true, 3, "test").unwrap();
        let by_scan = run_query(&scan, &data, &services, true, 3, "test").unwrap();
        assert_eq!(
            by_lookup.values().next().unwrap(),
            by_scan.values().next().unwrap()
        );
        assert_eq!(by_lookup.values().next().unwrap()[1].cost, 10.0);
    }

    #[test]
    fn test_no_results_is_not_an_error() {
        let data = data();
        let services = MetadataServices::default();
        let q = query("filter: {product: [EBS]}");
        assert!(run_query(&q, &data, &services, false, 3, "test").unwrap().is_empty());
    }
}
