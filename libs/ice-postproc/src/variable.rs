//! Variable rule processor
//!
//! Redistributes the in tag groups of an allocation rule in place, hour by
//! hour, using fractions from an allocation report. The report is either
//! loaded from the report directory or generated from a Kubernetes cluster
//! usage report.
//!
//! ```text
//!   total ──┬── × f1 ──► output tag group 1
//!           ├── × f2 ──► output tag group 2
//!           └── total − Σ ──► original tag group (removed when ≈ 0)
//! ```

use crate::allocation_report::{allocation_tag_key, AllocationKey, AllocationReport};
use crate::cluster_report::{KubernetesReport, PRODUCT_SERVICE_CODES};
use crate::config::AllocationConfig;
use crate::error::{PostProcError, Result};
use crate::processor::{run_query, MetadataServices, QueryResult, RuleProcessor};
use crate::query::Query;
use crate::rule::Rule;
use crate::stats::{elapsed_info, PostProcessorStats, RuleType};
use ice_model::time::month_label;
use ice_model::{CostAndUsage, CostAndUsageData, TagGroup, TagGroupStore, TagKey};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Residue below which the source tag group is removed
pub const REMAINDER_THRESHOLD: f64 = 1e-4;

/// An allocation report ready to apply, with notes about how it was built
pub struct PreparedReport {
    pub report: AllocationReport,
    /// Unmatched clusters or tag groups of a generated report
    pub notes: Vec<String>,
}

/// Applies a rule with an `allocation`
pub struct VariableRuleProcessor<'a> {
    rule: &'a Rule,
    services: &'a MetadataServices,
    report_dir: &'a Path,
    archive_dir: Option<&'a Path>,
    pool: Option<&'a ThreadPool>,
}

impl<'a> VariableRuleProcessor<'a> {
    pub fn new(rule: &'a Rule, services: &'a MetadataServices, report_dir: &'a Path) -> Self {
        Self {
            rule,
            services,
            report_dir,
            archive_dir: None,
            pool: None,
        }
    }

    /// Run the hours on `pool` instead of the caller's thread
    pub fn with_pool(mut self, pool: &'a ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Keep a gzipped copy of generated reports in `dir`
    pub fn with_archive_dir(mut self, dir: &'a Path) -> Self {
        self.archive_dir = Some(dir);
        self
    }

    fn allocation(&self) -> Result<&'a AllocationConfig> {
        self.rule.allocation().ok_or_else(|| {
            PostProcError::config(format!("Rule {} has no allocation", self.rule.name()))
        })
    }

    /// Load or generate the allocation report for the data set's month
    ///
    /// Returns `None` when there is no source report for the month.
    pub fn allocation_report(&self, data: &CostAndUsageData) -> Result<Option<PreparedReport>> {
        let allocation = self.allocation()?;
        let start = *data.start();

        let Some(k8s_config) = &allocation.kubernetes else {
            let Some(path) = AllocationReport::locate(self.report_dir, self.rule.name(), &start) else {
                return Ok(None);
            };
            let mut report = self.rule.new_allocation_report(start)?;
            report.load_file(&path)?;
            return Ok(Some(PreparedReport {
                report,
                notes: Vec::new(),
            }));
        };

        let Some(path) = KubernetesReport::locate(self.report_dir, self.rule.name(), &start, k8s_config) else {
            return Ok(None);
        };
        let mut k8s = KubernetesReport::new(allocation, start, self.rule.user_tag_keys())?;
        k8s.load_file(&path)?;

        let prepared = self.generate_allocation_report(&k8s, data)?;
        if let Some(dir) = self.archive_dir {
            let name = format!("{}-{}", self.rule.name(), month_label(&start));
            prepared.report.archive_report(dir, &name)?;
        }
        Ok(Some(prepared))
    }

    /// Build allocation rows from a Kubernetes report
    ///
    /// The in operand is regrouped by product (and usage type when the
    /// report carries one), any other fixed in keys and the user tags of the
    /// in keys, so each aggregation matches at most one cluster.
    pub fn generate_allocation_report(&self, k8s: &KubernetesReport, data: &CostAndUsageData) -> Result<PreparedReport> {
        let allocation = self.allocation()?;
        let name = self.rule.name();
        let user_tag_keys = self.rule.user_tag_keys();

        let mut in_config = self
            .rule
            .config()
            .in_query
            .clone()
            .ok_or_else(|| PostProcError::config(format!("Rule {} has no in operand", name)))?;
        if in_config.filter.product.is_none() {
            in_config.filter.product = Some(PRODUCT_SERVICE_CODES.iter().map(|s| s.to_string()).collect());
        }
        let mut group_by = vec![TagKey::Product];
        if k8s.has_usage_type() {
            group_by.push(TagKey::UsageType);
        }
        let mut group_by_tags = Vec::new();
        for key in allocation.in_keys.keys() {
            if key.starts_with('_') {
                let tag_key = allocation_tag_key(key)?;
                if !group_by.contains(&tag_key) {
                    group_by.push(tag_key);
                }
            } else {
                group_by_tags.push(key.clone());
            }
        }
        in_config.group_by = Some(group_by);
        in_config.group_by_tags = Some(group_by_tags);
        in_config.monthly = false;
        let query = Query::new(&in_config, user_tag_keys)?;

        let max_hours = data.max_num();
        let in_data = run_query(&query, data, self.services, false, max_hours, name)?;

        let mut report = self.rule.new_allocation_report(*data.start())?;
        let out_keys: Vec<String> = report.out_keys().iter().map(|k| k.to_string()).collect();
        let out_keys: Vec<&str> = out_keys.iter().map(String::as_str).collect();
        let unused = k8s.unused_tag_values(&out_keys);

        let mut unprocessed_clusters: BTreeSet<String> = k8s.clusters().into_iter().map(String::from).collect();
        let mut unprocessed_groups = BTreeSet::new();

        for (atg, values) in &in_data {
            let Some(rg) = atg.resource_group(user_tag_keys.len()) else {
                continue;
            };
            let Some(cluster) = k8s.cluster_name(rg.values()) else {
                unprocessed_groups.insert(rg.to_string());
                continue;
            };
            unprocessed_clusters.remove(&cluster);

            let key = report.aggregation_key(atg);
            let product = self
                .services
                .products
                .get_product_by_service_code(atg.value(TagKey::Product).unwrap_or(""));
            let ec2_usage_type = if product.is_ec2_instance() {
                atg.value(TagKey::UsageType)
            } else {
                None
            };

            for hour in 0..values.len() {
                let items = k8s.hour_data(&cluster, hour, ec2_usage_type);
                if items.is_empty() {
                    continue;
                }
                let mut remaining = 1.0;
                for item in items {
                    let factor = k8s.allocation_factor(&product, item);
                    if factor == 0.0 {
                        continue;
                    }
                    report.add(hour, factor, key.clone(), k8s.tag_values(item, &out_keys));
                    remaining -= factor;
                }
                // Unused capacity, negative when the cluster is over-committed
                if f64::abs(remaining) > REMAINDER_THRESHOLD {
                    report.add(hour, remaining, key.clone(), unused.clone());
                }
            }
        }

        let mut notes = Vec::new();
        if !unprocessed_clusters.is_empty() {
            warn!(
                "unprocessed clusters in Kubernetes report for rule {}: {:?}",
                name, unprocessed_clusters
            );
            notes.push(format!(
                "unprocessed clusters in Kubernetes report: {:?}",
                unprocessed_clusters
            ));
        }
        if !unprocessed_groups.is_empty() {
            warn!(
                "unprocessed aggregation tag groups due to no matching cluster names in report for rule {}: {:?}",
                name, unprocessed_groups
            );
            notes.push(format!(
                "unprocessed aggregation tag groups due to no matching cluster names in report: {:?}",
                unprocessed_groups
            ));
        }
        debug!("Generated {} allocation report hours for rule {}", report.num_hours(), name);
        Ok(PreparedReport { report, notes })
    }

    /// Apply a prepared report to the resource data
    pub fn allocate(&self, data: &CostAndUsageData, prepared: &PreparedReport) -> Result<PostProcessorStats> {
        let started = Instant::now();
        let name = self.rule.name();
        let max_hours = data.max_num();
        let report = &prepared.report;

        let in_data = run_query(self.rule.in_query(), data, self.services, false, max_hours, name)?;
        let targets = allocation_targets(data, &in_data);

        let allocated: Mutex<BTreeSet<TagGroup>> = Mutex::new(BTreeSet::new());
        let run_hour = |hour: usize| allocate_hour(report, hour, &targets, &allocated);
        match self.pool {
            Some(pool) => pool.install(|| (0..max_hours).into_par_iter().for_each(run_hour)),
            None => (0..max_hours).for_each(run_hour),
        }
        let out_count = allocated.into_inner().len();

        let mut notes = Vec::new();
        if report.is_parsing_error() {
            notes.push("Parser encountered empty or bad allocation values".to_string());
        }
        let over = report.over_allocated_keys();
        if !over.is_empty() {
            let values: Vec<String> = over.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            let msg = format!(
                "Allocations exceeded 100% for keys [{}] with values: {{{}}}",
                report.in_keys().join(", "),
                values.join(", ")
            );
            warn!("{}", msg);
            notes.push(msg);
        }
        notes.extend(prepared.notes.iter().cloned());

        let mut info_text = elapsed_info(started.elapsed());
        for note in notes {
            info_text.push_str(", ");
            info_text.push_str(&note);
        }

        info!(
            "  -- data for rule {} -- in data size = {}, --- allocated size = {}",
            name,
            in_data.len(),
            out_count
        );
        Ok(PostProcessorStats::new(
            name,
            RuleType::Variable,
            false,
            in_data.len(),
            out_count,
            info_text,
        ))
    }
}

impl RuleProcessor for VariableRuleProcessor<'_> {
    fn process(&mut self, data: &mut CostAndUsageData) -> Result<Vec<PostProcessorStats>> {
        let name = self.rule.name();
        info!(
            "Post-process rule {} on {} hours of resource data with allocation report",
            name,
            data.max_num()
        );

        let Some(prepared) = self.allocation_report(data)? else {
            warn!("No allocation report to process for rule {}", name);
            return Ok(vec![PostProcessorStats::new(
                name,
                RuleType::Variable,
                false,
                0,
                0,
                "No allocation report found",
            )]);
        };
        Ok(vec![self.allocate(data, &prepared)?])
    }
}

/// A tag group to allocate, its store and its hourly values from the in query
type Target<'q> = (TagGroup, Arc<dyn TagGroupStore>, &'q [CostAndUsage]);

fn allocation_targets<'q>(data: &CostAndUsageData, in_data: &'q QueryResult) -> Vec<Target<'q>> {
    let num_user_tags = data.num_user_tags();
    in_data
        .iter()
        .filter_map(|(atg, values)| {
            let tg = atg.tag_group(num_user_tags);
            let store = data.get(Some(&tg.product))?;
            Some((tg, store, values.as_slice()))
        })
        .collect()
}

/// Allocate every target for one hour. Hours never share a write.
///
/// Totals come from the in query, so a source that is also another source's
/// output is split by its own value only. Changes are summed per tag group
/// and applied once; a result of about zero removes the entry.
fn allocate_hour(
    report: &AllocationReport,
    hour: usize,
    targets: &[Target<'_>],
    allocated: &Mutex<BTreeSet<TagGroup>>,
) {
    let mut changes: BTreeMap<TagGroup, (Arc<dyn TagGroupStore>, CostAndUsage)> = BTreeMap::new();
    let mut outputs = Vec::new();

    for (tg, store, values) in targets {
        let Some(total) = values.get(hour).copied() else {
            continue;
        };
        if total.cost == 0.0 {
            continue;
        }
        let key: AllocationKey = report.key(tg);
        let Some(entries) = report.get(hour, &key) else {
            continue;
        };
        if entries.is_empty() {
            continue;
        }

        let mut distributed = CostAndUsage::ZERO;
        for entry in entries {
            let share = total.mul(entry.allocation);
            let out = report.output_tag_group(entry, tg);
            distributed += share;
            changes.entry(out.clone()).or_insert_with(|| (Arc::clone(store), CostAndUsage::ZERO)).1 += share;
            outputs.push(out);
        }
        changes
            .entry(tg.clone())
            .or_insert_with(|| (Arc::clone(store), CostAndUsage::ZERO))
            .1 += CostAndUsage::ZERO.sub(&distributed);
    }

    for (tg, (store, change)) in changes {
        let value = store.get(hour, &tg).unwrap_or(CostAndUsage::ZERO) + change;
        if f64::abs(value.cost) > REMAINDER_THRESHOLD || f64::abs(value.usage) > REMAINDER_THRESHOLD {
            store.put(hour, tg, value);
        } else {
            store.remove(hour, &tg);
        }
    }
    allocated.lock().extend(outputs);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use ice_model::time::parse_month;
    use ice_model::ResourceGroup;
    use std::fs;
    use tempfile::TempDir;

    const RULE: &str = r#"
name: alloc
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

    fn rule(yaml: &str) -> Rule {
        let config: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        Rule::new(config, &keys()).unwrap()
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

    fn data(cost: f64) -> CostAndUsageData {
        let mut data = CostAndUsageData::new(parse_month("2019-11").unwrap(), keys()).with_num_hours(2);
        let store = data.get_or_create(Some("EC2Instance"));
        for hour in 0..2 {
            store.put(hour, tg("k8s-a", ""), CostAndUsage::new(cost, 2.0));
        }
        data
    }

    fn value(data: &CostAndUsageData, hour: usize, tg: &TagGroup) -> Option<CostAndUsage> {
        data.get(Some("EC2Instance")).unwrap().get(hour, tg)
    }

    fn write_report(dir: &Path, rows: &[&str]) {
        let mut text = String::from("Hour,Allocation,inCluster,inProduct,Env\n");
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        fs::write(dir.join("alloc-2019-11.csv"), text).unwrap();
    }

    #[test]
    fn test_shortfall_keeps_remainder() {
        let dir = TempDir::new().unwrap();
        write_report(dir.path(), &["2019-11-01T00:00:00Z,0.6,k8s-a,EC2Instance,prod"]);
        let rule = rule(RULE);
        let services = MetadataServices::default();
        let mut data = data(100.0);

        let stats = VariableRuleProcessor::new(&rule, &services, dir.path())
            .process(&mut data)
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].out_count, 1);
        assert_eq!(stats[0].rule_type, RuleType::Variable);

        let prod = value(&data, 0, &tg("k8s-a", "prod")).unwrap();
        assert!((prod.cost - 60.0).abs() < 1e-9);
        assert!((prod.usage - 1.2).abs() < 1e-9);
        let rest = value(&data, 0, &tg("k8s-a", "")).unwrap();
        assert!((rest.cost - 40.0).abs() < 1e-9);
        // No report entry for hour 1
        assert_eq!(value(&data, 1, &tg("k8s-a", "")), Some(CostAndUsage::new(100.0, 2.0)));
    }

    #[test]
    fn test_full_allocation_removes_source_on_pool() {
        let dir = TempDir::new().unwrap();
        write_report(
            dir.path(),
            &[
                "2019-11-01T00:00:00Z,0.25,k8s-a,EC2Instance,prod",
                "2019-11-01T00:00:00Z,0.75,k8s-a,EC2Instance,dev",
                "2019-11-01T01:00:00Z,1,k8s-a,EC2Instance,prod",
            ],
        );
        let rule = rule(RULE);
        let services = MetadataServices::default();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut data = data(8.0);

        VariableRuleProcessor::new(&rule, &services, dir.path())
            .with_pool(&pool)
            .process(&mut data)
            .unwrap();
        assert!(value(&data, 0, &tg("k8s-a", "")).is_none());
        assert!(value(&data, 1, &tg("k8s-a", "")).is_none());
        assert_eq!(value(&data, 0, &tg("k8s-a", "dev")).unwrap().cost, 6.0);
        assert_eq!(value(&data, 1, &tg("k8s-a", "prod")).unwrap().cost, 8.0);
    }

    #[test]
    fn test_over_allocation_is_noted() {
        let dir = TempDir::new().unwrap();
        write_report(
            dir.path(),
            &[
                "2019-11-01T00:00:00Z,0.7,k8s-a,EC2Instance,prod",
                "2019-11-01T00:00:00Z,0.7,k8s-a,EC2Instance,dev",
            ],
        );
        let rule = rule(RULE);
        let services = MetadataServices::default();
        let mut data = data(50.0);

        let stats = VariableRuleProcessor::new(&rule, &services, dir.path())
            .process(&mut data)
            .unwrap();
        assert!(stats[0].info.contains("Allocations exceeded 100% for keys [Cluster, _product]"));
        assert!((value(&data, 0, &tg("k8s-a", "")).unwrap().cost + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_report_is_a_skip() {
        let dir = TempDir::new().unwrap();
        let rule = rule(RULE);
        let services = MetadataServices::default();
        let mut data = data(10.0);

        let stats = VariableRuleProcessor::new(&rule, &services, dir.path())
            .process(&mut data)
            .unwrap();
        assert_eq!(stats[0].info, "No allocation report found");
        assert_eq!(stats[0].out_count, 0);
        assert_eq!(value(&data, 0, &tg("k8s-a", "")), Some(CostAndUsage::new(10.0, 2.0)));
    }

    const K8S_RULE: &str = r#"
name: k8s
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
    Namespace: K8sNamespace
  kubernetes:
    clusterNameFormulae: [Cluster]
    out:
      Namespace: Namespace
"#;

    const K8S_HEADER: &str = "Cluster,Namespace,StartDate,EndDate,RequestsCPUCores,UsedCPUCores,LimitsCPUCores,ClusterCPUCores,RequestsMemoryGiB,UsedMemoryGiB,LimitsMemoryGiB,ClusterMemoryGiB,NetworkInGiB,ClusterNetworkInGiB,NetworkOutGiB,ClusterNetworkOutGiB,PersistentVolumeClaimGiB,ClusterPersistentVolumeClaimGiB";

    fn k8s_keys() -> Vec<String> {
        vec!["Cluster".into(), "Namespace".into()]
    }

    #[test]
    fn test_kubernetes_report_generation() {
        let dir = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let rows = [
            K8S_HEADER,
            // Half the cluster's cpu and memory
            "c1,web,2019-11-01T00:00:00Z,2019-11-01T00:59:59Z,2,1,0,4,8,8,0,16,0,0,0,0,0,0",
            "c1,api,2019-11-01T00:00:00Z,2019-11-01T00:59:59Z,1,1,0,4,4,4,0,16,0,0,0,0,0,0",
            "other,web,2019-11-01T00:00:00Z,2019-11-01T00:59:59Z,1,1,0,4,4,4,0,16,0,0,0,0,0,0",
        ];
        fs::write(dir.path().join("k8s-kubernetes-2019-11.csv"), rows.join("\n")).unwrap();

        let config: RuleConfig = serde_yaml::from_str(K8S_RULE).unwrap();
        let rule = Rule::new(config, &k8s_keys()).unwrap();
        let services = MetadataServices::default();
        let mut data = CostAndUsageData::new(parse_month("2019-11").unwrap(), k8s_keys()).with_num_hours(1);
        let store = data.get_or_create(Some("EC2Instance"));
        let source = TagGroup::new(
            "111",
            "us-east-1",
            None,
            "EC2Instance",
            "RunInstances",
            "m5.large",
            Some(ResourceGroup::new(vec!["c1".into(), "".into()])),
        );
        store.put(0, source.clone(), CostAndUsage::new(100.0, 1.0));
        store.put(
            0,
            source.with_resource_group(Some(ResourceGroup::new(vec!["unknown".into(), "".into()]))),
            CostAndUsage::new(1.0, 1.0),
        );

        let processor = VariableRuleProcessor::new(&rule, &services, dir.path()).with_archive_dir(archive.path());
        let prepared = processor.allocation_report(&data).unwrap().unwrap();
        let key = prepared.report.key(&source);
        let values = prepared.report.get(0, &key).unwrap();
        assert_eq!(values.len(), 3);
        assert!((values[0].allocation - 0.5).abs() < 1e-12);
        assert_eq!(values[2].outputs, vec!["unused".to_string()]);
        assert!((values[2].allocation - 0.25).abs() < 1e-12);
        assert!(prepared.notes.iter().any(|n| n.contains("unprocessed clusters") && n.contains("other")));
        assert!(prepared.notes.iter().any(|n| n.contains("unknown|")));
        assert!(archive.path().join("k8s-2019-11.csv.gz").is_file());

        let stats = processor.allocate(&data, &prepared).unwrap();
        assert_eq!(stats.out_count, 3);
        let web = source.with_resource_group(Some(ResourceGroup::new(vec!["c1".into(), "web".into()])));
        assert!((store.get(0, &web).unwrap().cost - 50.0).abs() < 1e-9);
        assert!(store.get(0, &source).is_none());
    }
}
