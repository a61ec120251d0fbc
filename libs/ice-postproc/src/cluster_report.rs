//! Kubernetes cluster usage reports
//!
//! A cluster report lists, per cluster and hour, the CPU, memory, network and
//! volume consumption of each namespace (or deployment) together with the
//! cluster totals. The variable rule processor turns it into an
//! [`AllocationReport`](crate::allocation_report::AllocationReport) whose
//! fractions are each item's share of its cluster.

use crate::allocation_report::is_gzip;
use crate::cluster_name::ClusterNameBuilder;
use crate::config::{AllocationConfig, KubernetesConfig};
use crate::error::{PostProcError, Result};
use chrono::{DateTime, Duration, Utc};
use csv::StringRecord;
use flate2::read::GzDecoder;
use ice_model::metadata::service_code;
use ice_model::time::{hour_index, month_label, parse_date};
use ice_model::Product;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Relative cost of one vCPU against one GiB of memory
pub const VCPU_TO_MEMORY_COST_RATIO: f64 = 10.9;

/// Products a cluster report can allocate
pub const PRODUCT_SERVICE_CODES: [&str; 4] = [
    service_code::EC2_INSTANCE,
    service_code::CLOUD_WATCH,
    service_code::EBS,
    service_code::DATA_TRANSFER,
];

/// Output value of deployment parameters on the unused capacity row
pub const UNUSED: &str = "unused";

/// Rows further than this from the month start are rejected
const MAX_START_HOUR: i64 = 31 * 24;

/// Known report columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KubernetesColumn {
    Cluster,
    Type,
    Resource,
    Namespace,
    StartDate,
    EndDate,
    RequestsCPUCores,
    UsedCPUCores,
    LimitsCPUCores,
    ClusterCPUCores,
    RequestsMemoryGiB,
    UsedMemoryGiB,
    LimitsMemoryGiB,
    ClusterMemoryGiB,
    NetworkInGiB,
    ClusterNetworkInGiB,
    NetworkOutGiB,
    ClusterNetworkOutGiB,
    PersistentVolumeClaimGiB,
    ClusterPersistentVolumeClaimGiB,
    UsageType,
}

impl KubernetesColumn {
    pub const ALL: [KubernetesColumn; 21] = [
        KubernetesColumn::Cluster,
        KubernetesColumn::Type,
        KubernetesColumn::Resource,
        KubernetesColumn::Namespace,
        KubernetesColumn::StartDate,
        KubernetesColumn::EndDate,
        KubernetesColumn::RequestsCPUCores,
        KubernetesColumn::UsedCPUCores,
        KubernetesColumn::LimitsCPUCores,
        KubernetesColumn::ClusterCPUCores,
        KubernetesColumn::RequestsMemoryGiB,
        KubernetesColumn::UsedMemoryGiB,
        KubernetesColumn::LimitsMemoryGiB,
        KubernetesColumn::ClusterMemoryGiB,
        KubernetesColumn::NetworkInGiB,
        KubernetesColumn::ClusterNetworkInGiB,
        KubernetesColumn::NetworkOutGiB,
        KubernetesColumn::ClusterNetworkOutGiB,
        KubernetesColumn::PersistentVolumeClaimGiB,
        KubernetesColumn::ClusterPersistentVolumeClaimGiB,
        KubernetesColumn::UsageType,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KubernetesColumn::Cluster => "Cluster",
            KubernetesColumn::Type => "Type",
            KubernetesColumn::Resource => "Resource",
            KubernetesColumn::Namespace => "Namespace",
            KubernetesColumn::StartDate => "StartDate",
            KubernetesColumn::EndDate => "EndDate",
            KubernetesColumn::RequestsCPUCores => "RequestsCPUCores",
            KubernetesColumn::UsedCPUCores => "UsedCPUCores",
            KubernetesColumn::LimitsCPUCores => "LimitsCPUCores",
            KubernetesColumn::ClusterCPUCores => "ClusterCPUCores",
            KubernetesColumn::RequestsMemoryGiB => "RequestsMemoryGiB",
            KubernetesColumn::UsedMemoryGiB => "UsedMemoryGiB",
            KubernetesColumn::LimitsMemoryGiB => "LimitsMemoryGiB",
            KubernetesColumn::ClusterMemoryGiB => "ClusterMemoryGiB",
            KubernetesColumn::NetworkInGiB => "NetworkInGiB",
            KubernetesColumn::ClusterNetworkInGiB => "ClusterNetworkInGiB",
            KubernetesColumn::NetworkOutGiB => "NetworkOutGiB",
            KubernetesColumn::ClusterNetworkOutGiB => "ClusterNetworkOutGiB",
            KubernetesColumn::PersistentVolumeClaimGiB => "PersistentVolumeClaimGiB",
            KubernetesColumn::ClusterPersistentVolumeClaimGiB => "ClusterPersistentVolumeClaimGiB",
            KubernetesColumn::UsageType => "UsageType",
        }
    }

    pub fn from_name(name: &str) -> Option<KubernetesColumn> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Columns a report may leave out
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            KubernetesColumn::Type | KubernetesColumn::Resource | KubernetesColumn::UsageType
        )
    }
}

impl fmt::Display for KubernetesColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parsed cluster report for one month
#[derive(Debug, Clone)]
pub struct KubernetesReport {
    start: DateTime<Utc>,
    /// Allocation output key to report column
    out_columns: BTreeMap<String, String>,
    /// Allocation output keys filled from report columns
    deploy_params: BTreeMap<String, KubernetesColumn>,
    cluster_names: ClusterNameBuilder,
    columns: HashMap<KubernetesColumn, usize>,
    user_tag_columns: HashMap<String, usize>,
    /// Items per cluster and hour
    data: BTreeMap<String, Vec<Vec<StringRecord>>>,
}

impl KubernetesReport {
    /// Empty report for the month starting at `start`
    pub fn new(allocation: &AllocationConfig, start: DateTime<Utc>, user_tag_keys: &[String]) -> Result<Self> {
        let config = allocation
            .kubernetes
            .as_ref()
            .ok_or_else(|| PostProcError::config("Allocation has no kubernetes configuration"))?;
        if config.cluster_name_formulae.is_empty() {
            return Err(PostProcError::config(
                "Kubernetes allocation needs at least one cluster name formula",
            ));
        }

        let cluster_names = ClusterNameBuilder::new(&config.cluster_name_formulae, user_tag_keys)?;
        if cluster_names
            .referenced_tags()
            .iter()
            .any(|tag| !allocation.in_keys.contains_key(*tag))
        {
            return Err(PostProcError::config(
                "Cluster name formulae refer to tags not in the input tag key list",
            ));
        }

        let mut deploy_params = BTreeMap::new();
        for (column, key) in &config.out {
            let column = KubernetesColumn::from_name(column).ok_or_else(|| {
                PostProcError::config(format!("Unknown Kubernetes report column \"{}\"", column))
            })?;
            if !allocation.out.contains_key(key) {
                return Err(PostProcError::config(format!(
                    "Kubernetes output key \"{}\" is not an allocation output",
                    key
                )));
            }
            deploy_params.insert(key.clone(), column);
        }

        Ok(Self {
            start,
            out_columns: allocation.out.clone(),
            deploy_params,
            cluster_names,
            columns: HashMap::new(),
            user_tag_columns: HashMap::new(),
            data: BTreeMap::new(),
        })
    }

    pub fn start(&self) -> &DateTime<Utc> {
        &self.start
    }

    /// Location of a rule's cluster report for a month
    ///
    /// An explicit `report` path wins, resolved against `dir` when relative.
    /// Otherwise `<rule>-kubernetes-<yyyy-MM>.csv`, plain or gzipped.
    pub fn locate(
        dir: &Path,
        rule_name: &str,
        start: &DateTime<Utc>,
        config: &KubernetesConfig,
    ) -> Option<PathBuf> {
        if let Some(report) = &config.report {
            let path = dir.join(report);
            return path.is_file().then_some(path);
        }
        let base = format!("{}-kubernetes-{}.csv", rule_name, month_label(start));
        [base.clone(), format!("{}.gz", base)]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading Kubernetes report {}", path.display());
        let file = BufReader::new(File::open(path)?);
        if is_gzip(path) {
            self.load_csv(GzDecoder::new(file))
        } else {
            self.load_csv(file)
        }
    }

    /// Parse report rows, replacing any previously loaded data
    pub fn load_csv<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        self.init_columns(&headers)?;
        self.data.clear();

        let mut lines = 0usize;
        let mut skipped = 0usize;
        for record in rdr.records() {
            let record = record?;
            lines += 1;
            match self.hour_of(&record) {
                Ok(hour) => {
                    let cluster = self.string(&record, KubernetesColumn::Cluster).to_string();
                    let hours = self.data.entry(cluster).or_default();
                    if hours.len() <= hour {
                        hours.resize_with(hour + 1, Vec::new);
                    }
                    hours[hour].push(record);
                },
                Err(e) => {
                    error!("Kubernetes report line {}: {}", lines + 1, e);
                    skipped += 1;
                },
            }
        }
        info!(
            "Processed {} Kubernetes report lines, skipped {}, clusters: {:?}",
            lines,
            skipped,
            self.clusters()
        );
        Ok(())
    }

    fn init_columns(&mut self, headers: &StringRecord) -> Result<()> {
        self.columns.clear();
        self.user_tag_columns.clear();

        let mut unreferenced = Vec::new();
        let mut empty = Vec::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some((key, _)) = self.out_columns.iter().find(|(_, column)| *column == header) {
                self.user_tag_columns.insert(key.clone(), i);
            } else if let Some(column) = KubernetesColumn::from_name(header) {
                self.columns.insert(column, i);
            } else if header.is_empty() {
                empty.push(i);
            } else {
                unreferenced.push(header.to_string());
            }
        }
        if !empty.is_empty() {
            warn!("Empty columns in Kubernetes report: {:?}", empty);
        }
        if !unreferenced.is_empty() {
            info!("Unreferenced columns in Kubernetes report: {:?}", unreferenced);
        }

        let (optional, mandatory): (Vec<KubernetesColumn>, Vec<KubernetesColumn>) = KubernetesColumn::ALL
            .iter()
            .copied()
            .filter(|c| !self.columns.contains_key(c))
            .partition(KubernetesColumn::is_optional);
        if !optional.is_empty() {
            info!(
                "Kubernetes report does not have columns for optional fields: {:?}",
                optional
            );
        }
        if !mandatory.is_empty() {
            let names: Vec<&str> = mandatory.iter().map(KubernetesColumn::name).collect();
            return Err(PostProcError::report(format!(
                "Kubernetes report does not have columns for mandatory fields: [{}]",
                names.join(", ")
            )));
        }
        Ok(())
    }

    /// Hour index of a row, which must cover at most one hour of the month
    fn hour_of(&self, record: &StringRecord) -> Result<usize> {
        let start_date = parse_date(self.string(record, KubernetesColumn::StartDate))?;
        let end_date = parse_date(self.string(record, KubernetesColumn::EndDate))?;
        let start_index = hour_index(&self.start, &start_date);
        let end_index = hour_index(&self.start, &(end_date + Duration::seconds(1)));
        if !(0..=MAX_START_HOUR).contains(&start_index) {
            return Err(PostProcError::report(format!(
                "start date {} is outside of {}",
                start_date,
                month_label(&self.start)
            )));
        }
        if end_index > start_index + 1 {
            return Err(PostProcError::report(format!(
                "row spans more than one hour: {} to {}",
                start_date, end_date
            )));
        }
        Ok(start_index as usize)
    }

    /// Clusters present in the report
    pub fn clusters(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    pub fn has_usage_type(&self) -> bool {
        self.columns.contains_key(&KubernetesColumn::UsageType)
    }

    /// First candidate cluster name for the user tags that the report contains
    pub fn cluster_name(&self, user_tags: &[String]) -> Option<String> {
        self.cluster_names
            .cluster_names(user_tags)
            .into_iter()
            .find(|name| self.data.contains_key(name))
    }

    /// Items of a cluster for one hour, restricted to a usage type when given
    pub fn hour_data(&self, cluster: &str, hour: usize, usage_type: Option<&str>) -> Vec<&StringRecord> {
        let Some(items) = self.data.get(cluster).and_then(|hours| hours.get(hour)) else {
            return Vec::new();
        };
        match usage_type.filter(|u| !u.is_empty()) {
            Some(usage_type) => items
                .iter()
                .filter(|item| self.string(item, KubernetesColumn::UsageType) == usage_type)
                .collect(),
            None => items.iter().collect(),
        }
    }

    pub fn string<'r>(&self, item: &'r StringRecord, column: KubernetesColumn) -> &'r str {
        self.columns
            .get(&column)
            .and_then(|i| item.get(*i))
            .unwrap_or("")
    }

    /// Numeric column value. Empty, `nan`, `inf` and unparsable values are 0.
    pub fn double(&self, item: &StringRecord, column: KubernetesColumn) -> f64 {
        let s = self.string(item, column);
        if s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("inf") {
            return 0.0;
        }
        match s.parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                debug!("Bad {} value \"{}\" in Kubernetes report", column, s);
                0.0
            },
        }
    }

    fn user_tag(&self, item: &StringRecord, key: &str) -> String {
        self.user_tag_columns
            .get(key)
            .and_then(|i| item.get(*i))
            .unwrap_or("")
            .to_string()
    }

    /// Output values of an item for the allocation output keys
    pub fn tag_values(&self, item: &StringRecord, out_keys: &[&str]) -> Vec<String> {
        out_keys
            .iter()
            .map(|key| match self.deploy_params.get(*key) {
                Some(column) => self.string(item, *column).to_string(),
                None => self.user_tag(item, key),
            })
            .collect()
    }

    /// Output values of the unused capacity row
    pub fn unused_tag_values(&self, out_keys: &[&str]) -> Vec<String> {
        out_keys
            .iter()
            .map(|key| {
                if self.deploy_params.contains_key(*key) {
                    UNUSED.to_string()
                } else {
                    String::new()
                }
            })
            .collect()
    }

    /// Share of its cluster's cost an item consumes for a product
    pub fn allocation_factor(&self, product: &Product, item: &StringRecord) -> f64 {
        let d = |column| self.double(item, column);
        let ratio = |used: f64, total: f64| if total <= 0.0 { 0.0 } else { used / total };

        if product.is_ec2_instance() || product.is_cloud_watch() {
            let cpu = d(KubernetesColumn::RequestsCPUCores).max(d(KubernetesColumn::UsedCPUCores));
            let memory = d(KubernetesColumn::RequestsMemoryGiB).max(d(KubernetesColumn::UsedMemoryGiB));
            let cluster = d(KubernetesColumn::ClusterCPUCores) * VCPU_TO_MEMORY_COST_RATIO
                + d(KubernetesColumn::ClusterMemoryGiB);
            ratio(cpu * VCPU_TO_MEMORY_COST_RATIO + memory, cluster)
        } else if product.is_ebs() {
            ratio(
                d(KubernetesColumn::PersistentVolumeClaimGiB),
                d(KubernetesColumn::ClusterPersistentVolumeClaimGiB),
            )
        } else if product.is_data_transfer() {
            ratio(
                d(KubernetesColumn::NetworkInGiB) + d(KubernetesColumn::NetworkOutGiB),
                d(KubernetesColumn::ClusterNetworkInGiB) + d(KubernetesColumn::ClusterNetworkOutGiB),
            )
        } else {
            0.0
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use ice_model::time::parse_month;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
in:
  _product: Product
  Cluster: K8sCluster
out:
  K8sNamespace: K8sNamespace
  K8sType: K8sType
  Environment: Env
kubernetes:
  clusterNameFormulae:
    - Cluster.toLower()
    - Cluster.regex("k8s-(.*)")
  out:
    Namespace: K8sNamespace
    Type: K8sType
"#;

    const HEADER: &str = "Cluster,Type,Resource,Namespace,StartDate,EndDate,RequestsCPUCores,UsedCPUCores,LimitsCPUCores,ClusterCPUCores,RequestsMemoryGiB,UsedMemoryGiB,LimitsMemoryGiB,ClusterMemoryGiB,NetworkInGiB,ClusterNetworkInGiB,NetworkOutGiB,ClusterNetworkOutGiB,PersistentVolumeClaimGiB,ClusterPersistentVolumeClaimGiB,Env,Extra";

    fn user_tag_keys() -> Vec<String> {
        ["Cluster", "Environment", "K8sNamespace", "K8sType"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn report_text() -> String {
        [
            HEADER,
            "dev-usw2a,Namespace,,kube-system,2019-01-01T00:00:00Z,2019-01-01T00:59:59Z,0.5,0.25,0,20,4,1,0,80,1,10,1,10,5,50,dev,x",
            "dev-usw2a,Namespace,,web,2019-01-01T00:00:00Z,2019-01-01T00:59:59Z,1,2,0,20,nan,8,0,80,0,10,0,10,0,50,prod,x",
            "dev-usw2a,Namespace,,web,2019-01-01T01:00:00Z,2019-01-01T01:59:59Z,1,2,0,20,8,8,0,80,0,10,0,10,0,50,prod,x",
            "dev-usw2a,Namespace,,web,2019-01-01T01:00:00Z,2019-01-01T03:00:00Z,1,2,0,20,8,8,0,80,0,10,0,10,0,50,prod,x",
            "prod-use1,Namespace,,api,2019-02-03T00:00:00Z,2019-02-03T00:59:59Z,1,1,0,4,1,1,0,16,0,0,0,0,0,0,prod,x",
        ]
        .join("\n")
    }

    fn report() -> KubernetesReport {
        let allocation: AllocationConfig = serde_yaml::from_str(CONFIG).unwrap();
        let mut report =
            KubernetesReport::new(&allocation, parse_month("2019-01").unwrap(), &user_tag_keys()).unwrap();
        report.load_csv(report_text().as_bytes()).unwrap();
        report
    }

    fn tags(cluster: &str) -> Vec<String> {
        vec![cluster.to_string(), String::new(), String::new(), String::new()]
    }

    #[test]
    fn test_rows_grouped_by_cluster_and_hour() {
        let report = report();
        // The multi-hour row and the row outside the month are dropped
        assert_eq!(report.clusters(), vec!["dev-usw2a"]);
        assert_eq!(report.hour_data("dev-usw2a", 0, None).len(), 2);
        assert_eq!(report.hour_data("dev-usw2a", 1, None).len(), 1);
        assert!(report.hour_data("dev-usw2a", 2, None).is_empty());
        assert!(report.hour_data("missing", 0, None).is_empty());
        assert!(!report.has_usage_type());
    }

    #[test]
    fn test_cluster_name_matches_first_known_cluster() {
        let report = report();
        assert_eq!(report.cluster_name(&tags("Dev-USW2A")), Some("dev-usw2a".to_string()));
        assert_eq!(report.cluster_name(&tags("k8s-dev-usw2a")), Some("dev-usw2a".to_string()));
        assert_eq!(report.cluster_name(&tags("other")), None);
        assert_eq!(report.cluster_name(&tags("")), None);
    }

    #[test]
    fn test_allocation_factors() {
        let report = report();
        let items = report.hour_data("dev-usw2a", 0, None);
        let ec2 = Product::new(service_code::EC2_INSTANCE, "EC2 Instance");
        let ebs = Product::new(service_code::EBS, "EBS");
        let transfer = Product::new(service_code::DATA_TRANSFER, "Data Transfer");
        let other = Product::new("S3", "S3");

        let units = 20.0 * VCPU_TO_MEMORY_COST_RATIO + 80.0;
        let expected = (0.5 * VCPU_TO_MEMORY_COST_RATIO + 4.0) / units;
        assert!((report.allocation_factor(&ec2, items[0]) - expected).abs() < 1e-12);
        // nan requested memory reads as 0, so used memory wins
        let expected = (2.0 * VCPU_TO_MEMORY_COST_RATIO + 8.0) / units;
        assert!((report.allocation_factor(&ec2, items[1]) - expected).abs() < 1e-12);

        assert!((report.allocation_factor(&ebs, items[0]) - 0.1).abs() < 1e-12);
        assert!((report.allocation_factor(&transfer, items[0]) - 0.1).abs() < 1e-12);
        assert_eq!(report.allocation_factor(&other, items[0]), 0.0);
    }

    #[test]
    fn test_tag_values() {
        let report = report();
        let items = report.hour_data("dev-usw2a", 0, None);
        let out_keys = ["Environment", "K8sNamespace", "K8sType"];
        assert_eq!(report.tag_values(items[1], &out_keys), vec!["prod", "web", "Namespace"]);
        assert_eq!(report.unused_tag_values(&out_keys), vec!["", UNUSED, UNUSED]);
    }

    #[test]
    fn test_missing_mandatory_column() {
        let allocation: AllocationConfig = serde_yaml::from_str(CONFIG).unwrap();
        let mut report =
            KubernetesReport::new(&allocation, parse_month("2019-01").unwrap(), &user_tag_keys()).unwrap();
        let err = report.load_csv("Cluster,Namespace,StartDate,EndDate\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("RequestsCPUCores"));
    }

    #[test]
    fn test_formula_tags_must_be_in_keys() {
        let mut allocation: AllocationConfig = serde_yaml::from_str(CONFIG).unwrap();
        allocation.in_keys.remove("Cluster");
        let err = KubernetesReport::new(&allocation, parse_month("2019-01").unwrap(), &user_tag_keys())
            .unwrap_err();
        assert!(err.to_string().contains("not in the input tag key list"));
    }

    #[test]
    fn test_locate_and_load_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let start = parse_month("2019-01").unwrap();
        let config = KubernetesConfig::default();
        assert!(KubernetesReport::locate(dir.path(), "k8s", &start, &config).is_none());

        let path = dir.path().join("k8s-kubernetes-2019-01.csv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(report_text().as_bytes()).unwrap();
        encoder.finish().unwrap();

        let found = KubernetesReport::locate(dir.path(), "k8s", &start, &config).unwrap();
        assert_eq!(found, path);

        let allocation: AllocationConfig = serde_yaml::from_str(CONFIG).unwrap();
        let mut report = KubernetesReport::new(&allocation, start, &user_tag_keys()).unwrap();
        report.load_file(&found).unwrap();
        assert_eq!(report.clusters(), vec!["dev-usw2a"]);
    }
}
