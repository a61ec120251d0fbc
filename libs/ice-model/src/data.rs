//! Per-product cost and usage data set for one month
//!
//! Resource data (tag groups carrying user tags) is kept in one store per
//! product service code. Non-resource data for every product shares the store
//! under the `None` key.

use crate::cost::CostAndUsage;
use crate::error::{ModelError, Result};
use crate::store::{MemoryStore, TagGroupStore};
use crate::tags::{ResourceGroup, TagGroup};
use crate::time::hours_in_month;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed CSV columns preceding the user tag columns
pub const DATA_COLUMNS: [&str; 9] = [
    "Hour",
    "Account",
    "Region",
    "Zone",
    "Product",
    "Operation",
    "UsageType",
    "Cost",
    "Usage",
];

/// Store key: product service code, `None` for non-resource data
pub type ProductKey = Option<String>;

/// Cost and usage data for one month
pub struct CostAndUsageData {
    start: DateTime<Utc>,
    num_hours: usize,
    user_tag_keys: Vec<String>,
    stores: BTreeMap<ProductKey, Arc<dyn TagGroupStore>>,
}

impl CostAndUsageData {
    pub fn new(start: DateTime<Utc>, user_tag_keys: Vec<String>) -> Self {
        Self {
            start,
            num_hours: hours_in_month(&start),
            user_tag_keys,
            stores: BTreeMap::new(),
        }
    }

    /// Override the hour count, mostly for tests working on short periods
    pub fn with_num_hours(mut self, num_hours: usize) -> Self {
        self.num_hours = num_hours;
        self
    }

    pub fn start(&self) -> &DateTime<Utc> {
        &self.start
    }

    pub fn user_tag_keys(&self) -> &[String] {
        &self.user_tag_keys
    }

    pub fn num_user_tags(&self) -> usize {
        self.user_tag_keys.len()
    }

    /// Index of a user tag key, `None` if unknown
    pub fn user_tag_index(&self, key: &str) -> Option<usize> {
        self.user_tag_keys.iter().position(|k| k == key)
    }

    /// Largest hour count over the month and all stores
    pub fn max_num(&self) -> usize {
        self.stores
            .values()
            .map(|s| s.num_hours())
            .fold(self.num_hours, usize::max)
    }

    pub fn get(&self, product: Option<&str>) -> Option<Arc<dyn TagGroupStore>> {
        self.stores.get(&product.map(str::to_string)).cloned()
    }

    /// Store for `product`, creating an empty in-memory store when absent
    pub fn get_or_create(&mut self, product: Option<&str>) -> Arc<dyn TagGroupStore> {
        let num_hours = self.num_hours;
        self.stores
            .entry(product.map(str::to_string))
            .or_insert_with(|| Arc::new(MemoryStore::new(num_hours)))
            .clone()
    }

    pub fn put(&mut self, product: Option<&str>, store: Arc<dyn TagGroupStore>) {
        self.stores.insert(product.map(str::to_string), store);
    }

    /// Product service codes that have resource data
    pub fn products(&self) -> Vec<String> {
        self.stores.keys().filter_map(|k| k.clone()).collect()
    }

    // ========================================================================
    // CSV import / export
    // ========================================================================

    /// Load a data set from CSV
    ///
    /// Columns are [`DATA_COLUMNS`] followed by one column per user tag key.
    /// Each row is stored twice: with its user tags in the product's resource
    /// store and without them in the non-resource store.
    pub fn load_csv<R: Read>(start: DateTime<Utc>, reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        for (i, expected) in DATA_COLUMNS.iter().enumerate() {
            if headers.get(i) != Some(*expected) {
                return Err(ModelError::parse(format!(
                    "expected column {} to be \"{}\", found {:?}",
                    i,
                    expected,
                    headers.get(i)
                )));
            }
        }
        let user_tag_keys: Vec<String> = headers
            .iter()
            .skip(DATA_COLUMNS.len())
            .map(str::to_string)
            .collect();
        let mut data = Self::new(start, user_tag_keys);
        let mut rows = 0usize;

        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).unwrap_or("").to_string();
            let hour: usize = field(0)
                .parse()
                .map_err(|e| ModelError::parse(format!("line {}: bad hour: {}", line + 2, e)))?;
            let cost = parse_f64(&field(7), line)?;
            let usage = parse_f64(&field(8), line)?;
            let zone = Some(field(3)).filter(|z| !z.is_empty());
            let product = field(4);
            let value = CostAndUsage::new(cost, usage);

            let non_resource = TagGroup::new(
                field(1),
                field(2),
                zone,
                product.clone(),
                field(5),
                field(6),
                None,
            );
            if data.num_user_tags() > 0 {
                let user_tags = (0..data.num_user_tags())
                    .map(|i| field(DATA_COLUMNS.len() + i))
                    .collect();
                let resource =
                    non_resource.with_resource_group(Some(ResourceGroup::new(user_tags)));
                data.get_or_create(Some(&product)).add(hour, resource, value);
            }
            data.get_or_create(None).add(hour, non_resource, value);
            rows += 1;
        }
        info!(
            "Loaded {} rows, {} products, {} user tags",
            rows,
            data.products().len(),
            data.num_user_tags()
        );
        Ok(data)
    }

    /// Write the resource data (or the non-resource data) back out as CSV
    pub fn write_csv<W: Write>(&self, writer: W, non_resource: bool) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header: Vec<&str> = DATA_COLUMNS.to_vec();
        header.extend(self.user_tag_keys.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for (key, store) in &self.stores {
            if key.is_none() != non_resource {
                continue;
            }
            for hour in 0..store.num_hours() {
                let mut rows = store.hour_data(hour);
                rows.sort_by(|a, b| a.0.cmp(&b.0));
                for (tg, value) in rows {
                    let mut record = vec![
                        hour.to_string(),
                        tg.account.clone(),
                        tg.region.clone(),
                        tg.zone.clone().unwrap_or_default(),
                        tg.product.clone(),
                        tg.operation.clone(),
                        tg.usage_type.clone(),
                        value.cost.to_string(),
                        value.usage.to_string(),
                    ];
                    for i in 0..self.user_tag_keys.len() {
                        record.push(tg.user_tag(i).to_string());
                    }
                    wtr.write_record(&record)?;
                }
            }
        }
        wtr.flush()?;
        debug!("Wrote {} data set", if non_resource { "non-resource" } else { "resource" });
        Ok(())
    }
}

fn parse_f64(s: &str, line: usize) -> Result<f64> {
    if s.is_empty() {
        return Ok(0.0);
    }
    s.parse()
        .map_err(|e| ModelError::parse(format!("line {}: bad number \"{}\": {}", line + 2, s, e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::time::parse_month;

    const CSV: &str = "\
Hour,Account,Region,Zone,Product,Operation,UsageType,Cost,Usage,Env,Team
0,111,us-east-1,us-east-1a,EC2Instance,RunInstances,m5.large,10,1,prod,web
0,111,us-east-1,us-east-1a,EC2Instance,RunInstances,m5.large,5,1,dev,web
1,111,us-east-1,,AmazonS3,GetObject,Requests,2,100,,
";

    #[test]
    fn test_load_splits_resource_and_non_resource() {
        let data = CostAndUsageData::load_csv(parse_month("2019-11").unwrap(), CSV.as_bytes()).unwrap();
        assert_eq!(data.user_tag_keys(), &["Env".to_string(), "Team".to_string()]);
        assert_eq!(data.products(), vec!["AmazonS3".to_string(), "EC2Instance".to_string()]);
        assert_eq!(data.max_num(), 720);

        let non_resource = data.get(None).unwrap();
        let tg = TagGroup::new("111", "us-east-1", Some("us-east-1a".into()), "EC2Instance", "RunInstances", "m5.large", None);
        assert_eq!(non_resource.get(0, &tg), Some(CostAndUsage::new(15.0, 2.0)));

        let ec2 = data.get(Some("EC2Instance")).unwrap();
        assert_eq!(ec2.tag_groups().len(), 2);
        let s3 = data.get(Some("AmazonS3")).unwrap();
        assert_eq!(s3.tag_groups()[0].zone, None);
    }

    #[test]
    fn test_write_round_trip() {
        let start = parse_month("2019-11").unwrap();
        let data = CostAndUsageData::load_csv(start, CSV.as_bytes()).unwrap();
        let mut out = Vec::new();
        data.write_csv(&mut out, false).unwrap();
        let reloaded = CostAndUsageData::load_csv(start, out.as_slice()).unwrap();
        assert_eq!(
            reloaded.get(Some("EC2Instance")).unwrap().tag_groups(),
            data.get(Some("EC2Instance")).unwrap().tag_groups()
        );
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let start = parse_month("2019-11").unwrap();
        let err = CostAndUsageData::load_csv(start, "Hour,Acct\n".as_bytes());
        assert!(err.is_err());
    }
}
