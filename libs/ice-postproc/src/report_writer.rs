//! CSV output of a processed data set

use crate::allocation_report::is_gzip;
use crate::error::{PostProcError, Result};
use crate::processor::MetadataServices;
use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use ice_model::time::ISO_FORMAT;
use ice_model::{CostAndUsage, CostAndUsageData, TagGroup, TagKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Time resolution of report rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportAggregation {
    #[default]
    Hourly,
    Daily,
    Monthly,
}

impl ReportAggregation {
    fn slot(&self, hour: usize) -> usize {
        match self {
            ReportAggregation::Hourly => hour,
            ReportAggregation::Daily => hour / 24,
            ReportAggregation::Monthly => 0,
        }
    }

    fn slot_start(&self, start: &DateTime<Utc>, slot: usize) -> DateTime<Utc> {
        match self {
            ReportAggregation::Hourly => *start + Duration::hours(slot as i64),
            ReportAggregation::Daily => *start + Duration::days(slot as i64),
            ReportAggregation::Monthly => *start,
        }
    }
}

impl fmt::Display for ReportAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportAggregation::Hourly => f.write_str("hourly"),
            ReportAggregation::Daily => f.write_str("daily"),
            ReportAggregation::Monthly => f.write_str("monthly"),
        }
    }
}

impl FromStr for ReportAggregation {
    type Err = PostProcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(ReportAggregation::Hourly),
            "daily" => Ok(ReportAggregation::Daily),
            "monthly" => Ok(ReportAggregation::Monthly),
            other => Err(PostProcError::config(format!(
                "Unknown report aggregation \"{}\", expected hourly, daily or monthly",
                other
            ))),
        }
    }
}

/// Writes `Date, Cost, Usage, <dimensions>, <user tags>` rows
pub struct ReportWriter<'a> {
    services: &'a MetadataServices,
    aggregation: ReportAggregation,
    non_resource: bool,
}

impl<'a> ReportWriter<'a> {
    pub fn new(services: &'a MetadataServices, aggregation: ReportAggregation) -> Self {
        Self {
            services,
            aggregation,
            non_resource: false,
        }
    }

    /// Write the non-resource data instead of the per-product resource data
    pub fn non_resource(mut self, non_resource: bool) -> Self {
        self.non_resource = non_resource;
        self
    }

    pub fn header(&self, data: &CostAndUsageData) -> Vec<String> {
        let mut header = vec!["Date".to_string(), "Cost".to_string(), "Usage".to_string()];
        for key in TagKey::ALL {
            if key == TagKey::Account {
                header.push("Account ID".to_string());
                header.push("Account Name".to_string());
            } else {
                header.push(key.column_name().to_string());
            }
        }
        if !self.non_resource {
            header.extend(data.user_tag_keys().iter().cloned());
        }
        header
    }

    /// Sum the data into report slots
    fn collect(&self, data: &CostAndUsageData) -> Vec<BTreeMap<TagGroup, CostAndUsage>> {
        let mut slots: Vec<BTreeMap<TagGroup, CostAndUsage>> = Vec::new();
        let products: Vec<Option<String>> = if self.non_resource {
            vec![None]
        } else {
            data.products().into_iter().map(Some).collect()
        };
        for product in products {
            let Some(store) = data.get(product.as_deref()) else {
                continue;
            };
            for hour in 0..store.num_hours() {
                let slot = self.aggregation.slot(hour);
                if slots.len() <= slot {
                    slots.resize_with(slot + 1, BTreeMap::new);
                }
                for (tg, value) in store.hour_data(hour) {
                    *slots[slot].entry(tg).or_insert(CostAndUsage::ZERO) += value;
                }
            }
        }
        slots
    }

    /// Write the report, returning the number of rows
    pub fn write_csv<W: Write>(&self, writer: W, data: &CostAndUsageData) -> Result<usize> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.header(data))?;

        let num_user_tags = if self.non_resource { 0 } else { data.num_user_tags() };
        let mut cost_buffer = ryu::Buffer::new();
        let mut usage_buffer = ryu::Buffer::new();
        let mut rows = 0;
        for (slot, values) in self.collect(data).into_iter().enumerate() {
            let date = self
                .aggregation
                .slot_start(data.start(), slot)
                .format(ISO_FORMAT)
                .to_string();
            for (tg, value) in values {
                if value.is_zero() {
                    continue;
                }
                let account = self.services.accounts.get_account_by_id(&tg.account);
                let mut record: Vec<&str> = vec![
                    date.as_str(),
                    cost_buffer.format(value.cost),
                    usage_buffer.format(value.usage),
                    tg.account.as_str(),
                    account.name.as_str(),
                    tg.region.as_str(),
                    tg.zone.as_deref().unwrap_or(""),
                    tg.product.as_str(),
                    tg.operation.as_str(),
                    tg.usage_type.as_str(),
                ];
                record.extend((0..num_user_tags).map(|i| tg.user_tag(i)));
                wtr.write_record(&record)?;
                rows += 1;
            }
        }
        wtr.flush()?;
        Ok(rows)
    }

    /// Write the report to `path`, gzipped when it ends in `.gz`
    pub fn write_file(&self, path: &Path, data: &CostAndUsageData) -> Result<usize> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = BufWriter::new(File::create(path)?);
        let rows = if is_gzip(path) {
            let mut encoder = GzEncoder::new(file, Compression::default());
            let rows = self.write_csv(&mut encoder, data)?;
            encoder.finish()?;
            rows
        } else {
            self.write_csv(file, data)?
        };
        info!(
            "Wrote {} {} report rows to {}",
            rows,
            self.aggregation,
            path.display()
        );
        Ok(rows)
    }
}
