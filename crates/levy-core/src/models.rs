use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, ErrorKind};

/// One unit of extraction work: a single property's tax bill.
///
/// Immutable once it has been handed to the job manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Caller-chosen identifier, unique within a job (e.g. the property id).
    pub id: String,
    /// Jurisdiction name as the portfolio records it ("Harris County, TX").
    pub jurisdiction: String,
    /// Tax bill or search page URL.
    pub url: String,
    #[serde(default)]
    pub account: Option<String>,
    /// Fields already known before extraction; extracted values win.
    #[serde(default)]
    pub known_fields: ExtractedFields,
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        jurisdiction: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            jurisdiction: jurisdiction.into(),
            url: url.into(),
            account: None,
            known_fields: ExtractedFields::default(),
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_known_fields(mut self, fields: ExtractedFields) -> Self {
        self.known_fields = fields;
        self
    }
}

/// Fields pulled off a tax bill page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_due: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_year_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        *self == ExtractedFields::default()
    }

    /// Fill every field that is missing in `self` from `fallback`.
    pub fn merged_over(mut self, fallback: &ExtractedFields) -> Self {
        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }
        fill(&mut self.amount_due, &fallback.amount_due);
        fill(&mut self.previous_year_amount, &fallback.previous_year_amount);
        fill(&mut self.property_address, &fallback.property_address);
        fill(&mut self.account_number, &fallback.account_number);
        fill(&mut self.owner_name, &fallback.owner_name);
        fill(&mut self.due_date, &fallback.due_date);
        self
    }
}

/// The strategy family a jurisdiction is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyFamily {
    /// Plain HTTP request and response parsing.
    DirectFetch,
    /// A (blocking) browser driver navigating the page.
    BrowserAutomation,
    Unsupported,
}

impl StrategyFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyFamily::DirectFetch => "direct-fetch",
            StrategyFamily::BrowserAutomation => "browser-automation",
            StrategyFamily::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for StrategyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyFamily {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct-fetch" | "direct" | "cloud" | "http" => Ok(StrategyFamily::DirectFetch),
            "browser-automation" | "browser" | "selenium" | "playwright" => {
                Ok(StrategyFamily::BrowserAutomation)
            }
            "unsupported" => Ok(StrategyFamily::Unsupported),
            other => Err(AppError::ConfigError(format!(
                "Unknown strategy family: {other}"
            ))),
        }
    }
}

/// Final result of extracting one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub item_id: String,
    pub success: bool,
    pub fields: ExtractedFields,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub strategy: StrategyFamily,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Number of attempts the resilience controller made.
    pub attempts: u32,
    /// SHA-256 of the serialized fields, for change detection in the store.
    pub data_hash: String,
    pub finished_at: DateTime<Utc>,
}

impl ExtractionOutcome {
    pub fn succeeded(
        item_id: impl Into<String>,
        fields: ExtractedFields,
        strategy: StrategyFamily,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        let data_hash = compute_hash(&serde_json::to_string(&fields).unwrap_or_default());
        Self {
            item_id: item_id.into(),
            success: true,
            fields,
            error: None,
            error_kind: None,
            strategy,
            duration,
            attempts,
            data_hash,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        item_id: impl Into<String>,
        error: &AppError,
        strategy: StrategyFamily,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            fields: ExtractedFields::default(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            strategy,
            duration,
            attempts,
            data_hash: String::new(),
            finished_at: Utc::now(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
