//! Regex-based tax bill parser.
//!
//! Reduces a page to its visible text (one text node per line) with
//! `scraper`, then runs ordered label patterns over it. The first pattern
//! that matches wins for each field.

use levy_core::error::AppError;
use levy_core::models::{ExtractedFields, WorkItem};
use levy_core::traits::FieldParser;
use regex::Regex;
use scraper::Html;

const AMOUNT: &str = r"\$?\s*([\d,]+(?:\.\d{1,2})?)";

const AMOUNT_LABELS: &[&str] = &[
    r"Total\s+Amount\s+Due",
    r"Total\s+Tax\s+Due",
    r"Amount\s+Due",
    r"Total\s+Due",
    r"Balance\s+Due",
    r"Tax\s+Due",
    r"Pay\s*(?:This\s*)?Amount",
    r"(?:Total|Tax|Amount|Balance)\s*(?:Owed|Payable)",
];

const PREVIOUS_YEAR_LABELS: &[&str] = &[r"(?:Previous|Prior|Last)\s+Year(?:'s)?\s*(?:Taxes|Tax|Amount)?"];

const ADDRESS: &str = r"(?i)(?:Property|Situs|Physical)\s+Address[:\s]+([^\n]+)";
const ACCOUNT: &str = r"(?i)(?:Account|Acct|Parcel)\s*(?:No\.?|Number|#)?[\s#:]*([A-Z0-9][A-Z0-9\-]+)";
const OWNER: &str = r"(?i)Owner(?:\s+Name)?[:\s]+([^\n]+)";
const DUE_DATE: &str = r"(?i)(?:Due\s+Date|Payment\s+Due|Due\s+By)[\s:]*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})";

/// Field extraction from rendered or fetched bill pages.
#[derive(Clone)]
pub struct PatternParser {
    amount: Vec<Regex>,
    previous_year: Vec<Regex>,
    address: Regex,
    account: Regex,
    owner: Regex,
    due_date: Regex,
}

fn compile(pattern: &str) -> Result<Regex, AppError> {
    Regex::new(pattern).map_err(|e| AppError::ConfigError(format!("bad pattern '{pattern}': {e}")))
}

fn money(label: &str) -> Result<Regex, AppError> {
    compile(&format!(r"(?i){label}[:\s]*{AMOUNT}"))
}

impl PatternParser {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            amount: AMOUNT_LABELS.iter().map(|l| money(l)).collect::<Result<_, _>>()?,
            previous_year: PREVIOUS_YEAR_LABELS
                .iter()
                .map(|l| money(l))
                .collect::<Result<_, _>>()?,
            address: compile(ADDRESS)?,
            account: compile(ACCOUNT)?,
            owner: compile(OWNER)?,
            due_date: compile(DUE_DATE)?,
        })
    }

    /// Try `label` (a regex) ahead of the built-in amount labels.
    pub fn with_amount_label(mut self, label: &str) -> Result<Self, AppError> {
        self.amount.insert(0, money(label)?);
        Ok(self)
    }

    fn extract(&self, text: &str) -> ExtractedFields {
        // Previous-year lines must not be read as the current amount.
        let current = self
            .previous_year
            .iter()
            .fold(text.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());

        ExtractedFields {
            amount_due: first_amount(&self.amount, &current),
            previous_year_amount: first_amount(&self.previous_year, text),
            property_address: capture(&self.address, text),
            account_number: capture(&self.account, text),
            owner_name: capture(&self.owner, text),
            due_date: capture(&self.due_date, text),
        }
    }
}

impl FieldParser for PatternParser {
    fn parse(&self, content: &str, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        let text = visible_text(content);
        let fields = self.extract(&text);
        if fields.amount_due.is_none() {
            return Err(AppError::ParseError(format!(
                "no amount due found for {} ({} chars of text)",
                item.id,
                text.len()
            )));
        }
        tracing::debug!(item_id = %item.id, amount_due = ?fields.amount_due, "Parsed tax bill");
        Ok(fields)
    }
}

fn first_amount(patterns: &[Regex], text: &str) -> Option<f64> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse().ok())
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Text nodes outside script/style, trimmed, one per line.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }
    lines.join("\n")
}
