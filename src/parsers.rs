//! Instruction-aware parsing of extracted page text.
//!
//! After a successful extract step the raw text is matched against the
//! instruction's intent: roasting dates for coffee monitors, kr/$ prices,
//! titles. Parsed fields are merged into the run's extracted data.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static ROASTING_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Rostningsdatum\s+(\d{4}-\d{2}-\d{2})").unwrap());
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
static SEK_PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*kr").unwrap());
static USD_PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+\.?\d*)").unwrap());
static TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static H1_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap());

/// Normalize whitespace by collapsing runs into single spaces.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Match raw extracted text against the instruction's intent and return the
/// structured fields it implies. Empty when nothing matches.
pub fn parse_extracted(instruction: &str, raw: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    let intent = instruction.to_lowercase();

    if intent.contains("roast") || intent.contains("date") {
        parse_dates(raw, &mut fields);
    }
    if intent.contains("price") || intent.contains("cost") {
        parse_price(raw, &mut fields);
    }
    if intent.contains("title") || intent.contains("name") {
        parse_title(raw, &mut fields);
    }

    fields
}

fn parse_dates(raw: &str, fields: &mut Map<String, Value>) {
    if let Some(captures) = ROASTING_DATE.captures(raw) {
        fields.insert(
            "roastingDate".to_string(),
            Value::String(captures[1].to_string()),
        );
        return;
    }

    let mut dates: Vec<String> = ISO_DATE
        .find_iter(raw)
        .map(|found| found.as_str().to_string())
        .collect();
    if dates.is_empty() {
        return;
    }
    // Most recent first; ISO dates sort lexicographically.
    dates.sort_by(|a, b| b.cmp(a));
    dates.dedup();
    fields.insert(
        "roastingDate".to_string(),
        Value::String(dates[0].clone()),
    );
    fields.insert(
        "allDatesFound".to_string(),
        Value::Array(dates.into_iter().map(Value::String).collect()),
    );
}

fn parse_price(raw: &str, fields: &mut Map<String, Value>) {
    if let Some(captures) = SEK_PRICE.captures(raw) {
        if let Ok(amount) = captures[1].parse::<i64>() {
            fields.insert("price".to_string(), Value::from(amount));
            fields.insert("currency".to_string(), Value::String("SEK".to_string()));
            return;
        }
    }
    if let Some(captures) = USD_PRICE.captures(raw) {
        if let Ok(amount) = captures[1].parse::<f64>() {
            fields.insert("price".to_string(), Value::from(amount));
            fields.insert("currency".to_string(), Value::String("USD".to_string()));
        }
    }
}

fn parse_title(raw: &str, fields: &mut Map<String, Value>) {
    let candidate = TITLE_TAG
        .captures(raw)
        .or_else(|| H1_TAG.captures(raw))
        .map(|captures| normalize_whitespace(&captures[1]));
    match candidate {
        Some(title) if !title.is_empty() => {
            fields.insert("title".to_string(), Value::String(title));
        }
        _ => {
            // Plain-text extractions carry no markup; short text is the title.
            let trimmed = normalize_whitespace(raw);
            if !trimmed.is_empty() && trimmed.len() <= 200 {
                fields.insert("title".to_string(), Value::String(trimmed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_roasting_date_wins_over_other_dates() {
        let text = "Skordad 2025-05-01. Rostningsdatum 2025-07-02. Bast fore 2026-01-01.";
        let fields = parse_extracted("watch the roast date", text);
        assert_eq!(fields["roastingDate"], "2025-07-02");
        assert!(!fields.contains_key("allDatesFound"));
    }

    #[test]
    fn unlabeled_dates_sort_descending() {
        let text = "batch 2025-06-10, packed 2025-07-01, sold 2025-05-20";
        let fields = parse_extracted("find the packing date", text);
        assert_eq!(fields["roastingDate"], "2025-07-01");
        let all = fields["allDatesFound"].as_array().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], "2025-07-01");
    }

    #[test]
    fn sek_prices_take_precedence() {
        let fields = parse_extracted("check the price", "Pris: 165 kr (ca $15.50)");
        assert_eq!(fields["price"], 165);
        assert_eq!(fields["currency"], "SEK");
    }

    #[test]
    fn usd_prices_parse_decimals() {
        let fields = parse_extracted("what does it cost", "Now only $12.99!");
        assert_eq!(fields["price"], 12.99);
        assert_eq!(fields["currency"], "USD");
    }

    #[test]
    fn titles_come_from_markup_first() {
        let html = "<html><title>Example Domain</title><h1>Other</h1></html>";
        let fields = parse_extracted("get the page title", html);
        assert_eq!(fields["title"], "Example Domain");
    }

    #[test]
    fn plain_text_short_extracts_count_as_title() {
        let fields = parse_extracted("get the page title", "Example Domain");
        assert_eq!(fields["title"], "Example Domain");
    }

    #[test]
    fn unrelated_instructions_parse_nothing() {
        let fields = parse_extracted("count the links", "165 kr on 2025-07-02");
        assert!(fields.is_empty());
    }
}
