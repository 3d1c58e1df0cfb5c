//! Field extraction: turns recognized text lines into structured address
//! fields. Pure parsing, no I/O.
//!
//! A line can contribute at most one field kind: the first line that looks
//! like a bare street number wins that slot, likewise the first unit marker;
//! street-name fragments accumulate across lines and are joined in line
//! order. The result's confidence is the minimum OCR confidence among the
//! contributing lines, or 0.0 when nothing was extracted.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::services::inference::TextLine;

static STREET_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d{1,5}[A-Z]?$").expect("street number regex"));

static UNIT_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Apt|Unit|#|Suite)\s*\d+[A-Z]?").expect("unit regex"));

static STREET_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(Street|St|Avenue|Ave|Road|Rd|Drive|Dr|Lane|Ln|Court|Ct|Boulevard|Blvd|Way|Place|Pl|Circle|Cir|Close|Terrace|Ter|Trail|Trl|Park|Parkway|Pkwy)\b",
    )
    .expect("street type regex")
});

static PROPER_NOUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-z]{2,}$").expect("proper noun regex"));

/// Words that look like standalone proper nouns on shipping labels but are
/// never street names.
static NON_STREET_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "The", "Dear", "Customer", "Proof", "Delivery", "Tracking", "Number", "Weight",
        "Service", "Shipped", "Billed", "Delivered", "Left", "Reference", "Please", "Print",
        "Sincerely", "Front", "Door",
    ]
    .into_iter()
    .collect()
});

/// Structured address fields parsed from OCR output.
#[derive(Debug, Clone, Default)]
pub struct AddressFields {
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub unit_number: Option<String>,
    /// Minimum confidence among contributing lines; 0.0 if none contributed.
    pub confidence: f64,
}

impl AddressFields {
    /// True when no field could be parsed from any line.
    pub fn is_empty(&self) -> bool {
        self.street_number.is_none() && self.street_name.is_none() && self.unit_number.is_none()
    }
}

fn parse_street_number(text: &str) -> Option<String> {
    STREET_NUMBER.find(text.trim()).map(|m| m.as_str().to_string())
}

fn parse_unit_number(text: &str) -> Option<String> {
    UNIT_NUMBER.find(text).map(|m| m.as_str().to_string())
}

fn parse_street_name(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if STREET_TYPE.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    if PROPER_NOUN.is_match(trimmed) && !NON_STREET_WORDS.contains(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

/// Extract address fields from recognized lines.
pub fn extract_address(lines: &[TextLine]) -> AddressFields {
    let mut fields = AddressFields::default();
    let mut name_parts: Vec<String> = Vec::new();
    let mut min_confidence: Option<f64> = None;

    for line in lines {
        let mut contributed = false;

        if fields.street_number.is_none() {
            if let Some(number) = parse_street_number(&line.text) {
                fields.street_number = Some(number);
                contributed = true;
            }
        }
        if fields.unit_number.is_none() {
            if let Some(unit) = parse_unit_number(&line.text) {
                fields.unit_number = Some(unit);
                contributed = true;
            }
        }
        if let Some(name) = parse_street_name(&line.text) {
            name_parts.push(name);
            contributed = true;
        }

        if contributed {
            min_confidence = Some(match min_confidence {
                Some(current) => current.min(line.confidence),
                None => line.confidence,
            });
        }
    }

    if !name_parts.is_empty() {
        fields.street_name = Some(name_parts.join(" "));
    }
    fields.confidence = min_confidence.unwrap_or(0.0);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, confidence: f64) -> TextLine {
        TextLine { text: text.to_string(), confidence }
    }

    #[test]
    fn extracts_number_and_street_type_name() {
        let fields = extract_address(&[line("68", 0.99), line("ORCHARD CLOSE", 0.97)]);
        assert_eq!(fields.street_number.as_deref(), Some("68"));
        assert_eq!(fields.street_name.as_deref(), Some("ORCHARD CLOSE"));
        assert_eq!(fields.unit_number, None);
        assert!((fields.confidence - 0.97).abs() < 1e-9);
    }

    #[test]
    fn extracts_unit_markers() {
        for text in ["Apt 4B", "Unit 12", "# 7", "Suite 100"] {
            let fields = extract_address(&[line(text, 0.96)]);
            assert_eq!(fields.unit_number.as_deref(), Some(text), "failed on {text}");
        }
    }

    #[test]
    fn street_number_allows_trailing_letter_only() {
        assert_eq!(
            extract_address(&[line("1234B", 0.99)]).street_number.as_deref(),
            Some("1234B")
        );
        assert_eq!(extract_address(&[line("123456", 0.99)]).street_number, None);
        assert_eq!(extract_address(&[line("68 West", 0.99)]).street_number, None);
    }

    #[test]
    fn first_street_number_wins() {
        let fields = extract_address(&[line("68", 0.99), line("75", 0.99)]);
        assert_eq!(fields.street_number.as_deref(), Some("68"));
    }

    #[test]
    fn label_boilerplate_is_not_a_street_name() {
        let fields = extract_address(&[
            line("Delivered", 0.99),
            line("Tracking", 0.99),
            line("Front", 0.99),
        ]);
        assert_eq!(fields.street_name, None);
        assert!(fields.is_empty());
    }

    #[test]
    fn proper_noun_fragments_join_in_order() {
        let fields = extract_address(&[line("Orchard", 0.98), line("Maple Ave", 0.96)]);
        assert_eq!(fields.street_name.as_deref(), Some("Orchard Maple Ave"));
    }

    #[test]
    fn confidence_is_minimum_of_contributing_lines() {
        let fields = extract_address(&[
            line("68", 0.99),
            line("ORCHARD CLOSE", 0.80),
            line("noise #@!", 0.10), // contributes nothing, must not drag the min
        ]);
        assert!((fields.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn no_fields_means_zero_confidence() {
        let fields = extract_address(&[line("~~~", 0.99)]);
        assert!(fields.is_empty());
        assert_eq!(fields.confidence, 0.0);
    }
}
