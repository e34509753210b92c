//! Company-record extraction from rendered result pages.
//!
//! A pure function of the page HTML, so it can be tested against fixture
//! snapshots without a browser. The pipeline is heuristic and
//! order-dependent:
//!
//! 1. select candidate rows by structural markers
//! 2. take the first anchor/heading in each row as the name
//! 3. find a shipment-count phrase, structurally first, then by regex
//! 4. drop duplicates, navigation text and very short names
//! 5. keep only names carrying a corporate-entity marker
//!
//! It never fails: a page that cannot be processed yields a
//! [`PageExtraction`] carrying only an error message.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ROW_SELECTORS: &[&str] = &[
    "tr",
    "li",
    "article",
    "div[class*='company']",
    "div[class*='result']",
    "div[class*='card']",
    "div[class*='row']",
];

const NAME_SELECTORS: &str = "a, h1, h2, h3, h4, h5, [class*='name'], strong";

const SHIPMENT_SELECTORS: &str = "[class*='shipment'], [class*='count'], small, span";

const MATCHING_SHIPMENTS: &str = r"(?i)\b(\d[\d,.]*\s?[km]?\+?)\s+matching\s+shipments?\b";

const TOTAL_SHIPMENTS: &str = r"(?i)\b(\d[\d,.]*\s?[km]?\+?)\s+shipments?\s+total\b";

const MIN_NAME_CHARS: usize = 3;

/// Pagination and banner labels that are structurally rows but never companies.
const NAVIGATION_TEXT: &[&str] = &[
    "next",
    "previous",
    "prev",
    "first",
    "last",
    "more",
    "show more",
    "load more",
    "view more",
    "view all",
    "see all",
    "back",
    "home",
    "search",
    "buyer",
    "buyers",
    "supplier",
    "suppliers",
];

const BANNER_PREFIXES: &[&str] = &["top buyers", "top suppliers", "buyers of", "suppliers of", "page "];

/// Tokens that mark a name as a legal entity.
const CORPORATE_MARKERS: &[&str] = &[
    "inc",
    "incorporated",
    "ltd",
    "limited",
    "llc",
    "llp",
    "lp",
    "corp",
    "corporation",
    "co",
    "company",
    "gmbh",
    "ag",
    "sa",
    "sas",
    "srl",
    "spa",
    "bv",
    "nv",
    "plc",
    "pty",
    "pte",
    "kg",
    "oy",
    "ab",
    "group",
    "holdings",
    "industries",
    "international",
    "trading",
    "enterprises",
    "manufacturing",
    "logistics",
    "supply",
    "supplies",
];

/// One company hit on a result page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub name: String,
    /// Raw phrase such as "1.2K matching shipments".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipment_summary: Option<String>,
    /// Count token from the summary, e.g. "1.2K" or "500+".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipment_count: Option<String>,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageExtraction {
    pub companies: Vec<CompanyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

impl PageExtraction {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            companies: Vec::new(),
            error: Some(error.into()),
            extracted_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

struct Patterns {
    rows: Vec<Selector>,
    names: Selector,
    shipments: Selector,
    phrases: [Regex; 2],
}

impl Patterns {
    fn compile() -> Result<Self, String> {
        let rows = ROW_SELECTORS
            .iter()
            .map(|s| Selector::parse(s).map_err(|e| format!("row selector {s}: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        let names = Selector::parse(NAME_SELECTORS).map_err(|e| format!("name selector: {e}"))?;
        let shipments =
            Selector::parse(SHIPMENT_SELECTORS).map_err(|e| format!("shipment selector: {e}"))?;
        let matching = Regex::new(MATCHING_SHIPMENTS).map_err(|e| e.to_string())?;
        let total = Regex::new(TOTAL_SHIPMENTS).map_err(|e| e.to_string())?;
        Ok(Self {
            rows,
            names,
            shipments,
            phrases: [matching, total],
        })
    }

    fn shipment_phrase(&self, text: &str) -> Option<(String, String)> {
        self.phrases.iter().find_map(|re| {
            let caps = re.captures(text)?;
            let summary = caps.get(0)?.as_str().to_string();
            let count: String = caps
                .get(1)?
                .as_str()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            Some((summary, count))
        })
    }

    fn strip_phrases(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.phrases {
            out = re.replace_all(&out, " ").into_owned();
        }
        out
    }
}

/// Extract deduplicated company records from a rendered page.
pub fn extract_companies(html: &str) -> PageExtraction {
    if html.trim().is_empty() {
        return PageExtraction::failed("empty page content");
    }
    let patterns = match Patterns::compile() {
        Ok(patterns) => patterns,
        Err(e) => return PageExtraction::failed(format!("extraction patterns invalid: {e}")),
    };

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut companies = Vec::new();
    let mut candidates = 0usize;

    for selector in &patterns.rows {
        for row in document.select(selector) {
            candidates += 1;
            let Some(record) = extract_row(&patterns, row) else {
                continue;
            };
            let key = dedup_key(&record.name);
            if is_navigation(&key) || record.name.chars().count() < MIN_NAME_CHARS {
                continue;
            }
            if seen.insert(key) {
                companies.push(record);
            }
        }
    }

    let before_filter = companies.len();
    companies.retain(|c| has_corporate_marker(&dedup_key(&c.name)));
    debug!(
        candidates,
        unique = before_filter,
        kept = companies.len(),
        "extracted company records"
    );

    PageExtraction {
        companies,
        error: None,
        extracted_at: Utc::now(),
    }
}

fn extract_row(patterns: &Patterns, row: ElementRef<'_>) -> Option<CompanyRecord> {
    let name = row
        .select(&patterns.names)
        .map(|el| clean_name(&patterns.strip_phrases(&element_text(el))))
        .find(|name| !name.is_empty())?;

    let shipment = row
        .select(&patterns.shipments)
        .find_map(|el| patterns.shipment_phrase(&element_text(el)))
        .or_else(|| patterns.shipment_phrase(&element_text(row)));

    let (shipment_summary, shipment_count) = match shipment {
        Some((summary, count)) => (Some(summary), Some(count)),
        None => (None, None),
    };
    Some(CompanyRecord {
        name,
        shipment_summary,
        shipment_count,
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_name(text: &str) -> String {
    collapse_whitespace(text)
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '|' | '·' | ':' | ','))
        .to_string()
}

/// Case- and punctuation-insensitive identity of a company name.
fn dedup_key(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&lowered)
}

fn is_navigation(key: &str) -> bool {
    if key.is_empty() || key.chars().all(|c| c.is_ascii_digit() || c == ' ') {
        return true;
    }
    NAVIGATION_TEXT.contains(&key) || BANNER_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn has_corporate_marker(key: &str) -> bool {
    key.split(' ').any(|token| CORPORATE_MARKERS.contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(rows: &[&str]) -> String {
        let body: String = rows.iter().map(|r| format!("<tr>{r}</tr>")).collect();
        format!("<html><body><table>{body}</table></body></html>")
    }

    #[test]
    fn test_case_variants_are_deduplicated() {
        let html = table(&[
            r#"<td><a href="/c/1">Acme Inc</a></td><td>12 matching shipments</td>"#,
            r#"<td><a href="/c/2">ACME INC.</a></td><td>40 shipments total</td>"#,
        ]);
        let result = extract_companies(&html);
        assert_eq!(result.companies.len(), 1);
        assert_eq!(result.companies[0].name, "Acme Inc");
        assert_eq!(result.companies[0].shipment_count.as_deref(), Some("12"));
    }

    #[test]
    fn test_pagination_row_is_excluded() {
        let html = format!(
            "{}<ul><li><a href='?page=2'>Next</a></li><li><a href='?page=1'>Previous</a></li></ul>",
            table(&[r#"<td><a>Globex Corp</a></td>"#])
        );
        let result = extract_companies(&html);
        let names: Vec<_> = result.companies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Globex Corp"]);
    }

    #[test]
    fn test_shipment_phrase_is_stripped_from_name() {
        let html = table(&[r#"<td><a>Initech Ltd 1.2K matching shipments</a></td>"#]);
        let record = &extract_companies(&html).companies[0];
        assert_eq!(record.name, "Initech Ltd");
        assert_eq!(record.shipment_summary.as_deref(), Some("1.2K matching shipments"));
        assert_eq!(record.shipment_count.as_deref(), Some("1.2K"));
    }

    #[test]
    fn test_structural_shipment_element_wins_over_row_text() {
        let html = r#"
            <div class="company-card">
                <h3>Umbrella Supply</h3>
                <p>Previously 9 shipments total</p>
                <span class="shipment-count">500+ matching shipments</span>
            </div>"#;
        let record = &extract_companies(html).companies[0];
        assert_eq!(record.shipment_count.as_deref(), Some("500+"));
    }

    #[test]
    fn test_row_text_fallback_for_shipments() {
        let html = table(&[r#"<td><a>Hooli LLC</a></td><td>about 75 shipments total</td>"#]);
        let record = &extract_companies(&html).companies[0];
        assert_eq!(record.shipment_summary.as_deref(), Some("75 shipments total"));
    }

    #[test]
    fn test_rows_without_marker_or_name_are_dropped() {
        let html = table(&[
            "<th>Company</th><th>Shipments</th>",
            "<td><a>Contact us</a></td>",
            "<td><a>Top Buyers of Acme Inc</a></td>",
            "<td><a>Co</a></td>",
            "<td><a>Vandelay Industries</a></td>",
        ]);
        let names: Vec<_> = extract_companies(&html)
            .companies
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Vandelay Industries"]);
    }

    #[test]
    fn test_marker_must_be_a_whole_token() {
        let html = table(&["<td><a>Magic Widgets</a></td>"]);
        assert!(extract_companies(&html).companies.is_empty());
    }

    #[test]
    fn test_empty_page_reports_error() {
        let result = extract_companies("   ");
        assert!(result.is_failed());
        assert!(result.companies.is_empty());
    }

    #[test]
    fn test_page_without_rows_is_empty_not_failed() {
        let result = extract_companies("<html><body><p>No results</p></body></html>");
        assert!(!result.is_failed());
        assert!(result.companies.is_empty());
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        (
            "[a-z]{3,8}",
            prop::sample::select(vec!["Inc", "Ltd", "LLC", "Corp", "Company", "AG", "Supply"]),
            any::<bool>(),
        )
            .prop_map(|(base, marker, upper)| {
                let name = format!("Q{base} {marker}");
                if upper {
                    name.to_uppercase()
                } else {
                    name
                }
            })
    }

    proptest! {
        #[test]
        fn prop_one_record_per_distinct_name(names in prop::collection::vec(name_strategy(), 1..20)) {
            let rows: Vec<String> = names
                .iter()
                .map(|n| format!("<td><a>{n}</a></td>"))
                .collect();
            let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
            let result = extract_companies(&table(&row_refs));

            let distinct: HashSet<String> = names.iter().map(|n| dedup_key(n)).collect();
            prop_assert_eq!(result.companies.len(), distinct.len());

            let keys: HashSet<String> = result.companies.iter().map(|c| dedup_key(&c.name)).collect();
            prop_assert_eq!(keys, distinct);
        }
    }
}
