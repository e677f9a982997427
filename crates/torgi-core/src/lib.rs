//! Core domain model and snapshot-selection primitives for the torgi
//! open-data harvester.

use std::sync::OnceLock;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "torgi-core";

/// One dataset category from the portal's top-level manifest (`list.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default, alias = "title")]
    pub name: Option<String>,
    #[serde(default, alias = "identifier")]
    pub code: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Entries occasionally arrive without a link; they decode anyway and
    /// fail later at fetch time, as a skippable item.
    #[serde(default)]
    pub link: String,
}

impl CatalogEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("untitled dataset")
    }
}

/// Per-category manifest (`meta.json`) listing the published snapshot files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryManifest {
    #[serde(default)]
    pub data: Vec<SnapshotDescriptor>,
}

/// One dated snapshot publication inside a category manifest. Immutable
/// upstream; every field other than `source` is optional in practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub source: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub provenance: Option<String>,
    #[serde(default)]
    pub valid: Option<String>,
    #[serde(default)]
    pub structure: Option<String>,
}

impl SnapshotDescriptor {
    /// Calendar range covered by the snapshot, read from the source URL
    /// (`data-YYYYMMDDT0000-YYYYMMDDT0000-...`) with the `valid` marker as a
    /// single-day fallback.
    pub fn date_range(&self) -> Option<DateRange> {
        if let Some(caps) = url_range_regex().captures(&self.source) {
            let start = NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok()?;
            let end = NaiveDate::parse_from_str(&caps[2], "%Y%m%d").ok()?;
            return Some(DateRange { start, end });
        }
        let date = parse_flexible_date(self.valid.as_deref()?)?;
        Some(DateRange { start: date, end: date })
    }

    /// Publication timestamp, when the manifest carries a parseable one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let created = self.created.as_deref()?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(created) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(created, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Substring match of the localized date token against the provenance
    /// text. A date string appearing anywhere in the text matches, including
    /// in unrelated positions; downstream consumers rely on that quirk.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        let Some(provenance) = self.provenance.as_deref() else {
            return false;
        };
        provenance.contains(&provenance_date_token(date))
    }
}

fn url_range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"data-(\d{8})T0000-(\d{8})T0000").expect("valid range pattern"))
}

fn parse_flexible_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    for format in ["%Y%m%d", "%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    None
}

/// Inclusive calendar range derived from a snapshot descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Formats a date the way provenance text embeds it (`DD.MM.YYYY`).
pub fn provenance_date_token(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

/// The `days` calendar dates ending yesterday, most recent first.
pub fn requested_dates(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (1..=u64::from(days))
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .collect()
}

/// Descriptors whose provenance embeds any of the requested dates, lazily and
/// in manifest order. One pass per call; no state is retained between calls.
pub fn match_by_dates<'a>(
    descriptors: &'a [SnapshotDescriptor],
    dates: &[NaiveDate],
) -> impl Iterator<Item = &'a SnapshotDescriptor> + 'a {
    let tokens: Vec<String> = dates.iter().copied().map(provenance_date_token).collect();
    descriptors.iter().filter(move |descriptor| {
        let Some(provenance) = descriptor.provenance.as_deref() else {
            return false;
        };
        tokens.iter().any(|token| provenance.contains(token.as_str()))
    })
}

/// "Not yet available" payloads: JSON null, `[]`, `{}`, or an empty string.
pub fn payload_is_empty(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

/// One document reference inside a snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailEntry {
    #[serde(default)]
    pub hosting_org: Option<String>,
    #[serde(default)]
    pub bidder_code: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default, alias = "regNumber")]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    pub href: String,
}

/// Extracts detail references from a snapshot payload. Accepts either a bare
/// array or an object wrapping one under `data`; elements without an `href`
/// are dropped.
pub fn detail_entries(payload: &Value) -> Vec<DetailEntry> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(fields) => match fields.get("data").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

/// Document variants with a known flattening and a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    Plan,
    Decision,
    Cancellation,
    Report,
}

impl DocumentKind {
    /// Maps a detail row's `doc_type` tag onto a variant. Unknown tags yield
    /// `None`; the caller records a no-op, never an error.
    pub fn from_source_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "privatizationplan" | "plan" => Some(Self::Plan),
            "privatizationdecision" | "decision" => Some(Self::Decision),
            "privatizationcancellation" | "cancellation" => Some(Self::Cancellation),
            "privatizationreport" | "report" => Some(Self::Report),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Decision => "decision",
            Self::Cancellation => "cancellation",
            Self::Report => "report",
        }
    }
}

/// Categories with a fixed ingestion pipeline and destination tables.
/// Anything else is an explicit error, never a synthesized table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    PrivatizationPlans,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported dataset category: {identifier}")]
pub struct UnsupportedCategory {
    pub identifier: String,
}

impl DatasetKind {
    /// Resolves a catalog identifier such as `7710568760-privatizationPlans`.
    pub fn from_identifier(identifier: &str) -> Result<Self, UnsupportedCategory> {
        match sanitize_identifier(identifier).as_str() {
            "privatizationplans" => Ok(Self::PrivatizationPlans),
            _ => Err(UnsupportedCategory {
                identifier: identifier.to_string(),
            }),
        }
    }

    pub fn plan_table(self) -> &'static str {
        "privatizationplans"
    }

    pub fn detail_table(self) -> &'static str {
        "privatizationplansdetail"
    }
}

/// Reduces a catalog identifier to a safe lowercase identifier: leading
/// digits, dashes and underscores stripped, non-alphanumerics dropped.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '-' || c == '_')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Catalog refresh row destined for `torgi.datasets`. Natural key: `name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRow {
    pub name: String,
    pub code: Option<String>,
    pub format: Option<String>,
    pub link: String,
    pub payload: Value,
}

/// Snapshot-level row destined for `torgi.privatizationplans`. Natural key:
/// `source_url`; non-key fields are refreshed in place on re-sighting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    pub source_url: String,
    pub created: Option<String>,
    pub provenance: Option<String>,
    pub valid_marker: Option<String>,
    pub structure_tag: Option<String>,
    pub date_range: Option<DateRange>,
    pub payload: Value,
    pub payload_sha256: String,
}

/// Detail row destined for `torgi.privatizationplansdetail`. Natural key:
/// `href`; owned by exactly one plan row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailRow {
    pub hosting_org: Option<String>,
    pub bidder_code: Option<String>,
    pub doc_type: Option<String>,
    pub registration_number: Option<String>,
    pub publish_date: Option<String>,
    pub href: String,
}

impl From<DetailEntry> for DetailRow {
    fn from(entry: DetailEntry) -> Self {
        Self {
            hosting_org: entry.hosting_org,
            bidder_code: entry.bidder_code,
            doc_type: entry.document_type,
            registration_number: entry.registration_number,
            publish_date: entry.publish_date,
            href: entry.href,
        }
    }
}

/// Detail row as read back from the store for the document pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDetail {
    pub id: i64,
    pub plan_id: i64,
    pub href: String,
    pub doc_type: Option<String>,
}

/// Flat projection of a plan document. All fields optional: missing nested
/// keys map to `None`, never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanDoc {
    pub doc_ident: Option<String>,
    pub registration_number: Option<String>,
    pub publish_date: Option<String>,
    pub plan_year: Option<i64>,
    pub hostingorg_code: Option<String>,
    pub hostingorg_name: Option<String>,
    pub hostingorg_inn: Option<String>,
    pub timezone_code: Option<String>,
    pub timezone_name: Option<String>,
    pub signed_date: Option<String>,
    pub signed_by: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_url: Option<String>,
}

/// Flat projection of a privatization-conditions decision document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionDoc {
    pub doc_ident: Option<String>,
    pub decision_number: Option<String>,
    pub decision_date: Option<String>,
    pub subject: Option<String>,
    pub hostingorg_code: Option<String>,
    pub hostingorg_name: Option<String>,
    pub hostingorg_inn: Option<String>,
    pub signed_date: Option<String>,
    pub signed_by: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_url: Option<String>,
}

/// Flat projection of a cancellation notice.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancellationDoc {
    pub doc_ident: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancel_date: Option<String>,
    pub canceled_ident: Option<String>,
    pub hostingorg_code: Option<String>,
    pub hostingorg_name: Option<String>,
    pub hostingorg_inn: Option<String>,
    pub signed_date: Option<String>,
    pub signed_by: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_url: Option<String>,
}

/// Flat projection of a privatization results report, including the monetary
/// aggregates block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportDoc {
    pub doc_ident: Option<String>,
    pub report_number: Option<String>,
    pub report_date: Option<String>,
    pub hostingorg_code: Option<String>,
    pub hostingorg_name: Option<String>,
    pub hostingorg_inn: Option<String>,
    pub signed_date: Option<String>,
    pub signed_by: Option<String>,
    pub total_start_price: Option<f64>,
    pub total_sale_price: Option<f64>,
    pub total_currency: Option<String>,
    pub sold_count: Option<i64>,
    pub bidform_number: Option<String>,
    pub bidform_date: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_url: Option<String>,
}

/// One flattened document, tagged by variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FlatDocument {
    Plan(PlanDoc),
    Decision(DecisionDoc),
    Cancellation(CancellationDoc),
    Report(ReportDoc),
}

impl FlatDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Self::Plan(_) => DocumentKind::Plan,
            Self::Decision(_) => DocumentKind::Decision,
            Self::Cancellation(_) => DocumentKind::Cancellation,
            Self::Report(_) => DocumentKind::Report,
        }
    }

    /// True when no recognized field was extracted; the caller records no row
    /// and reports zero rows written.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Plan(doc) => *doc == PlanDoc::default(),
            Self::Decision(doc) => *doc == DecisionDoc::default(),
            Self::Cancellation(doc) => *doc == CancellationDoc::default(),
            Self::Report(doc) => *doc == ReportDoc::default(),
        }
    }

    pub fn doc_ident(&self) -> Option<&str> {
        match self {
            Self::Plan(doc) => doc.doc_ident.as_deref(),
            Self::Decision(doc) => doc.doc_ident.as_deref(),
            Self::Cancellation(doc) => doc.doc_ident.as_deref(),
            Self::Report(doc) => doc.doc_ident.as_deref(),
        }
    }
}

/// Nested privatization object routed out of a plan document. Natural key:
/// `object_number`; owned by the parent detail row, not the document row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub object_number: String,
    pub name: Option<String>,
    pub object_type_code: Option<String>,
    pub object_type_name: Option<String>,
    pub address: Option<String>,
    pub start_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(source: &str, provenance: &str) -> SnapshotDescriptor {
        SnapshotDescriptor {
            source: source.to_string(),
            created: None,
            provenance: Some(provenance.to_string()),
            valid: None,
            structure: None,
        }
    }

    #[test]
    fn requested_dates_run_backwards_from_yesterday() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        let dates = requested_dates(today, 3);
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(),
            ]
        );
        assert!(requested_dates(today, 0).is_empty());
    }

    #[test]
    fn provenance_token_uses_dotted_day_month_year() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        assert_eq!(provenance_date_token(date), "06.01.2024");
    }

    #[test]
    fn matching_selects_only_the_requested_date() {
        let a = descriptor(
            "https://example.test/data-a.json",
            "Выгрузка размещённых планов приватизации за 05.01.2024",
        );
        let b = descriptor(
            "https://example.test/data-b.json",
            "Выгрузка размещённых планов приватизации за 06.01.2024",
        );
        let descriptors = vec![a, b.clone()];
        let date = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        let selected: Vec<_> = match_by_dates(&descriptors, &[date]).collect();
        assert_eq!(selected, vec![&b]);
    }

    #[test]
    fn matching_is_substring_based_even_mid_text() {
        // The date token may match an unrelated position in the provenance
        // text; that behavior is pinned, not fixed.
        let d = descriptor(
            "https://example.test/data.json",
            "архив от 06.01.2024, содержит данные за декабрь",
        );
        assert!(d.matches_date(NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()));
        assert!(!d.matches_date(NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()));
    }

    #[test]
    fn date_range_prefers_the_source_url() {
        let d = SnapshotDescriptor {
            source: "https://torgi.gov.ru/opendata/7710568760-privatizationPlans/data-20240105T0000-20240106T0000-structure-20220101.json".to_string(),
            created: None,
            provenance: None,
            valid: Some("20231231".to_string()),
            structure: None,
        };
        let range = d.date_range().unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2024, 1, 6).unwrap());
    }

    #[test]
    fn date_range_falls_back_to_the_valid_marker() {
        let d = SnapshotDescriptor {
            source: "https://torgi.gov.ru/opendata/plans/data-latest.json".to_string(),
            created: None,
            provenance: None,
            valid: Some("2024-01-05".to_string()),
            structure: None,
        };
        let range = d.date_range().unwrap();
        assert_eq!(range.start, range.end);
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        let none = SnapshotDescriptor {
            source: "https://torgi.gov.ru/opendata/plans/data-latest.json".to_string(),
            created: None,
            provenance: None,
            valid: Some("not a date".to_string()),
            structure: None,
        };
        assert!(none.date_range().is_none());
    }

    #[test]
    fn created_at_accepts_rfc3339_and_naive_timestamps() {
        let mut d = descriptor("https://example.test/data.json", "");
        d.created = Some("2024-01-06T03:00:00+03:00".to_string());
        assert_eq!(
            d.created_at().unwrap(),
            DateTime::parse_from_rfc3339("2024-01-06T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        );

        d.created = Some("2024-01-06 10:30:00".to_string());
        assert!(d.created_at().is_some());

        d.created = Some("вчера".to_string());
        assert!(d.created_at().is_none());
    }

    #[test]
    fn empty_payloads_follow_source_truthiness() {
        assert!(payload_is_empty(&json!(null)));
        assert!(payload_is_empty(&json!([])));
        assert!(payload_is_empty(&json!({})));
        assert!(payload_is_empty(&json!("")));
        assert!(!payload_is_empty(&json!([{"href": "x"}])));
        assert!(!payload_is_empty(&json!({"data": []})));
    }

    #[test]
    fn detail_entries_accept_bare_arrays_and_data_wrappers() {
        let bare = json!([
            {"documentType": "privatizationPlan", "href": "https://x/doc1"},
            {"documentType": "privatizationPlan"}
        ]);
        let entries = detail_entries(&bare);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].href, "https://x/doc1");

        let wrapped = json!({"data": [{"href": "https://x/doc2", "regNumber": "R-1"}]});
        let entries = detail_entries(&wrapped);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].registration_number.as_deref(), Some("R-1"));

        assert!(detail_entries(&json!({"other": 1})).is_empty());
        assert!(detail_entries(&json!(42)).is_empty());
    }

    #[test]
    fn document_kind_tags_are_case_insensitive() {
        assert_eq!(
            DocumentKind::from_source_tag("privatizationPlan"),
            Some(DocumentKind::Plan)
        );
        assert_eq!(
            DocumentKind::from_source_tag("DECISION"),
            Some(DocumentKind::Decision)
        );
        assert_eq!(
            DocumentKind::from_source_tag(" privatizationCancellation "),
            Some(DocumentKind::Cancellation)
        );
        assert_eq!(
            DocumentKind::from_source_tag("privatizationReport"),
            Some(DocumentKind::Report)
        );
        assert_eq!(DocumentKind::from_source_tag("noticeStopped"), None);
    }

    #[test]
    fn dataset_kind_resolves_sanitized_identifiers_only() {
        let kind = DatasetKind::from_identifier("7710568760-privatizationPlans").unwrap();
        assert_eq!(kind, DatasetKind::PrivatizationPlans);
        assert_eq!(kind.plan_table(), "privatizationplans");
        assert_eq!(kind.detail_table(), "privatizationplansdetail");
        assert_eq!(
            sanitize_identifier("7710568760-privatizationPlans"),
            "privatizationplans"
        );
        assert_eq!(sanitize_identifier("__7-fooBar"), "foobar");

        let err = DatasetKind::from_identifier("7710568760-notice").unwrap_err();
        assert_eq!(err.identifier, "7710568760-notice");
    }

    #[test]
    fn flat_documents_report_emptiness_per_variant() {
        assert!(FlatDocument::Plan(PlanDoc::default()).is_empty());
        let doc = FlatDocument::Plan(PlanDoc {
            doc_ident: Some("p-1".to_string()),
            ..PlanDoc::default()
        });
        assert!(!doc.is_empty());
        assert_eq!(doc.kind(), DocumentKind::Plan);
        assert_eq!(doc.doc_ident(), Some("p-1"));
    }
}
