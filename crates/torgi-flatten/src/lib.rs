//! Pure flattener turning nested document JSON into fixed flat records.

use serde_json::Value;
use torgi_core::{
    CancellationDoc, DecisionDoc, DocumentKind, FlatDocument, ObjectRecord, PlanDoc, ReportDoc,
};

pub const CRATE_NAME: &str = "torgi-flatten";

/// Flattens one document into its variant record. Total over any JSON value:
/// missing or misshapen keys become `None`, never an error.
pub fn flatten(kind: DocumentKind, doc: &Value) -> FlatDocument {
    match kind {
        DocumentKind::Plan => FlatDocument::Plan(flatten_plan(doc)),
        DocumentKind::Decision => FlatDocument::Decision(flatten_decision(doc)),
        DocumentKind::Cancellation => FlatDocument::Cancellation(flatten_cancellation(doc)),
        DocumentKind::Report => FlatDocument::Report(flatten_report(doc)),
    }
}

pub fn flatten_plan(doc: &Value) -> PlanDoc {
    PlanDoc {
        doc_ident: str_at(doc, &["id"]),
        registration_number: str_at(doc, &["regNumber"]),
        publish_date: str_at(doc, &["publishDate"]),
        plan_year: int_at(doc, &["planYear"]),
        hostingorg_code: str_at(doc, &["hostingOrganization", "code"]),
        hostingorg_name: str_at(doc, &["hostingOrganization", "name"]),
        hostingorg_inn: str_at(doc, &["hostingOrganization", "INN"]),
        timezone_code: str_at(doc, &["timeZone", "code"]),
        timezone_name: str_at(doc, &["timeZone", "name"]),
        signed_date: str_at(doc, &["signedData", "signDate"]),
        signed_by: str_at(doc, &["signedData", "signer"]),
        attachment_name: first_str_at(doc, "attachments", &["fileName"]),
        attachment_url: first_str_at(doc, "attachments", &["url"]),
    }
}

pub fn flatten_decision(doc: &Value) -> DecisionDoc {
    DecisionDoc {
        doc_ident: str_at(doc, &["id"]),
        decision_number: str_at(doc, &["decisionNumber"]),
        decision_date: str_at(doc, &["decisionDate"]),
        subject: str_at(doc, &["subject"]),
        hostingorg_code: str_at(doc, &["hostingOrganization", "code"]),
        hostingorg_name: str_at(doc, &["hostingOrganization", "name"]),
        hostingorg_inn: str_at(doc, &["hostingOrganization", "INN"]),
        signed_date: str_at(doc, &["signedData", "signDate"]),
        signed_by: str_at(doc, &["signedData", "signer"]),
        attachment_name: first_str_at(doc, "attachments", &["fileName"]),
        attachment_url: first_str_at(doc, "attachments", &["url"]),
    }
}

pub fn flatten_cancellation(doc: &Value) -> CancellationDoc {
    CancellationDoc {
        doc_ident: str_at(doc, &["id"]),
        cancel_reason: str_at(doc, &["reason"]),
        cancel_date: str_at(doc, &["cancelDate"]),
        canceled_ident: str_at(doc, &["canceledId"]),
        hostingorg_code: str_at(doc, &["hostingOrganization", "code"]),
        hostingorg_name: str_at(doc, &["hostingOrganization", "name"]),
        hostingorg_inn: str_at(doc, &["hostingOrganization", "INN"]),
        signed_date: str_at(doc, &["signedData", "signDate"]),
        signed_by: str_at(doc, &["signedData", "signer"]),
        attachment_name: first_str_at(doc, "attachments", &["fileName"]),
        attachment_url: first_str_at(doc, "attachments", &["url"]),
    }
}

pub fn flatten_report(doc: &Value) -> ReportDoc {
    ReportDoc {
        doc_ident: str_at(doc, &["id"]),
        report_number: str_at(doc, &["reportNumber"]),
        report_date: str_at(doc, &["reportDate"]),
        hostingorg_code: str_at(doc, &["hostingOrganization", "code"]),
        hostingorg_name: str_at(doc, &["hostingOrganization", "name"]),
        hostingorg_inn: str_at(doc, &["hostingOrganization", "INN"]),
        signed_date: str_at(doc, &["signedData", "signDate"]),
        signed_by: str_at(doc, &["signedData", "signer"]),
        total_start_price: f64_at(doc, &["summary", "startPrice"]),
        total_sale_price: f64_at(doc, &["summary", "salePrice"]),
        total_currency: str_at(doc, &["summary", "currency"]),
        sold_count: int_at(doc, &["summary", "soldCount"]),
        bidform_number: first_str_at(doc, "bidForms", &["number"]),
        bidform_date: first_str_at(doc, "bidForms", &["date"]),
        attachment_name: first_str_at(doc, "attachments", &["fileName"]),
        attachment_url: first_str_at(doc, "attachments", &["url"]),
    }
}

/// Extracts the nested privatization objects from a plan document. Elements
/// without an `objectNumber` are dropped: no natural key, nothing to upsert
/// on.
pub fn plan_objects(doc: &Value) -> Vec<ObjectRecord> {
    let Some(items) = doc.get("privatizationObjects").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let object_number = str_at(item, &["objectNumber"])?;
            Some(ObjectRecord {
                object_number,
                name: str_at(item, &["name"]),
                object_type_code: str_at(item, &["objectType", "code"]),
                object_type_name: str_at(item, &["objectType", "name"]),
                address: str_at(item, &["address"]),
                start_price: f64_at(item, &["startPrice"]),
            })
        })
        .collect()
}

fn value_at<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = doc;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

// Upstream is inconsistent about quoting: numeric identifiers arrive both as
// numbers and as strings, so scalar readers coerce in both directions.
fn str_at(doc: &Value, path: &[&str]) -> Option<String> {
    match value_at(doc, path)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn int_at(doc: &Value, path: &[&str]) -> Option<i64> {
    match value_at(doc, path)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn f64_at(doc: &Value, path: &[&str]) -> Option<f64> {
    match value_at(doc, path)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// First element of a repeatable block; the rest is deliberately dropped.
fn first_at<'a>(doc: &'a Value, key: &str) -> Option<&'a Value> {
    doc.get(key)?.as_array()?.first()
}

fn first_str_at(doc: &Value, key: &str, path: &[&str]) -> Option<String> {
    str_at(first_at(doc, key)?, path)
}
