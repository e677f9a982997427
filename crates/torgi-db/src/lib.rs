//! Idempotent upsert store over PostgreSQL (schema `torgi`).

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use torgi_core::{
    CancellationDoc, DatasetRow, DecisionDoc, DetailRow, FlatDocument, ObjectRecord, PlanDoc,
    PlanRow, ReportDoc, StoredDetail,
};
use tracing::debug;

pub const CRATE_NAME: &str = "torgi-db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    /// A unique index other than the upsert's conflict target rejected the
    /// row. The statement already rolled back; the caller marks the item
    /// failed and moves on.
    #[error("unique constraint {constraint} rejected the row")]
    UniqueViolation { constraint: String },
}

fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation {
                constraint: db_err.constraint().unwrap_or("unknown").to_string(),
            };
        }
    }
    StoreError::Database(err)
}

/// Persistence seam for the pipeline. Production uses [`PgStore`]; the
/// pipeline tests run against an in-memory double.
#[async_trait]
pub trait ProcurementStore: Send + Sync {
    async fn upsert_dataset(&self, row: &DatasetRow) -> Result<i64, StoreError>;
    async fn upsert_plan(&self, row: &PlanRow) -> Result<i64, StoreError>;
    async fn upsert_detail(&self, plan_id: i64, row: &DetailRow) -> Result<i64, StoreError>;
    async fn insert_document(&self, detail_id: i64, doc: &FlatDocument)
        -> Result<i64, StoreError>;
    async fn upsert_object(&self, detail_id: i64, record: &ObjectRecord)
        -> Result<i64, StoreError>;
    async fn list_details(&self) -> Result<Vec<StoredDetail>, StoreError>;
}

/// Fixed DDL for the `torgi` schema. Destination tables are an enumeration;
/// nothing here is ever derived from catalog input.
const SCHEMA_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS torgi",
    r#"
    CREATE TABLE IF NOT EXISTS torgi.datasets (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        code TEXT,
        format TEXT,
        link TEXT NOT NULL,
        data JSONB,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.privatizationplans (
        id BIGSERIAL PRIMARY KEY,
        source_url TEXT NOT NULL UNIQUE,
        created TEXT,
        provenance TEXT,
        valid_marker TEXT,
        structure_tag TEXT,
        date_range_start DATE,
        date_range_end DATE,
        payload JSONB,
        payload_sha256 TEXT,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.privatizationplansdetail (
        id BIGSERIAL PRIMARY KEY,
        plan_id BIGINT NOT NULL REFERENCES torgi.privatizationplans(id),
        hosting_org TEXT,
        bidder_code TEXT,
        doc_type TEXT,
        registration_number TEXT,
        publish_date TEXT,
        href TEXT NOT NULL UNIQUE,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.plan_documents (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES torgi.privatizationplansdetail(id),
        doc_ident TEXT UNIQUE,
        registration_number TEXT,
        publish_date TEXT,
        plan_year BIGINT,
        hostingorg_code TEXT,
        hostingorg_name TEXT,
        hostingorg_inn TEXT,
        timezone_code TEXT,
        timezone_name TEXT,
        signed_date TEXT,
        signed_by TEXT,
        attachment_name TEXT,
        attachment_url TEXT,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.decision_documents (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES torgi.privatizationplansdetail(id),
        doc_ident TEXT UNIQUE,
        decision_number TEXT,
        decision_date TEXT,
        subject TEXT,
        hostingorg_code TEXT,
        hostingorg_name TEXT,
        hostingorg_inn TEXT,
        signed_date TEXT,
        signed_by TEXT,
        attachment_name TEXT,
        attachment_url TEXT,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.cancellation_documents (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES torgi.privatizationplansdetail(id),
        doc_ident TEXT UNIQUE,
        cancel_reason TEXT,
        cancel_date TEXT,
        canceled_ident TEXT,
        hostingorg_code TEXT,
        hostingorg_name TEXT,
        hostingorg_inn TEXT,
        signed_date TEXT,
        signed_by TEXT,
        attachment_name TEXT,
        attachment_url TEXT,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.report_documents (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES torgi.privatizationplansdetail(id),
        doc_ident TEXT UNIQUE,
        report_number TEXT,
        report_date TEXT,
        hostingorg_code TEXT,
        hostingorg_name TEXT,
        hostingorg_inn TEXT,
        signed_date TEXT,
        signed_by TEXT,
        total_start_price DOUBLE PRECISION,
        total_sale_price DOUBLE PRECISION,
        total_currency TEXT,
        sold_count BIGINT,
        bidform_number TEXT,
        bidform_date TEXT,
        attachment_name TEXT,
        attachment_url TEXT,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS torgi.privatization_objects (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES torgi.privatizationplansdetail(id),
        object_number TEXT NOT NULL UNIQUE,
        name TEXT,
        object_type_code TEXT,
        object_type_name TEXT,
        address TEXT,
        start_price DOUBLE PRECISION,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and bootstraps the `torgi` schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(classify)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_DDL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        debug!("schema torgi is in place");
        Ok(())
    }

    async fn insert_plan_doc(&self, detail_id: i64, doc: &PlanDoc) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.plan_documents
                (detail_id, doc_ident, registration_number, publish_date, plan_year,
                 hostingorg_code, hostingorg_name, hostingorg_inn,
                 timezone_code, timezone_name, signed_date, signed_by,
                 attachment_name, attachment_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (doc_ident) DO UPDATE
               SET detail_id = EXCLUDED.detail_id,
                   registration_number = EXCLUDED.registration_number,
                   publish_date = EXCLUDED.publish_date,
                   plan_year = EXCLUDED.plan_year,
                   hostingorg_code = EXCLUDED.hostingorg_code,
                   hostingorg_name = EXCLUDED.hostingorg_name,
                   hostingorg_inn = EXCLUDED.hostingorg_inn,
                   timezone_code = EXCLUDED.timezone_code,
                   timezone_name = EXCLUDED.timezone_name,
                   signed_date = EXCLUDED.signed_date,
                   signed_by = EXCLUDED.signed_by,
                   attachment_name = EXCLUDED.attachment_name,
                   attachment_url = EXCLUDED.attachment_url,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(detail_id)
        .bind(&doc.doc_ident)
        .bind(&doc.registration_number)
        .bind(&doc.publish_date)
        .bind(doc.plan_year)
        .bind(&doc.hostingorg_code)
        .bind(&doc.hostingorg_name)
        .bind(&doc.hostingorg_inn)
        .bind(&doc.timezone_code)
        .bind(&doc.timezone_name)
        .bind(&doc.signed_date)
        .bind(&doc.signed_by)
        .bind(&doc.attachment_name)
        .bind(&doc.attachment_url)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn insert_decision_doc(
        &self,
        detail_id: i64,
        doc: &DecisionDoc,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.decision_documents
                (detail_id, doc_ident, decision_number, decision_date, subject,
                 hostingorg_code, hostingorg_name, hostingorg_inn,
                 signed_date, signed_by, attachment_name, attachment_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (doc_ident) DO UPDATE
               SET detail_id = EXCLUDED.detail_id,
                   decision_number = EXCLUDED.decision_number,
                   decision_date = EXCLUDED.decision_date,
                   subject = EXCLUDED.subject,
                   hostingorg_code = EXCLUDED.hostingorg_code,
                   hostingorg_name = EXCLUDED.hostingorg_name,
                   hostingorg_inn = EXCLUDED.hostingorg_inn,
                   signed_date = EXCLUDED.signed_date,
                   signed_by = EXCLUDED.signed_by,
                   attachment_name = EXCLUDED.attachment_name,
                   attachment_url = EXCLUDED.attachment_url,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(detail_id)
        .bind(&doc.doc_ident)
        .bind(&doc.decision_number)
        .bind(&doc.decision_date)
        .bind(&doc.subject)
        .bind(&doc.hostingorg_code)
        .bind(&doc.hostingorg_name)
        .bind(&doc.hostingorg_inn)
        .bind(&doc.signed_date)
        .bind(&doc.signed_by)
        .bind(&doc.attachment_name)
        .bind(&doc.attachment_url)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn insert_cancellation_doc(
        &self,
        detail_id: i64,
        doc: &CancellationDoc,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.cancellation_documents
                (detail_id, doc_ident, cancel_reason, cancel_date, canceled_ident,
                 hostingorg_code, hostingorg_name, hostingorg_inn,
                 signed_date, signed_by, attachment_name, attachment_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (doc_ident) DO UPDATE
               SET detail_id = EXCLUDED.detail_id,
                   cancel_reason = EXCLUDED.cancel_reason,
                   cancel_date = EXCLUDED.cancel_date,
                   canceled_ident = EXCLUDED.canceled_ident,
                   hostingorg_code = EXCLUDED.hostingorg_code,
                   hostingorg_name = EXCLUDED.hostingorg_name,
                   hostingorg_inn = EXCLUDED.hostingorg_inn,
                   signed_date = EXCLUDED.signed_date,
                   signed_by = EXCLUDED.signed_by,
                   attachment_name = EXCLUDED.attachment_name,
                   attachment_url = EXCLUDED.attachment_url,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(detail_id)
        .bind(&doc.doc_ident)
        .bind(&doc.cancel_reason)
        .bind(&doc.cancel_date)
        .bind(&doc.canceled_ident)
        .bind(&doc.hostingorg_code)
        .bind(&doc.hostingorg_name)
        .bind(&doc.hostingorg_inn)
        .bind(&doc.signed_date)
        .bind(&doc.signed_by)
        .bind(&doc.attachment_name)
        .bind(&doc.attachment_url)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn insert_report_doc(&self, detail_id: i64, doc: &ReportDoc) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.report_documents
                (detail_id, doc_ident, report_number, report_date,
                 hostingorg_code, hostingorg_name, hostingorg_inn,
                 signed_date, signed_by,
                 total_start_price, total_sale_price, total_currency, sold_count,
                 bidform_number, bidform_date, attachment_name, attachment_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (doc_ident) DO UPDATE
               SET detail_id = EXCLUDED.detail_id,
                   report_number = EXCLUDED.report_number,
                   report_date = EXCLUDED.report_date,
                   hostingorg_code = EXCLUDED.hostingorg_code,
                   hostingorg_name = EXCLUDED.hostingorg_name,
                   hostingorg_inn = EXCLUDED.hostingorg_inn,
                   signed_date = EXCLUDED.signed_date,
                   signed_by = EXCLUDED.signed_by,
                   total_start_price = EXCLUDED.total_start_price,
                   total_sale_price = EXCLUDED.total_sale_price,
                   total_currency = EXCLUDED.total_currency,
                   sold_count = EXCLUDED.sold_count,
                   bidform_number = EXCLUDED.bidform_number,
                   bidform_date = EXCLUDED.bidform_date,
                   attachment_name = EXCLUDED.attachment_name,
                   attachment_url = EXCLUDED.attachment_url,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(detail_id)
        .bind(&doc.doc_ident)
        .bind(&doc.report_number)
        .bind(&doc.report_date)
        .bind(&doc.hostingorg_code)
        .bind(&doc.hostingorg_name)
        .bind(&doc.hostingorg_inn)
        .bind(&doc.signed_date)
        .bind(&doc.signed_by)
        .bind(doc.total_start_price)
        .bind(doc.total_sale_price)
        .bind(&doc.total_currency)
        .bind(doc.sold_count)
        .bind(&doc.bidform_number)
        .bind(&doc.bidform_date)
        .bind(&doc.attachment_name)
        .bind(&doc.attachment_url)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }
}

#[async_trait]
impl ProcurementStore for PgStore {
    async fn upsert_dataset(&self, row: &DatasetRow) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.datasets (name, code, format, link, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
               SET code = EXCLUDED.code,
                   format = EXCLUDED.format,
                   link = EXCLUDED.link,
                   data = EXCLUDED.data,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&row.name)
        .bind(&row.code)
        .bind(&row.format)
        .bind(&row.link)
        .bind(&row.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn upsert_plan(&self, row: &PlanRow) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.privatizationplans
                (source_url, created, provenance, valid_marker, structure_tag,
                 date_range_start, date_range_end, payload, payload_sha256)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_url) DO UPDATE
               SET created = EXCLUDED.created,
                   provenance = EXCLUDED.provenance,
                   valid_marker = EXCLUDED.valid_marker,
                   structure_tag = EXCLUDED.structure_tag,
                   date_range_start = EXCLUDED.date_range_start,
                   date_range_end = EXCLUDED.date_range_end,
                   payload = EXCLUDED.payload,
                   payload_sha256 = EXCLUDED.payload_sha256,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&row.source_url)
        .bind(&row.created)
        .bind(&row.provenance)
        .bind(&row.valid_marker)
        .bind(&row.structure_tag)
        .bind(row.date_range.map(|range| range.start))
        .bind(row.date_range.map(|range| range.end))
        .bind(&row.payload)
        .bind(&row.payload_sha256)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn upsert_detail(&self, plan_id: i64, row: &DetailRow) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.privatizationplansdetail
                (plan_id, hosting_org, bidder_code, doc_type,
                 registration_number, publish_date, href)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (href) DO UPDATE
               SET plan_id = EXCLUDED.plan_id,
                   hosting_org = EXCLUDED.hosting_org,
                   bidder_code = EXCLUDED.bidder_code,
                   doc_type = EXCLUDED.doc_type,
                   registration_number = EXCLUDED.registration_number,
                   publish_date = EXCLUDED.publish_date,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(plan_id)
        .bind(&row.hosting_org)
        .bind(&row.bidder_code)
        .bind(&row.doc_type)
        .bind(&row.registration_number)
        .bind(&row.publish_date)
        .bind(&row.href)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    /// Upserts on `doc_ident` when the source embeds one. Rows without an
    /// identifier never conflict and are append-only.
    async fn insert_document(
        &self,
        detail_id: i64,
        doc: &FlatDocument,
    ) -> Result<i64, StoreError> {
        match doc {
            FlatDocument::Plan(doc) => self.insert_plan_doc(detail_id, doc).await,
            FlatDocument::Decision(doc) => self.insert_decision_doc(detail_id, doc).await,
            FlatDocument::Cancellation(doc) => self.insert_cancellation_doc(detail_id, doc).await,
            FlatDocument::Report(doc) => self.insert_report_doc(detail_id, doc).await,
        }
    }

    async fn upsert_object(
        &self,
        detail_id: i64,
        record: &ObjectRecord,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO torgi.privatization_objects
                (detail_id, object_number, name, object_type_code,
                 object_type_name, address, start_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (object_number) DO UPDATE
               SET detail_id = EXCLUDED.detail_id,
                   name = EXCLUDED.name,
                   object_type_code = EXCLUDED.object_type_code,
                   object_type_name = EXCLUDED.object_type_name,
                   address = EXCLUDED.address,
                   start_price = EXCLUDED.start_price,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(detail_id)
        .bind(&record.object_number)
        .bind(&record.name)
        .bind(&record.object_type_code)
        .bind(&record.object_type_name)
        .bind(&record.address)
        .bind(record.start_price)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn list_details(&self) -> Result<Vec<StoredDetail>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, plan_id, href, doc_type
              FROM torgi.privatizationplansdetail
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredDetail {
                id: row.try_get("id").map_err(classify)?,
                plan_id: row.try_get("plan_id").map_err(classify)?,
                href: row.try_get("href").map_err(classify)?,
                doc_type: row.try_get("doc_type").map_err(classify)?,
            });
        }
        Ok(out)
    }
}
