use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foodlink_catalog::{FoodCategory, PriceBreakdown, Quantity, QuantityUnit};
use foodlink_core::location::{GeoPoint, Location};
use foodlink_core::models::{Bill, DeclineReason, DeliveryAssignment, Donation, FoodRequest};
use foodlink_core::repository::{
    Assign, AssignmentChange, AssignmentFilter, BillChange, BillFilter, Change, Committed,
    DeadlineGuard, DonationChange, DonationFilter, EntityKind, EntityStore, Expect, OutboxEntry,
    RequestChange, RequestFilter, StoreError, StoreResult, UnitOfWork,
};
use foodlink_shared::{DomainEvent, EventEnvelope};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

const DONATION_COLUMNS: &str = "id, donor_id, title, category, quantity_amount, quantity_unit, \
     listed_value, location_label, location_lat, location_lon, spoil_deadline, status, \
     claimant_request_id, assigned_partner_id, version, created_at, updated_at";

const REQUEST_COLUMNS: &str = "id, requester_id, category, quantity_amount, quantity_unit, \
     urgency, location_label, location_lat, location_lon, status, donation_id, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str =
    "id, donation_id, partner_id, status, decline_reason, offered_at, responded_at, completed_at";

const BILL_COLUMNS: &str = "id, donation_id, request_id, donor_id, receiver_id, original_value, \
     final_price, platform_fee_fraction, platform_fee, donor_payout, breakdown, transaction_id, \
     status, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct DonationRow {
    id: Uuid,
    donor_id: Uuid,
    title: String,
    category: String,
    quantity_amount: f64,
    quantity_unit: String,
    listed_value: i64,
    location_label: String,
    location_lat: Option<f64>,
    location_lon: Option<f64>,
    spoil_deadline: DateTime<Utc>,
    status: String,
    claimant_request_id: Option<Uuid>,
    assigned_partner_id: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    requester_id: Uuid,
    category: String,
    quantity_amount: f64,
    quantity_unit: String,
    urgency: String,
    location_label: String,
    location_lat: Option<f64>,
    location_lon: Option<f64>,
    status: String,
    donation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id: Uuid,
    donation_id: Uuid,
    partner_id: Option<Uuid>,
    status: String,
    decline_reason: Option<String>,
    offered_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct BillRow {
    id: Uuid,
    donation_id: Uuid,
    request_id: Uuid,
    donor_id: Uuid,
    receiver_id: Uuid,
    original_value: i64,
    final_price: i64,
    platform_fee_fraction: f64,
    platform_fee: i64,
    donor_payout: i64,
    breakdown: Value,
    transaction_id: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    position: i64,
    envelope: Value,
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{}: {}", what, detail))
}

fn location(label: String, lat: Option<f64>, lon: Option<f64>) -> Location {
    Location {
        label,
        point: lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon)),
    }
}

fn quantity(amount: f64, unit: &str) -> StoreResult<Quantity> {
    let unit: QuantityUnit = unit.parse().map_err(|e| corrupt("quantity unit", e))?;
    Ok(Quantity::new(amount, unit))
}

fn category(raw: &str) -> FoodCategory {
    raw.parse().unwrap_or(FoodCategory::Other)
}

impl TryFrom<DonationRow> for Donation {
    type Error = StoreError;

    fn try_from(row: DonationRow) -> StoreResult<Self> {
        Ok(Donation {
            id: row.id,
            donor_id: row.donor_id,
            title: row.title,
            category: category(&row.category),
            quantity: quantity(row.quantity_amount, &row.quantity_unit)?,
            listed_value: row.listed_value,
            location: location(row.location_label, row.location_lat, row.location_lon),
            spoil_deadline: row.spoil_deadline,
            status: row.status.parse().map_err(|e| corrupt("donation status", e))?,
            claimant_request_id: row.claimant_request_id,
            assigned_partner_id: row.assigned_partner_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<RequestRow> for FoodRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> StoreResult<Self> {
        Ok(FoodRequest {
            id: row.id,
            requester_id: row.requester_id,
            category: category(&row.category),
            quantity: quantity(row.quantity_amount, &row.quantity_unit)?,
            urgency: row.urgency.parse().map_err(|e| corrupt("urgency", e))?,
            location: location(row.location_label, row.location_lat, row.location_lon),
            status: row.status.parse().map_err(|e| corrupt("request status", e))?,
            donation_id: row.donation_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<AssignmentRow> for DeliveryAssignment {
    type Error = StoreError;

    fn try_from(row: AssignmentRow) -> StoreResult<Self> {
        let decline_reason = match row.decline_reason {
            Some(raw) => Some(
                raw.parse::<DeclineReason>()
                    .map_err(|e| corrupt("decline reason", e))?,
            ),
            None => None,
        };
        Ok(DeliveryAssignment {
            id: row.id,
            donation_id: row.donation_id,
            partner_id: row.partner_id,
            status: row.status.parse().map_err(|e| corrupt("assignment status", e))?,
            decline_reason,
            offered_at: row.offered_at,
            responded_at: row.responded_at,
            completed_at: row.completed_at,
        })
    }
}

impl TryFrom<BillRow> for Bill {
    type Error = StoreError;

    fn try_from(row: BillRow) -> StoreResult<Self> {
        let breakdown: PriceBreakdown =
            serde_json::from_value(row.breakdown).map_err(|e| corrupt("bill breakdown", e))?;
        Ok(Bill {
            id: row.id,
            donation_id: row.donation_id,
            request_id: row.request_id,
            donor_id: row.donor_id,
            receiver_id: row.receiver_id,
            original_value: row.original_value,
            final_price: row.final_price,
            platform_fee_fraction: row.platform_fee_fraction,
            platform_fee: row.platform_fee,
            donor_payout: row.donor_payout,
            breakdown,
            transaction_id: row.transaction_id,
            status: row.status.parse().map_err(|e| corrupt("bill status", e))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn sqlstate_is(e: &sqlx::Error, wanted: fn(&str) -> bool) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| wanted(&code))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    sqlstate_is(e, |code| code == UNIQUE_VIOLATION)
}

/// Deadlock victims and serialization failures lost a race on row locks
fn is_lost_race_code(code: &str) -> bool {
    code == DEADLOCK_DETECTED || code == SERIALIZATION_FAILURE
}

fn is_lost_race(e: &sqlx::Error) -> bool {
    sqlstate_is(e, is_lost_race_code)
}

/// Unique violations and lock races on update mean another writer got
/// there first
fn update_err(entity: EntityKind, id: Uuid, e: sqlx::Error) -> StoreError {
    if is_unique_violation(&e) || is_lost_race(&e) {
        StoreError::conflict(entity, id, e.to_string())
    } else {
        backend(e)
    }
}

fn insert_err(entity: EntityKind, id: Uuid, e: sqlx::Error) -> StoreError {
    if is_unique_violation(&e) {
        StoreError::Duplicate { entity, id }
    } else if is_lost_race(&e) {
        StoreError::conflict(entity, id, e.to_string())
    } else {
        backend(e)
    }
}

/// Record a failed unit is reported against
fn change_subject(change: &Change) -> (EntityKind, Uuid) {
    match change {
        Change::Donation(c) => (EntityKind::Donation, c.id),
        Change::Request(c) => (EntityKind::Request, c.id),
        Change::Assignment(c) => (EntityKind::Assignment, c.id),
        Change::Bill(c) => (EntityKind::Bill, c.id),
        Change::NewAssignment(a) => (EntityKind::Assignment, a.id),
        Change::NewBill(b) => (EntityKind::Bill, b.id),
        Change::Emit(event) => (EntityKind::Donation, event.donation_id()),
    }
}

/// `(kind, id)` parameters for a reference guard
fn expect_params(expect: &Expect) -> (&'static str, Option<Uuid>) {
    match expect {
        Expect::Any => ("ANY", None),
        Expect::Vacant => ("VACANT", None),
        Expect::Held(id) => ("HELD", Some(*id)),
    }
}

/// `(write, value)` parameters for a reference assignment
fn assign_params(assign: &Assign) -> (bool, Option<Uuid>) {
    match assign {
        Assign::Keep => (false, None),
        Assign::Set(id) => (true, Some(*id)),
        Assign::Clear => (true, None),
    }
}

fn deadline_param(guard: &DeadlineGuard) -> &'static str {
    match guard {
        DeadlineGuard::Any => "ANY",
        DeadlineGuard::Live => "LIVE",
        DeadlineGuard::Lapsed => "LAPSED",
    }
}

fn expect_clause(column: &str, kind: usize, id: usize) -> String {
    format!(
        "(${kind}::text = 'ANY' \
          OR (${kind}::text = 'VACANT' AND {column} IS NULL) \
          OR (${kind}::text = 'HELD' AND {column} = ${id}::uuid))"
    )
}

pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_donation(conn: &mut PgConnection, id: Uuid) -> StoreResult<Option<Donation>> {
        let sql = format!("SELECT {} FROM donations WHERE id = $1", DONATION_COLUMNS);
        sqlx::query_as::<_, DonationRow>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(backend)?
            .map(Donation::try_from)
            .transpose()
    }

    async fn fetch_request(conn: &mut PgConnection, id: Uuid) -> StoreResult<Option<FoodRequest>> {
        let sql = format!("SELECT {} FROM food_requests WHERE id = $1", REQUEST_COLUMNS);
        sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(backend)?
            .map(FoodRequest::try_from)
            .transpose()
    }

    async fn fetch_assignment(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> StoreResult<Option<DeliveryAssignment>> {
        let sql = format!("SELECT {} FROM delivery_assignments WHERE id = $1", ASSIGNMENT_COLUMNS);
        sqlx::query_as::<_, AssignmentRow>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(backend)?
            .map(DeliveryAssignment::try_from)
            .transpose()
    }

    async fn fetch_bill(conn: &mut PgConnection, id: Uuid) -> StoreResult<Option<Bill>> {
        let sql = format!("SELECT {} FROM bills WHERE id = $1", BILL_COLUMNS);
        sqlx::query_as::<_, BillRow>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(backend)?
            .map(Bill::try_from)
            .transpose()
    }

    async fn apply_donation(
        conn: &mut PgConnection,
        c: &DonationChange,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (claimant_kind, claimant_id) = expect_params(&c.claimant);
        let (partner_kind, partner_id) = expect_params(&c.partner);
        let (write_claimant, claimant_value) = assign_params(&c.set_claimant);
        let (write_partner, partner_value) = assign_params(&c.set_partner);

        let sql = format!(
            r#"
            UPDATE donations
            SET status = $2,
                claimant_request_id = CASE WHEN $3 THEN $4::uuid ELSE claimant_request_id END,
                assigned_partner_id = CASE WHEN $5 THEN $6::uuid ELSE assigned_partner_id END,
                version = version + 1,
                updated_at = $7
            WHERE id = $1
              AND status = $8
              AND {claimant}
              AND {partner}
              AND ($13::text = 'ANY'
                   OR ($13::text = 'LIVE' AND spoil_deadline >= $7)
                   OR ($13::text = 'LAPSED' AND spoil_deadline < $7))
            RETURNING id
            "#,
            claimant = expect_clause("claimant_request_id", 9, 10),
            partner = expect_clause("assigned_partner_id", 11, 12),
        );

        let updated: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(c.id)
            .bind(c.to.as_str())
            .bind(write_claimant)
            .bind(claimant_value)
            .bind(write_partner)
            .bind(partner_value)
            .bind(at)
            .bind(c.from.as_str())
            .bind(claimant_kind)
            .bind(claimant_id)
            .bind(partner_kind)
            .bind(partner_id)
            .bind(deadline_param(&c.deadline))
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| update_err(EntityKind::Donation, c.id, e))?;

        if updated.is_some() {
            return Ok(());
        }
        match Self::fetch_donation(conn, c.id).await? {
            None => Err(StoreError::NotFound {
                entity: EntityKind::Donation,
                id: c.id,
            }),
            Some(current) => Err(StoreError::conflict(
                EntityKind::Donation,
                c.id,
                c.check(&current, at).err().unwrap_or_else(|| "guard missed".to_string()),
            )),
        }
    }

    async fn apply_request(
        conn: &mut PgConnection,
        c: &RequestChange,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (donation_kind, donation_id) = expect_params(&c.donation);
        let (write_donation, donation_value) = assign_params(&c.set_donation);

        let sql = format!(
            r#"
            UPDATE food_requests
            SET status = $2,
                donation_id = CASE WHEN $3 THEN $4::uuid ELSE donation_id END,
                updated_at = $5
            WHERE id = $1
              AND status = $6
              AND {donation}
            RETURNING id
            "#,
            donation = expect_clause("donation_id", 7, 8),
        );

        let updated: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(c.id)
            .bind(c.to.as_str())
            .bind(write_donation)
            .bind(donation_value)
            .bind(at)
            .bind(c.from.as_str())
            .bind(donation_kind)
            .bind(donation_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| update_err(EntityKind::Request, c.id, e))?;

        if updated.is_some() {
            return Ok(());
        }
        match Self::fetch_request(conn, c.id).await? {
            None => Err(StoreError::NotFound {
                entity: EntityKind::Request,
                id: c.id,
            }),
            Some(current) => Err(StoreError::conflict(
                EntityKind::Request,
                c.id,
                c.check(&current).err().unwrap_or_else(|| "guard missed".to_string()),
            )),
        }
    }

    async fn apply_assignment(
        conn: &mut PgConnection,
        c: &AssignmentChange,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (partner_kind, partner_id) = expect_params(&c.partner);
        let (write_partner, partner_value) = assign_params(&c.set_partner);

        let sql = format!(
            r#"
            UPDATE delivery_assignments
            SET status = $2,
                partner_id = CASE WHEN $3 THEN $4::uuid ELSE partner_id END,
                decline_reason = CASE WHEN $2 = 'DECLINED' THEN $5 ELSE decline_reason END,
                responded_at = CASE WHEN $2 IN ('ACCEPTED', 'DECLINED') THEN $6 ELSE responded_at END,
                completed_at = CASE WHEN $2 = 'COMPLETED' THEN $6 ELSE completed_at END
            WHERE id = $1
              AND status = $7
              AND {partner}
            RETURNING id
            "#,
            partner = expect_clause("partner_id", 8, 9),
        );

        let updated: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(c.id)
            .bind(c.to.as_str())
            .bind(write_partner)
            .bind(partner_value)
            .bind(c.reason.map(|r| r.as_str()))
            .bind(at)
            .bind(c.from.as_str())
            .bind(partner_kind)
            .bind(partner_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| update_err(EntityKind::Assignment, c.id, e))?;

        if updated.is_some() {
            return Ok(());
        }
        match Self::fetch_assignment(conn, c.id).await? {
            None => Err(StoreError::NotFound {
                entity: EntityKind::Assignment,
                id: c.id,
            }),
            Some(current) => Err(StoreError::conflict(
                EntityKind::Assignment,
                c.id,
                c.check(&current).err().unwrap_or_else(|| "guard missed".to_string()),
            )),
        }
    }

    async fn apply_bill(conn: &mut PgConnection, c: &BillChange, at: DateTime<Utc>) -> StoreResult<()> {
        let updated: Option<Uuid> = sqlx::query_scalar(
            "UPDATE bills SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4 RETURNING id",
        )
        .bind(c.id)
        .bind(c.to.as_str())
        .bind(at)
        .bind(c.from.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| update_err(EntityKind::Bill, c.id, e))?;

        if updated.is_some() {
            return Ok(());
        }
        match Self::fetch_bill(conn, c.id).await? {
            None => Err(StoreError::NotFound {
                entity: EntityKind::Bill,
                id: c.id,
            }),
            Some(current) => Err(StoreError::conflict(
                EntityKind::Bill,
                c.id,
                c.check(&current).err().unwrap_or_else(|| "guard missed".to_string()),
            )),
        }
    }

    async fn insert_assignment_row(conn: &mut PgConnection, a: &DeliveryAssignment) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO delivery_assignments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            ASSIGNMENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(a.id)
            .bind(a.donation_id)
            .bind(a.partner_id)
            .bind(a.status.as_str())
            .bind(a.decline_reason.map(|r| r.as_str()))
            .bind(a.offered_at)
            .bind(a.responded_at)
            .bind(a.completed_at)
            .execute(conn)
            .await
            .map_err(|e| insert_err(EntityKind::Assignment, a.id, e))?;
        Ok(())
    }

    async fn insert_bill_row(conn: &mut PgConnection, b: &Bill) -> StoreResult<()> {
        let breakdown = serde_json::to_value(&b.breakdown)
            .map_err(|e| StoreError::Backend(format!("encode bill breakdown: {}", e)))?;
        let sql = format!(
            "INSERT INTO bills ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            BILL_COLUMNS
        );
        sqlx::query(&sql)
            .bind(b.id)
            .bind(b.donation_id)
            .bind(b.request_id)
            .bind(b.donor_id)
            .bind(b.receiver_id)
            .bind(b.original_value)
            .bind(b.final_price)
            .bind(b.platform_fee_fraction)
            .bind(b.platform_fee)
            .bind(b.donor_payout)
            .bind(breakdown)
            .bind(&b.transaction_id)
            .bind(b.status.as_str())
            .bind(b.created_at)
            .bind(b.updated_at)
            .execute(conn)
            .await
            .map_err(|e| insert_err(EntityKind::Bill, b.id, e))?;
        Ok(())
    }

    async fn record_event(
        conn: &mut PgConnection,
        event: &DomainEvent,
        at: DateTime<Utc>,
    ) -> StoreResult<EventEnvelope> {
        let donation_id = event.donation_id();
        let sequence: Option<i64> = sqlx::query_scalar(
            "UPDATE donations SET version = version + 1 WHERE id = $1 RETURNING version",
        )
        .bind(donation_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| update_err(EntityKind::Donation, donation_id, e))?;

        let sequence = sequence.ok_or(StoreError::NotFound {
            entity: EntityKind::Donation,
            id: donation_id,
        })?;

        let envelope = EventEnvelope::new(event.clone(), sequence, at);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| StoreError::Backend(format!("encode event: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO event_outbox (event_id, donation_id, sequence, event_type, envelope, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(envelope.event_id)
        .bind(donation_id)
        .bind(sequence)
        .bind(event.name())
        .bind(payload)
        .bind(at)
        .execute(conn)
        .await
        .map_err(|e| update_err(EntityKind::Donation, donation_id, e))?;

        Ok(envelope)
    }

    async fn apply(
        conn: &mut PgConnection,
        change: &Change,
        at: DateTime<Utc>,
        touched: &mut Vec<Uuid>,
        events: &mut Vec<EventEnvelope>,
    ) -> StoreResult<()> {
        match change {
            Change::Donation(c) => {
                Self::apply_donation(conn, c, at).await?;
                if !touched.contains(&c.id) {
                    touched.push(c.id);
                }
            }
            Change::Request(c) => Self::apply_request(conn, c, at).await?,
            Change::Assignment(c) => Self::apply_assignment(conn, c, at).await?,
            Change::Bill(c) => Self::apply_bill(conn, c, at).await?,
            Change::NewAssignment(a) => Self::insert_assignment_row(conn, a).await?,
            Change::NewBill(b) => Self::insert_bill_row(conn, b).await?,
            Change::Emit(event) => {
                let envelope = Self::record_event(conn, event, at).await?;
                if !touched.contains(&envelope.donation_id) {
                    touched.push(envelope.donation_id);
                }
                events.push(envelope);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn insert_donation(&self, d: &Donation) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO donations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            DONATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(d.id)
            .bind(d.donor_id)
            .bind(&d.title)
            .bind(d.category.as_str())
            .bind(d.quantity.amount)
            .bind(d.quantity.unit.as_str())
            .bind(d.listed_value)
            .bind(&d.location.label)
            .bind(d.location.point.map(|p| p.lat))
            .bind(d.location.point.map(|p| p.lon))
            .bind(d.spoil_deadline)
            .bind(d.status.as_str())
            .bind(d.claimant_request_id)
            .bind(d.assigned_partner_id)
            .bind(d.version)
            .bind(d.created_at)
            .bind(d.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_err(EntityKind::Donation, d.id, e))?;
        Ok(())
    }

    async fn insert_request(&self, r: &FoodRequest) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO food_requests ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            REQUEST_COLUMNS
        );
        sqlx::query(&sql)
            .bind(r.id)
            .bind(r.requester_id)
            .bind(r.category.as_str())
            .bind(r.quantity.amount)
            .bind(r.quantity.unit.as_str())
            .bind(r.urgency.as_str())
            .bind(&r.location.label)
            .bind(r.location.point.map(|p| p.lat))
            .bind(r.location.point.map(|p| p.lon))
            .bind(r.status.as_str())
            .bind(r.donation_id)
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_err(EntityKind::Request, r.id, e))?;
        Ok(())
    }

    async fn donation(&self, id: Uuid) -> StoreResult<Option<Donation>> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::fetch_donation(&mut conn, id).await
    }

    async fn request(&self, id: Uuid) -> StoreResult<Option<FoodRequest>> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::fetch_request(&mut conn, id).await
    }

    async fn assignment(&self, id: Uuid) -> StoreResult<Option<DeliveryAssignment>> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::fetch_assignment(&mut conn, id).await
    }

    async fn bill(&self, id: Uuid) -> StoreResult<Option<Bill>> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::fetch_bill(&mut conn, id).await
    }

    async fn donations(&self, filter: &DonationFilter) -> StoreResult<Vec<Donation>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM donations WHERE TRUE", DONATION_COLUMNS));
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(category) = filter.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(donor_id) = filter.donor_id {
            qb.push(" AND donor_id = ").push_bind(donor_id);
        }
        if let Some(partner_id) = filter.partner_id {
            qb.push(" AND assigned_partner_id = ").push_bind(partner_id);
        }
        if let Some(before) = filter.deadline_before {
            qb.push(" AND spoil_deadline < ").push_bind(before);
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build_query_as::<DonationRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(Donation::try_from).collect()
    }

    async fn requests(&self, filter: &RequestFilter) -> StoreResult<Vec<FoodRequest>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM food_requests WHERE TRUE", REQUEST_COLUMNS));
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(category) = filter.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(requester_id) = filter.requester_id {
            qb.push(" AND requester_id = ").push_bind(requester_id);
        }
        if let Some(donation_id) = filter.donation_id {
            qb.push(" AND donation_id = ").push_bind(donation_id);
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build_query_as::<RequestRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(FoodRequest::try_from).collect()
    }

    async fn assignments(&self, filter: &AssignmentFilter) -> StoreResult<Vec<DeliveryAssignment>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM delivery_assignments WHERE TRUE",
            ASSIGNMENT_COLUMNS
        ));
        if let Some(donation_id) = filter.donation_id {
            qb.push(" AND donation_id = ").push_bind(donation_id);
        }
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(partner_id) = filter.partner_id {
            qb.push(" AND partner_id = ").push_bind(partner_id);
        }
        qb.push(" ORDER BY offered_at, id");

        let rows = qb
            .build_query_as::<AssignmentRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(DeliveryAssignment::try_from).collect()
    }

    async fn bills(&self, filter: &BillFilter) -> StoreResult<Vec<Bill>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM bills WHERE TRUE", BILL_COLUMNS));
        if let Some(donation_id) = filter.donation_id {
            qb.push(" AND donation_id = ").push_bind(donation_id);
        }
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(receiver_id) = filter.receiver_id {
            qb.push(" AND receiver_id = ").push_bind(receiver_id);
        }
        qb.push(" ORDER BY created_at, id");

        let rows = qb
            .build_query_as::<BillRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(Bill::try_from).collect()
    }

    async fn commit(&self, unit: UnitOfWork) -> StoreResult<Committed> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut touched = Vec::new();
        let mut events = Vec::new();

        for change in &unit.changes {
            if let Err(e) = Self::apply(&mut *tx, change, unit.at, &mut touched, &mut events).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback after rejected unit failed");
                }
                debug!(error = %e, "Unit of work rejected");
                return Err(e);
            }
        }

        let mut committed = Committed {
            donations: Vec::with_capacity(touched.len()),
            events,
        };
        for id in touched {
            if let Some(donation) = Self::fetch_donation(&mut *tx, id).await? {
                committed.donations.push(donation);
            }
        }

        tx.commit().await.map_err(|e| match unit.changes.first() {
            Some(change) if is_lost_race(&e) => {
                let (entity, id) = change_subject(change);
                StoreError::conflict(entity, id, e.to_string())
            }
            _ => backend(e),
        })?;
        Ok(committed)
    }

    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT position, envelope FROM event_outbox WHERE published_at IS NULL ORDER BY position LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let envelope: EventEnvelope = serde_json::from_value(row.envelope)
                    .map_err(|e| corrupt("outbox envelope", e))?;
                Ok(OutboxEntry {
                    position: row.position,
                    envelope,
                })
            })
            .collect()
    }

    async fn mark_published(&self, positions: &[i64]) -> StoreResult<()> {
        if positions.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE event_outbox SET published_at = now() WHERE position = ANY($1) AND published_at IS NULL",
        )
        .bind(positions)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_clause_shape() {
        let clause = expect_clause("partner_id", 8, 9);
        assert!(clause.contains("$8::text = 'VACANT' AND partner_id IS NULL"));
        assert!(clause.contains("partner_id = $9::uuid"));
    }

    #[test]
    fn test_guard_parameters() {
        let id = Uuid::new_v4();
        assert_eq!(expect_params(&Expect::Held(id)), ("HELD", Some(id)));
        assert_eq!(expect_params(&Expect::Vacant), ("VACANT", None));
        assert_eq!(assign_params(&Assign::Clear), (true, None));
        assert_eq!(assign_params(&Assign::Keep), (false, None));
        assert_eq!(deadline_param(&DeadlineGuard::Lapsed), "LAPSED");
    }

    #[test]
    fn test_lock_races_are_conflicts() {
        assert!(is_lost_race_code("40P01"));
        assert!(is_lost_race_code("40001"));
        assert!(!is_lost_race_code(UNIQUE_VIOLATION));
        assert!(!is_lost_race_code("42P01"));
    }

    #[test]
    fn test_emitted_events_are_reported_against_their_donation() {
        let donation_id = Uuid::new_v4();
        let event = DomainEvent::DonationSettled(foodlink_shared::models::events::DonationSettledEvent {
            donation_id,
            bill_id: Uuid::new_v4(),
            settled_at: Utc::now(),
        });
        assert_eq!(
            change_subject(&Change::Emit(event)),
            (EntityKind::Donation, donation_id)
        );
    }

    #[test]
    fn test_row_decoding_rejects_unknown_status() {
        let now = Utc::now();
        let row = AssignmentRow {
            id: Uuid::new_v4(),
            donation_id: Uuid::new_v4(),
            partner_id: None,
            status: "LOST".to_string(),
            decline_reason: None,
            offered_at: now,
            responded_at: None,
            completed_at: None,
        };
        assert!(matches!(
            DeliveryAssignment::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}
