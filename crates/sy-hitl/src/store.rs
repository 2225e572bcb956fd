use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use sy_core::types::{
    AgentRecommendation, Decision, HitlRequest, ReviewStatus, TaskType, Trigger, Urgency,
    UrgencyBreakdown,
};
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// Async SQLite-backed store for pending and decided review requests.
///
/// The store is the sole owner of request state. The one state transition
/// (`pending -> decided`) is a single guarded UPDATE, so concurrent
/// submissions for the same id cannot both apply; losers observe
/// `AlreadyDecided` and treat it as a no-op.
pub struct HitlDb {
    conn: Connection,
}

/// SQL fragment ranking urgency for the high-to-low inbox ordering.
const URGENCY_RANK: &str = "CASE urgency WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END";

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

// ---------------------------------------------------------------------------
// Row views
// ---------------------------------------------------------------------------

/// A decided request's terminal fields.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub decision: Decision,
    pub reviewer: String,
    pub notes: String,
    pub modified_action: Option<serde_json::Value>,
    pub decided_at: DateTime<Utc>,
}

/// A full row: the original request plus its lifecycle state.
#[derive(Debug, Clone)]
pub struct StoredReview {
    pub request: HitlRequest,
    pub status: ReviewStatus,
    pub outcome: Option<ReviewOutcome>,
}

/// Result of the decide compare-and-swap.
#[derive(Debug, Clone)]
pub enum DecideOutcome {
    /// The transition applied; carries the original request so the caller
    /// can audit and re-enqueue without a second read.
    Applied(HitlRequest),
    /// Someone already decided this id. Idempotent no-op, not an error.
    AlreadyDecided,
    NotFound,
}

impl HitlDb {
    /// Open (or create) a store at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory store (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS hitl_requests (
                        id                TEXT PRIMARY KEY,
                        tenant_id         TEXT NOT NULL,
                        task_type         TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        urgency           TEXT NOT NULL,
                        triggers          TEXT NOT NULL,
                        task_data         TEXT NOT NULL,
                        ai_recommendation TEXT,
                        context           TEXT NOT NULL,
                        origin_queue      TEXT NOT NULL,
                        priority          INTEGER NOT NULL,
                        created_at        TEXT NOT NULL,
                        decision          TEXT,
                        reviewer          TEXT,
                        notes             TEXT,
                        modified_action   TEXT,
                        decided_at        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_hitl_status  ON hitl_requests(status);
                    CREATE INDEX IF NOT EXISTS idx_hitl_tenant  ON hitl_requests(tenant_id);
                    CREATE INDEX IF NOT EXISTS idx_hitl_urgency ON hitl_requests(urgency);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store a new pending request. The id must be fresh.
    pub async fn insert_pending(&self, req: &HitlRequest) -> Result<(), tokio_rusqlite::Error> {
        let id = req.id.to_string();
        let tenant_id = req.tenant_id.clone();
        let task_type = enum_to_sql(&req.task_type);
        let urgency = enum_to_sql(&req.urgency);
        let triggers = serde_json::to_string(&req.triggers).expect("serialize triggers");
        let task_data = req.task_data.to_string();
        let ai_recommendation = req
            .ai_recommendation
            .as_ref()
            .map(|r| serde_json::to_string(r).expect("serialize recommendation"));
        let context = req.context.to_string();
        let origin_queue = req.origin_queue.clone();
        let priority = req.priority as i64;
        let created_at = req.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO hitl_requests (id, tenant_id, task_type, status, urgency,
                        triggers, task_data, ai_recommendation, context, origin_queue,
                        priority, created_at)
                     VALUES (?1,?2,?3,'pending',?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        id,
                        tenant_id,
                        task_type,
                        urgency,
                        triggers,
                        task_data,
                        ai_recommendation,
                        context,
                        origin_queue,
                        priority,
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Compare-and-swap `pending -> decided`. Exactly one caller per id can
    /// ever observe `Applied`.
    pub async fn decide(
        &self,
        id: Uuid,
        decision: Decision,
        reviewer: &str,
        notes: &str,
        modified_action: Option<serde_json::Value>,
        decided_at: DateTime<Utc>,
    ) -> Result<DecideOutcome, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let decision_str = enum_to_sql(&decision);
        let reviewer = reviewer.to_string();
        let notes = notes.to_string();
        let modified_action = modified_action.map(|v| v.to_string());
        let decided_at_str = decided_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE hitl_requests
                     SET status = 'decided', decision = ?2, reviewer = ?3, notes = ?4,
                         modified_action = ?5, decided_at = ?6
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![
                        id_str,
                        decision_str,
                        reviewer,
                        notes,
                        modified_action,
                        decided_at_str,
                    ],
                )?;

                if updated == 1 {
                    let mut stmt = conn.prepare(&select_sql("WHERE id = ?1"))?;
                    let mut rows = stmt.query(rusqlite::params![id_str])?;
                    match rows.next()? {
                        Some(row) => Ok(DecideOutcome::Applied(row_to_review(row)?.request)),
                        None => Ok(DecideOutcome::NotFound),
                    }
                } else {
                    let mut stmt =
                        conn.prepare("SELECT status FROM hitl_requests WHERE id = ?1")?;
                    let mut rows = stmt.query(rusqlite::params![id_str])?;
                    match rows.next()? {
                        Some(_) => Ok(DecideOutcome::AlreadyDecided),
                        None => Ok(DecideOutcome::NotFound),
                    }
                }
            })
            .await
    }

    /// Promote a pending request to a strictly higher urgency tier. The
    /// guard on `status = 'pending'` makes a promotion that races a
    /// decision a silent loser, and the rank comparison keeps urgency
    /// monotonically non-decreasing. Returns whether a row changed.
    pub async fn promote(
        &self,
        id: Uuid,
        to: Urgency,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let to_str = enum_to_sql(&to);
        let to_rank = to as i64;

        self.conn
            .call(move |conn| {
                let updated = conn.execute(
                    &format!(
                        "UPDATE hitl_requests SET urgency = ?2
                         WHERE id = ?1 AND status = 'pending' AND {URGENCY_RANK} < ?3"
                    ),
                    rusqlite::params![id_str, to_str, to_rank],
                )?;
                Ok(updated == 1)
            })
            .await
    }

    /// Delete decided records whose decision is older than the cutoff.
    /// Pending rows are never touched.
    pub async fn purge_decided_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, tokio_rusqlite::Error> {
        let cutoff_str = cutoff.to_rfc3339();
        self.conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM hitl_requests
                     WHERE status = 'decided' AND decided_at < ?1",
                    rusqlite::params![cutoff_str],
                )?;
                Ok(deleted)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Option<StoredReview>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_sql("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_review(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Pending requests for one tenant, urgency high-to-low then oldest
    /// first within a tier. The whole result is materialized, so callers
    /// can page over it without the store holding cursor state.
    pub async fn list_pending(
        &self,
        tenant_id: &str,
        urgency: Option<Urgency>,
    ) -> Result<Vec<HitlRequest>, tokio_rusqlite::Error> {
        let tenant = tenant_id.to_string();
        let urgency_str = urgency.map(|u| enum_to_sql(&u));
        self.conn
            .call(move |conn| {
                let order = format!("ORDER BY {URGENCY_RANK} DESC, created_at ASC");
                let mut out = Vec::new();
                match urgency_str {
                    Some(u) => {
                        let mut stmt = conn.prepare(&select_sql(&format!(
                            "WHERE status = 'pending' AND tenant_id = ?1 AND urgency = ?2 {order}"
                        )))?;
                        let mut rows = stmt.query(rusqlite::params![tenant, u])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_review(row)?.request);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&select_sql(&format!(
                            "WHERE status = 'pending' AND tenant_id = ?1 {order}"
                        )))?;
                        let mut rows = stmt.query(rusqlite::params![tenant])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_review(row)?.request);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Pending request ids in one urgency tier created before the cutoff,
    /// across all tenants. Feeds the promotion patrol.
    pub async fn pending_older_than(
        &self,
        urgency: Urgency,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, tokio_rusqlite::Error> {
        let urgency_str = enum_to_sql(&urgency);
        let cutoff_str = cutoff.to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM hitl_requests
                     WHERE status = 'pending' AND urgency = ?1 AND created_at < ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![urgency_str, cutoff_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id_str: String = row.get(0)?;
                    out.push(Uuid::parse_str(&id_str).expect("valid uuid"));
                }
                Ok(out)
            })
            .await
    }

    pub async fn pending_count(&self) -> Result<u64, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let count: u64 = conn
                    .prepare("SELECT COUNT(*) FROM hitl_requests WHERE status = 'pending'")?
                    .query_row([], |r| r.get(0))?;
                Ok(count)
            })
            .await
    }

    pub async fn pending_by_urgency(&self) -> Result<UrgencyBreakdown, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let count = |urgency: &str| -> rusqlite::Result<u64> {
                    let mut stmt = conn.prepare(
                        "SELECT COUNT(*) FROM hitl_requests
                         WHERE status = 'pending' AND urgency = ?1",
                    )?;
                    stmt.query_row(rusqlite::params![urgency], |r| r.get::<_, u64>(0))
                };
                Ok(UrgencyBreakdown {
                    low: count("low")?,
                    medium: count("medium")?,
                    high: count("high")?,
                })
            })
            .await
    }

    /// Number of requests decided at or after the cutoff.
    pub async fn decided_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, tokio_rusqlite::Error> {
        let cutoff_str = cutoff.to_rfc3339();
        self.conn
            .call(move |conn| {
                let count: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM hitl_requests
                         WHERE status = 'decided' AND decided_at >= ?1",
                    )?
                    .query_row(rusqlite::params![cutoff_str], |r| r.get(0))?;
                Ok(count)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn select_sql(tail: &str) -> String {
    format!(
        "SELECT id, tenant_id, task_type, status, urgency, triggers, task_data,
                ai_recommendation, context, origin_queue, priority, created_at,
                decision, reviewer, notes, modified_action, decided_at
         FROM hitl_requests {tail}"
    )
}

fn row_to_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReview> {
    let id_str: String = row.get(0)?;
    let task_type_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let urgency_str: String = row.get(4)?;
    let triggers_str: String = row.get(5)?;
    let task_data_str: String = row.get(6)?;
    let recommendation_str: Option<String> = row.get(7)?;
    let context_str: String = row.get(8)?;
    let priority_val: i64 = row.get(10)?;
    let created_at_str: String = row.get(11)?;
    let decision_str: Option<String> = row.get(12)?;
    let modified_action_str: Option<String> = row.get(15)?;
    let decided_at_str: Option<String> = row.get(16)?;

    let task_type: TaskType = enum_from_sql(&task_type_str);
    let status: ReviewStatus = enum_from_sql(&status_str);
    let urgency: Urgency = enum_from_sql(&urgency_str);
    let triggers: BTreeSet<Trigger> =
        serde_json::from_str(&triggers_str).expect("valid triggers json");
    let ai_recommendation: Option<AgentRecommendation> = recommendation_str
        .map(|s| serde_json::from_str(&s).expect("valid recommendation json"));

    let request = HitlRequest {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        tenant_id: row.get(1)?,
        task_type,
        urgency,
        triggers,
        task_data: serde_json::from_str(&task_data_str).expect("valid json"),
        ai_recommendation,
        context: serde_json::from_str(&context_str).expect("valid json"),
        origin_queue: row.get(9)?,
        priority: priority_val as u8,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .expect("valid date")
            .with_timezone(&Utc),
    };

    let outcome = match (decision_str, decided_at_str) {
        (Some(decision), Some(decided_at)) => Some(ReviewOutcome {
            decision: enum_from_sql(&decision),
            reviewer: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            notes: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            modified_action: modified_action_str
                .map(|s| serde_json::from_str(&s).expect("valid json")),
            decided_at: chrono::DateTime::parse_from_rfc3339(&decided_at)
                .expect("valid date")
                .with_timezone(&Utc),
        }),
        _ => None,
    };

    Ok(StoredReview {
        request,
        status,
        outcome,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn request(tenant: &str, urgency: Urgency) -> HitlRequest {
        HitlRequest::new(
            tenant,
            TaskType::Order,
            urgency,
            BTreeSet::from([Trigger::HighValue]),
            json!({"amount": 6000.0}),
            None,
            "order.auto",
            5,
        )
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let req = request("acme", Urgency::Medium).with_context(json!({"history": []}));
        db.insert_pending(&req).await.unwrap();

        let stored = db.get(req.id).await.unwrap().expect("row present");
        assert_eq!(stored.status, ReviewStatus::Pending);
        assert!(stored.outcome.is_none());
        assert_eq!(stored.request.tenant_id, "acme");
        assert_eq!(stored.request.urgency, Urgency::Medium);
        assert_eq!(stored.request.triggers, req.triggers);
        assert_eq!(stored.request.task_data["amount"], 6000.0);
        assert_eq!(stored.request.origin_queue, "order.auto");
    }

    #[tokio::test]
    async fn decide_applies_exactly_once() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let req = request("acme", Urgency::High);
        db.insert_pending(&req).await.unwrap();

        let first = db
            .decide(req.id, Decision::Approve, "sam", "looks fine", None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, DecideOutcome::Applied(_)));

        let second = db
            .decide(req.id, Decision::Reject, "pat", "", None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, DecideOutcome::AlreadyDecided));

        // The stored record kept the first decision.
        let stored = db.get(req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Decided);
        let outcome = stored.outcome.unwrap();
        assert_eq!(outcome.decision, Decision::Approve);
        assert_eq!(outcome.reviewer, "sam");
    }

    #[tokio::test]
    async fn decide_unknown_id_is_not_found() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let outcome = db
            .decide(Uuid::new_v4(), Decision::Approve, "sam", "", None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, DecideOutcome::NotFound));
    }

    #[tokio::test]
    async fn list_pending_orders_by_urgency_then_age() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let mut old_low = request("acme", Urgency::Low);
        old_low.created_at = Utc::now() - Duration::hours(3);
        let mut young_high = request("acme", Urgency::High);
        young_high.created_at = Utc::now() - Duration::minutes(1);
        let mut old_high = request("acme", Urgency::High);
        old_high.created_at = Utc::now() - Duration::hours(1);

        db.insert_pending(&old_low).await.unwrap();
        db.insert_pending(&young_high).await.unwrap();
        db.insert_pending(&old_high).await.unwrap();

        let listed = db.list_pending("acme", None).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![old_high.id, young_high.id, old_low.id]);
    }

    #[tokio::test]
    async fn list_pending_filters_by_urgency() {
        let db = HitlDb::new_in_memory().await.unwrap();
        db.insert_pending(&request("acme", Urgency::Low)).await.unwrap();
        db.insert_pending(&request("acme", Urgency::High)).await.unwrap();

        let high_only = db.list_pending("acme", Some(Urgency::High)).await.unwrap();
        assert_eq!(high_only.len(), 1);
        assert_eq!(high_only[0].urgency, Urgency::High);
    }

    #[tokio::test]
    async fn list_pending_is_tenant_scoped() {
        let db = HitlDb::new_in_memory().await.unwrap();
        db.insert_pending(&request("acme", Urgency::Low)).await.unwrap();
        db.insert_pending(&request("globex", Urgency::High)).await.unwrap();

        let acme = db.list_pending("acme", None).await.unwrap();
        assert_eq!(acme.len(), 1);
        assert!(acme.iter().all(|r| r.tenant_id == "acme"));

        let nobody = db.list_pending("initech", None).await.unwrap();
        assert!(nobody.is_empty());
    }

    #[tokio::test]
    async fn decided_requests_leave_the_pending_list() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let req = request("acme", Urgency::Low);
        db.insert_pending(&req).await.unwrap();
        db.decide(req.id, Decision::Reject, "sam", "", None, Utc::now())
            .await
            .unwrap();
        assert!(db.list_pending("acme", None).await.unwrap().is_empty());
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_is_monotonic_and_pending_only() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let req = request("acme", Urgency::Low);
        db.insert_pending(&req).await.unwrap();

        assert!(db.promote(req.id, Urgency::Medium).await.unwrap());
        // Demotion attempts match zero rows.
        assert!(!db.promote(req.id, Urgency::Low).await.unwrap());
        assert!(db.promote(req.id, Urgency::High).await.unwrap());

        db.decide(req.id, Decision::Approve, "sam", "", None, Utc::now())
            .await
            .unwrap();
        // Promotion against a decided row loses the race and is a no-op.
        assert!(!db.promote(req.id, Urgency::High).await.unwrap());
    }

    #[tokio::test]
    async fn pending_older_than_selects_the_right_tier() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let mut stale = request("acme", Urgency::Low);
        stale.created_at = Utc::now() - Duration::hours(5);
        let fresh = request("acme", Urgency::Low);
        db.insert_pending(&stale).await.unwrap();
        db.insert_pending(&fresh).await.unwrap();

        let cutoff = Utc::now() - Duration::hours(4);
        let overdue = db.pending_older_than(Urgency::Low, cutoff).await.unwrap();
        assert_eq!(overdue, vec![stale.id]);
    }

    #[tokio::test]
    async fn metrics_counts_and_breakdown() {
        let db = HitlDb::new_in_memory().await.unwrap();
        db.insert_pending(&request("acme", Urgency::Low)).await.unwrap();
        db.insert_pending(&request("acme", Urgency::High)).await.unwrap();
        let decided = request("acme", Urgency::Medium);
        db.insert_pending(&decided).await.unwrap();
        db.decide(decided.id, Decision::Approve, "sam", "", None, Utc::now())
            .await
            .unwrap();

        assert_eq!(db.pending_count().await.unwrap(), 2);
        let breakdown = db.pending_by_urgency().await.unwrap();
        assert_eq!(breakdown.low, 1);
        assert_eq!(breakdown.medium, 0);
        assert_eq!(breakdown.high, 1);
        assert_eq!(
            db.decided_since(Utc::now() - Duration::hours(1)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn purge_removes_only_old_decided_rows() {
        let db = HitlDb::new_in_memory().await.unwrap();
        let pending = request("acme", Urgency::Low);
        db.insert_pending(&pending).await.unwrap();

        let old = request("acme", Urgency::Low);
        db.insert_pending(&old).await.unwrap();
        db.decide(
            old.id,
            Decision::Reject,
            "sam",
            "",
            None,
            Utc::now() - Duration::days(120),
        )
        .await
        .unwrap();

        let purged = db
            .purge_decided_before(Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(db.get(old.id).await.unwrap().is_none());
        // Pending rows are retained no matter how old.
        assert!(db.get(pending.id).await.unwrap().is_some());
    }
}
