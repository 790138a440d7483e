//! The attendance ledger: the authoritative, append-only list of accepted
//! attendance facts.

use crate::geo::ReportedLocation;
use chrono::{DateTime, Utc};
use db::models::attendance_record::{ActiveModel, AttendanceStatus, Column, Entity};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, SqlErr,
};
use thiserror::Error;

pub use db::models::attendance_record::Model as AttendanceRecord;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Attendance for this `(user, session)` already exists. Carries the
    /// existing record's timestamp so callers can say "already marked at
    /// 10:02" instead of failing generically.
    #[error("attendance already recorded at {taken_at}")]
    Duplicate { taken_at: DateTime<Utc> },

    #[error(transparent)]
    Db(#[from] DbErr),
}

pub struct AttendanceLedger;

impl AttendanceLedger {
    /// Inserts an attendance record, exactly once per `(user_id, session_id)`.
    ///
    /// The insert races directly against the composite primary key rather
    /// than checking first; under concurrent submissions exactly one caller
    /// wins and the rest observe [`LedgerError::Duplicate`].
    pub async fn record_attendance(
        db: &DatabaseConnection,
        user_id: i64,
        session_id: i64,
        token_id: &str,
        location: Option<ReportedLocation>,
        status: AttendanceStatus,
        now: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        let row = ActiveModel {
            session_id: Set(session_id),
            user_id: Set(user_id),
            token_id: Set(token_id.to_owned()),
            taken_at: Set(now),
            status: Set(status),
            lat: Set(location.map(|l| l.lat)),
            lng: Set(location.map(|l| l.lng)),
            accuracy_m: Set(location.and_then(|l| l.accuracy_m)),
        };

        match row.insert(db).await {
            Ok(record) => Ok(record),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                match Entity::find_by_id((session_id, user_id)).one(db).await? {
                    Some(existing) => Err(LedgerError::Duplicate {
                        taken_at: existing.taken_at,
                    }),
                    // The winning row vanished between the conflict and the
                    // read; nothing in this subsystem deletes records, so
                    // report the original failure.
                    None => Err(LedgerError::Db(err)),
                }
            }
            Err(err) => Err(LedgerError::Db(err)),
        }
    }

    /// A user's attendance history, newest first, capped at `limit`.
    pub async fn query_by_user(
        db: &DatabaseConnection,
        user_id: i64,
        limit: u64,
    ) -> Result<Vec<AttendanceRecord>, DbErr> {
        Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::TakenAt)
            .limit(limit)
            .all(db)
            .await
    }

    /// Every record for a session, newest first. Feeds host-side listings
    /// and exports.
    pub async fn query_by_session(
        db: &DatabaseConnection,
        session_id: i64,
    ) -> Result<Vec<AttendanceRecord>, DbErr> {
        Entity::find()
            .filter(Column::SessionId.eq(session_id))
            .order_by_desc(Column::TakenAt)
            .all(db)
            .await
    }
}
