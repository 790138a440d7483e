//! The single entry point a scanning client calls: token validity, proximity
//! and idempotent recording, in that order, short-circuiting on the first
//! failure.

use crate::geo::ReportedLocation;
use crate::ledger::{AttendanceLedger, AttendanceRecord, LedgerError};
use crate::token_issuer::geofence_of;
use chrono::{DateTime, Utc};
use db::models::attendance_record::AttendanceStatus;
use db::models::{session, token};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    /// A new attendance record was written.
    Accepted(AttendanceRecord),
    /// Attendance already existed for this user and session; benign, shown
    /// to the user as "already marked", never logged as an error.
    AlreadyRecorded { taken_at: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token not recognised")]
    InvalidToken,

    #[error("token expired or not yet valid")]
    ExpiredOrNotYetValid,

    /// Reported location falls outside the token's geofence. The computed
    /// distance is carried for diagnostics; infinite when no fix was
    /// reported at all for a geofenced token.
    #[error("location is {distance_m:.0} m from the session geofence center")]
    OutOfRange { distance_m: f64 },

    #[error("caller is not authenticated")]
    Unauthenticated,

    /// The store did not answer within the configured timeout, or the
    /// connection is gone. Scanning clients route this into the offline
    /// cache.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The store answered with a failure. Retryable by the caller with
    /// backoff.
    #[error("persistence failure: {0}")]
    Persistence(DbErr),
}

impl VerifyError {
    /// Terminal outcomes end the attempt; the user needs a fresh scan.
    /// Non-terminal ones (`Unreachable`, `Persistence`) may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerifyError::InvalidToken
                | VerifyError::ExpiredOrNotYetValid
                | VerifyError::OutOfRange { .. }
                | VerifyError::Unauthenticated
        )
    }
}

#[derive(Debug, Clone)]
pub struct VerificationService {
    store_timeout: Duration,
    late_after: chrono::Duration,
}

impl VerificationService {
    pub fn new(store_timeout: Duration, late_after: chrono::Duration) -> Self {
        Self {
            store_timeout,
            late_after,
        }
    }

    pub fn from_config() -> Self {
        let config = common::config::Config::get();
        Self::new(
            Duration::from_millis(config.store_timeout_ms),
            chrono::Duration::seconds(config.late_after_seconds),
        )
    }

    /// Verifies a presented token for an authenticated user and records
    /// attendance.
    ///
    /// Steps 1-4 are pure reads; only the ledger insert and the counter bump
    /// write. Every store round trip is bounded by the configured timeout so
    /// this fails closed instead of hanging.
    pub async fn verify(
        &self,
        db: &DatabaseConnection,
        token_id: &str,
        user: Option<i64>,
        reported: Option<ReportedLocation>,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, VerifyError> {
        self.verify_at(db, token_id, user, reported, now, now).await
    }

    /// Like [`Self::verify`], for scans captured earlier than they are
    /// submitted — the reconciler's replay path. Token validity is judged at
    /// `now`; the Present/Late decision uses `captured_at`, when the user
    /// was actually there.
    pub async fn verify_at(
        &self,
        db: &DatabaseConnection,
        token_id: &str,
        user: Option<i64>,
        reported: Option<ReportedLocation>,
        captured_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, VerifyError> {
        let Some(user_id) = user else {
            return Err(VerifyError::Unauthenticated);
        };

        let token = self
            .bounded(token::Entity::find_by_id(token_id.to_owned()).one(db))
            .await?
            .ok_or(VerifyError::InvalidToken)?;

        if !token.is_valid_at(now) {
            return Err(VerifyError::ExpiredOrNotYetValid);
        }

        if let Some(fence) = geofence_of(&token) {
            let distance_m = match reported {
                Some(fix) => fence.distance_to(fix.point()),
                // A geofenced token cannot be honored without a fix.
                None => f64::INFINITY,
            };
            if distance_m > fence.radius_m {
                log::debug!(
                    "scan for session {} out of range: {:.0} m (radius {:.0} m)",
                    token.session_id,
                    distance_m,
                    fence.radius_m
                );
                return Err(VerifyError::OutOfRange { distance_m });
            }
        }

        // A token pointing at a vanished session is as good as invalid.
        let session = self
            .bounded(session::Entity::find_by_id(token.session_id).one(db))
            .await?
            .ok_or(VerifyError::InvalidToken)?;

        let status = if captured_at <= session.start_time + self.late_after {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        };

        let inserted = match tokio::time::timeout(
            self.store_timeout,
            AttendanceLedger::record_attendance(
                db,
                user_id,
                session.id,
                &token.id,
                reported,
                status,
                now,
            ),
        )
        .await
        {
            Err(_) => return Err(VerifyError::Unreachable("ledger write timed out".into())),
            Ok(Err(LedgerError::Duplicate { taken_at })) => {
                log::debug!(
                    "user {} already recorded for session {} at {}",
                    user_id,
                    session.id,
                    taken_at
                );
                return Ok(VerifyOutcome::AlreadyRecorded { taken_at });
            }
            Ok(Err(LedgerError::Db(err))) => return Err(classify_db_error(err)),
            Ok(Ok(record)) => record,
        };

        // Best effort: the counter is a cached convenience, the ledger is
        // the source of truth. Bounded like every other store round trip so
        // an accepted scan is never stuck behind a hung counter write.
        if let Err(err) = self.bounded(bump_attendee_count(db, session.id)).await {
            log::warn!(
                "attendee count bump failed for session {}: {}",
                session.id,
                err
            );
        }

        log::info!(
            "recorded {:?} attendance for user {} in session {}",
            inserted.status,
            user_id,
            session.id
        );
        Ok(VerifyOutcome::Accepted(inserted))
    }

    /// Runs a store read under the configured timeout, folding timeouts and
    /// dead connections into [`VerifyError::Unreachable`].
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, DbErr>>,
    ) -> Result<T, VerifyError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(res) => res.map_err(classify_db_error),
            Err(_) => Err(VerifyError::Unreachable("store call timed out".into())),
        }
    }
}

fn classify_db_error(err: DbErr) -> VerifyError {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => VerifyError::Unreachable(err.to_string()),
        other => VerifyError::Persistence(other),
    }
}

/// Atomic `attendee_count = attendee_count + 1`; no read-modify-write.
async fn bump_attendee_count(db: &DatabaseConnection, session_id: i64) -> Result<(), DbErr> {
    session::Entity::update_many()
        .col_expr(
            session::Column::AttendeeCount,
            Expr::col(session::Column::AttendeeCount).add(1),
        )
        .filter(session::Column::Id.eq(session_id))
        .exec(db)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{GeoPoint, Geofence, ReportedLocation, EARTH_RADIUS_M};
    use crate::test_helpers::{seed_session, seed_token};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use db::test_utils::setup_test_db;
    use futures::future::join_all;

    const CENTER: GeoPoint = GeoPoint {
        lat: 21.1914,
        lng: 81.3014,
    };

    fn service() -> VerificationService {
        VerificationService::new(Duration::from_secs(5), ChronoDuration::minutes(10))
    }

    fn at_center() -> Option<ReportedLocation> {
        Some(ReportedLocation {
            lat: CENTER.lat,
            lng: CENTER.lng,
            accuracy_m: Some(10.0),
        })
    }

    /// The full scenario: accept at 10:02, duplicate at 10:03, expired at
    /// 10:06, and a 500 m-away scan rejected with the distance attached.
    #[tokio::test]
    async fn geofenced_session_scenario() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Morning lecture", start, start + ChronoDuration::hours(1)).await;
        let fence = Geofence {
            center: CENTER,
            radius_m: 100.0,
        };
        let t = seed_token(
            &db,
            s.id,
            start,
            start + ChronoDuration::minutes(5),
            Some(fence),
        )
        .await;

        let svc = service();

        // 10:02, at the center: accepted.
        let outcome = svc
            .verify(
                &db,
                &t.id,
                Some(1),
                at_center(),
                start + ChronoDuration::minutes(2),
            )
            .await
            .unwrap();
        let record = match outcome {
            VerifyOutcome::Accepted(r) => r,
            other => panic!("expected acceptance, got {other:?}"),
        };
        assert_eq!(record.status, AttendanceStatus::Present);

        // 10:03, same user: already recorded, carrying the first timestamp.
        let again = svc
            .verify(
                &db,
                &t.id,
                Some(1),
                at_center(),
                start + ChronoDuration::minutes(3),
            )
            .await
            .unwrap();
        assert_eq!(
            again,
            VerifyOutcome::AlreadyRecorded {
                taken_at: record.taken_at
            }
        );

        // 10:06, different user: the token has run out.
        let expired = svc
            .verify(
                &db,
                &t.id,
                Some(2),
                at_center(),
                start + ChronoDuration::minutes(6),
            )
            .await;
        assert!(matches!(expired, Err(VerifyError::ExpiredOrNotYetValid)));

        // 10:01, third user, 500 m north: out of range with the distance.
        let far = ReportedLocation {
            lat: CENTER.lat + (500.0 / EARTH_RADIUS_M).to_degrees(),
            lng: CENTER.lng,
            accuracy_m: None,
        };
        let out = svc
            .verify(
                &db,
                &t.id,
                Some(3),
                Some(far),
                start + ChronoDuration::minutes(1),
            )
            .await;
        match out {
            Err(VerifyError::OutOfRange { distance_m }) => {
                assert!((distance_m - 500.0).abs() < 1.0, "got {distance_m}");
            }
            other => panic!("expected out of range, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_and_missing_user_are_rejected_up_front() {
        let db = setup_test_db().await;
        let svc = service();
        let now = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();

        let missing_user = svc.verify(&db, "whatever", None, None, now).await;
        assert!(matches!(missing_user, Err(VerifyError::Unauthenticated)));

        let unknown = svc.verify(&db, "no-such-token", Some(1), None, now).await;
        assert!(matches!(unknown, Err(VerifyError::InvalidToken)));
    }

    #[tokio::test]
    async fn geofenced_token_requires_a_location_fix() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(1)).await;
        let fence = Geofence {
            center: CENTER,
            radius_m: 100.0,
        };
        let t = seed_token(
            &db,
            s.id,
            start,
            start + ChronoDuration::minutes(5),
            Some(fence),
        )
        .await;

        let out = service()
            .verify(&db, &t.id, Some(1), None, start + ChronoDuration::minutes(1))
            .await;
        match out {
            Err(VerifyError::OutOfRange { distance_m }) => assert!(distance_m.is_infinite()),
            other => panic!("expected out of range, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_without_geofence_accepts_any_or_no_location() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Webinar", start, start + ChronoDuration::hours(1)).await;
        let t = seed_token(&db, s.id, start, start + ChronoDuration::minutes(5), None).await;

        let out = service()
            .verify(&db, &t.id, Some(9), None, start + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert!(matches!(out, VerifyOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn scans_after_the_grace_window_are_late() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(2)).await;
        let t = seed_token(
            &db,
            s.id,
            start + ChronoDuration::minutes(30),
            start + ChronoDuration::minutes(35),
            None,
        )
        .await;

        let out = service()
            .verify(
                &db,
                &t.id,
                Some(5),
                None,
                start + ChronoDuration::minutes(31),
            )
            .await
            .unwrap();
        match out {
            VerifyOutcome::Accepted(record) => assert_eq!(record.status, AttendanceStatus::Late),
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_scan_bumps_the_attendee_counter() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(1)).await;
        let t = seed_token(&db, s.id, start, start + ChronoDuration::minutes(5), None).await;

        let svc = service();
        let now = start + ChronoDuration::minutes(1);
        svc.verify(&db, &t.id, Some(1), None, now).await.unwrap();
        svc.verify(&db, &t.id, Some(2), None, now).await.unwrap();
        // Duplicate must not bump again.
        svc.verify(&db, &t.id, Some(1), None, now).await.unwrap();

        let stored = session::Entity::find_by_id(s.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attendee_count, 2);
    }

    #[tokio::test]
    async fn concurrent_scans_for_one_user_accept_exactly_once() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(1)).await;
        let t = seed_token(&db, s.id, start, start + ChronoDuration::minutes(5), None).await;

        let svc = service();
        let now = start + ChronoDuration::minutes(1);

        let attempts = (0..5).map(|_| svc.verify(&db, &t.id, Some(77), None, now));
        let results = join_all(attempts).await;

        let mut accepted = 0;
        let mut already = 0;
        for res in results {
            match res.unwrap() {
                VerifyOutcome::Accepted(_) => accepted += 1,
                VerifyOutcome::AlreadyRecorded { .. } => already += 1,
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(already, 4);

        let rows = AttendanceLedger::query_by_session(&db, s.id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn zero_timeout_fails_closed_instead_of_hanging() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(1)).await;
        let t = seed_token(&db, s.id, start, start + ChronoDuration::minutes(5), None).await;

        let svc = VerificationService::new(Duration::from_millis(0), ChronoDuration::minutes(10));
        let res = svc
            .verify(&db, &t.id, Some(1), None, start + ChronoDuration::minutes(1))
            .await;
        assert!(matches!(res, Err(VerifyError::Unreachable(_))), "got {res:?}");
    }

    #[tokio::test]
    async fn replayed_scan_is_graded_at_capture_time() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(2)).await;
        let t = seed_token(&db, s.id, start, start + ChronoDuration::hours(2), None).await;

        // Captured inside the grace window, submitted well after it.
        let captured = start + ChronoDuration::minutes(5);
        let submitted = start + ChronoDuration::minutes(40);
        let out = service()
            .verify_at(&db, &t.id, Some(1), None, captured, submitted)
            .await
            .unwrap();
        match out {
            VerifyOutcome::Accepted(record) => assert_eq!(record.status, AttendanceStatus::Present),
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    /// Tokens rotate within a session without permitting a second record.
    #[tokio::test]
    async fn rotated_token_does_not_allow_a_second_record() {
        let db = setup_test_db().await;
        let start = Utc.with_ymd_and_hms(2026, 8, 28, 10, 0, 0).unwrap();
        let s = seed_session(&db, "Lecture", start, start + ChronoDuration::hours(1)).await;
        let first = seed_token(&db, s.id, start, start + ChronoDuration::minutes(5), None).await;
        let second = seed_token(
            &db,
            s.id,
            start + ChronoDuration::minutes(5),
            start + ChronoDuration::minutes(10),
            None,
        )
        .await;

        let svc = service();
        svc.verify(
            &db,
            &first.id,
            Some(3),
            None,
            start + ChronoDuration::minutes(2),
        )
        .await
        .unwrap();

        let replay = svc
            .verify(
                &db,
                &second.id,
                Some(3),
                None,
                start + ChronoDuration::minutes(7),
            )
            .await
            .unwrap();
        assert!(matches!(replay, VerifyOutcome::AlreadyRecorded { .. }));
    }
}
