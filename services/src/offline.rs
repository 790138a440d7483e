//! Offline cache and reconciler.
//!
//! When the store is unreachable a scan is buffered as a pending intent in
//! the client's local database and acknowledged as "recorded locally" —
//! never as a confirmed success. Once connectivity returns, the queue is
//! drained in capture order through the exact same verification path used
//! for online scans.

use crate::geo::ReportedLocation;
use crate::verification::{VerificationService, VerifyError, VerifyOutcome};
use chrono::{DateTime, Utc};
use db::models::pending_intent::{self, SyncState};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

pub use db::models::pending_intent::Model as PendingIntent;

/// The single injected "is the store reachable" capability. Online and
/// offline scans share every other line of the path.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// For embedding the client where the store is local, and for tests.
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// What the user is told right after a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanAck {
    /// The server of record accepted (or had already accepted) the scan.
    Confirmed(VerifyOutcome),
    /// Stored locally; will sync when connectivity returns.
    QueuedLocally { local_id: String },
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub rejected: usize,
    pub still_pending: usize,
    /// Local ids of the intents resolved this pass (synced or rejected), in
    /// replay order — always `captured_at` ascending.
    pub replayed: Vec<String>,
}

pub struct ScanClient {
    service: VerificationService,
    connectivity: Arc<dyn Connectivity>,
    /// Server of record.
    remote: DatabaseConnection,
    /// Durable client-side cache; survives process restarts.
    local: DatabaseConnection,
}

impl ScanClient {
    pub fn new(
        service: VerificationService,
        connectivity: Arc<dyn Connectivity>,
        remote: DatabaseConnection,
        local: DatabaseConnection,
    ) -> Self {
        Self {
            service,
            connectivity,
            remote,
            local,
        }
    }

    /// Handles one decoded token string. Online scans go straight through
    /// `verify`; offline ones (including those that find out the hard way,
    /// via `Unreachable`) are buffered locally.
    pub async fn scan(
        &self,
        token_id: &str,
        user: Option<i64>,
        reported: Option<ReportedLocation>,
        now: DateTime<Utc>,
    ) -> Result<ScanAck, VerifyError> {
        // Authentication is local knowledge; an unauthenticated scan is not
        // worth buffering.
        let Some(user_id) = user else {
            return Err(VerifyError::Unauthenticated);
        };

        if !self.connectivity.is_online() {
            let local_id = self
                .enqueue(token_id, user_id, reported, now)
                .await
                .map_err(VerifyError::Persistence)?;
            return Ok(ScanAck::QueuedLocally { local_id });
        }

        match self
            .service
            .verify(&self.remote, token_id, user, reported, now)
            .await
        {
            Ok(outcome) => Ok(ScanAck::Confirmed(outcome)),
            Err(VerifyError::Unreachable(reason)) => {
                log::info!("store unreachable ({reason}); buffering scan locally");
                let local_id = self
                    .enqueue(token_id, user_id, reported, now)
                    .await
                    .map_err(VerifyError::Persistence)?;
                Ok(ScanAck::QueuedLocally { local_id })
            }
            Err(err) => Err(err),
        }
    }

    async fn enqueue(
        &self,
        token_id: &str,
        user_id: i64,
        reported: Option<ReportedLocation>,
        captured_at: DateTime<Utc>,
    ) -> Result<String, DbErr> {
        let local_id = Uuid::new_v4().to_string();
        pending_intent::ActiveModel {
            local_id: Set(local_id.clone()),
            token_id: Set(token_id.to_owned()),
            user_id: Set(user_id),
            lat: Set(reported.map(|l| l.lat)),
            lng: Set(reported.map(|l| l.lng)),
            accuracy_m: Set(reported.and_then(|l| l.accuracy_m)),
            captured_at: Set(captured_at),
            sync_state: Set(SyncState::Pending),
            reject_reason: Set(None),
            created_at: Set(captured_at),
        }
        .insert(&self.local)
        .await?;
        Ok(local_id)
    }

    /// Replays buffered intents against the server, oldest capture first,
    /// strictly one at a time.
    ///
    /// `AlreadyRecorded` counts as synced: the user's attendance exists, no
    /// matter which device created it. Terminal rejections are kept with a
    /// reason for the user to act on. If the store drops away mid-drain, the
    /// pass stops and the remainder stays pending, still in order.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<DrainReport, DbErr> {
        let queue = pending_intent::Entity::find()
            .filter(pending_intent::Column::SyncState.eq(SyncState::Pending))
            .order_by_asc(pending_intent::Column::CapturedAt)
            .all(&self.local)
            .await?;

        let mut report = DrainReport::default();
        let mut halted = false;

        for intent in queue {
            if halted {
                report.still_pending += 1;
                continue;
            }

            let reported = intent_location(&intent);
            // Token validity is judged now; the Present/Late decision uses
            // the moment the user actually scanned.
            match self
                .service
                .verify_at(
                    &self.remote,
                    &intent.token_id,
                    Some(intent.user_id),
                    reported,
                    intent.captured_at,
                    now,
                )
                .await
            {
                Ok(outcome) => {
                    report.replayed.push(intent.local_id.clone());
                    if let VerifyOutcome::AlreadyRecorded { taken_at } = &outcome {
                        log::debug!(
                            "intent {} already recorded server-side at {}",
                            intent.local_id,
                            taken_at
                        );
                    }
                    self.resolve(intent, SyncState::Synced, None).await?;
                    report.synced += 1;
                }
                Err(err) if err.is_terminal() => {
                    report.replayed.push(intent.local_id.clone());
                    log::info!("intent rejected during sync: {err}");
                    self.resolve(intent, SyncState::Rejected, Some(err.to_string()))
                        .await?;
                    report.rejected += 1;
                }
                Err(err) => {
                    // Unreachable or a store failure: keep the rest of the
                    // queue for the next pass.
                    log::warn!("reconciliation halted: {err}");
                    halted = true;
                    report.still_pending += 1;
                }
            }
        }

        Ok(report)
    }

    async fn resolve(
        &self,
        intent: PendingIntent,
        state: SyncState,
        reason: Option<String>,
    ) -> Result<(), DbErr> {
        let mut row = intent.into_active_model();
        row.sync_state = Set(state);
        row.reject_reason = Set(reason);
        row.update(&self.local).await?;
        Ok(())
    }

    /// Unsynced intents, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingIntent>, DbErr> {
        self.in_state(SyncState::Pending).await
    }

    /// Intents that failed terminally during sync, for the user to re-scan.
    pub async fn rejected(&self) -> Result<Vec<PendingIntent>, DbErr> {
        self.in_state(SyncState::Rejected).await
    }

    async fn in_state(&self, state: SyncState) -> Result<Vec<PendingIntent>, DbErr> {
        pending_intent::Entity::find()
            .filter(pending_intent::Column::SyncState.eq(state))
            .order_by_asc(pending_intent::Column::CapturedAt)
            .all(&self.local)
            .await
    }
}

fn intent_location(intent: &PendingIntent) -> Option<ReportedLocation> {
    match (intent.lat, intent.lng) {
        (Some(lat), Some(lng)) => Some(ReportedLocation {
            lat,
            lng,
            accuracy_m: intent.accuracy_m,
        }),
        _ => None,
    }
}
