//! Issues time-boxed attendance tokens and rotates them while a session is
//! live.
//!
//! The issuer owns the `session_id -> active token` map and is its only
//! writer. Rotation policy lives elsewhere: an external scheduler (or the
//! host display's refresh tick) calls [`TokenIssuer::rotate`] when the
//! current token has run out.

use crate::geo::Geofence;
use chrono::{DateTime, Duration, Utc};
use db::models::{session, token};
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, Set};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub use db::models::token::Model as Token;

/// Per-session active-token pointer, locked independently of every other
/// session's.
type Slot = Arc<Mutex<Option<Token>>>;

#[derive(Default)]
pub struct TokenIssuer {
    sessions: RwLock<HashMap<i64, Slot>>,
}

impl TokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token valid from `now` for `duration`, persists it, and
    /// makes it the session's active token.
    pub async fn issue(
        &self,
        db: &DatabaseConnection,
        session_id: i64,
        duration: Duration,
        geofence: Option<Geofence>,
        now: DateTime<Utc>,
    ) -> Result<Token, DbErr> {
        let slot = self.slot(session_id).await;
        let mut active = slot.lock().await;

        let issued = insert_token(db, session_id, duration, geofence, now).await?;
        *active = Some(issued.clone());

        log::info!(
            "issued token {} for session {} (valid until {})",
            issued.id,
            session_id,
            issued.valid_until
        );
        Ok(issued)
    }

    /// The token a host display should currently render, if any.
    pub async fn active(&self, session_id: i64) -> Option<Token> {
        let slot = self.sessions.read().await.get(&session_id).cloned()?;
        let active = slot.lock().await;
        active.clone()
    }

    /// Replaces an expired active token.
    ///
    /// Idempotent per expiry: while the current token is still valid this is
    /// a no-op returning it unchanged, so two schedulers firing for the same
    /// tick rotate once. Once the session has ended the final token is
    /// retired and the session stays without an active token for good.
    pub async fn rotate(
        &self,
        db: &DatabaseConnection,
        session_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Token>, DbErr> {
        let Some(slot) = self.sessions.read().await.get(&session_id).cloned() else {
            return Ok(None);
        };
        let mut active = slot.lock().await;

        let Some(current) = active.clone() else {
            return Ok(None);
        };
        if current.is_valid_at(now) {
            return Ok(Some(current));
        }

        let mut retired = current.clone().into_active_model();
        retired.status = Set(token::TokenStatus::Expired);
        retired.update(db).await?;

        let still_live = session::Entity::find_by_id(session_id)
            .one(db)
            .await?
            .map(|s| s.is_live_at(now))
            .unwrap_or(false);
        if !still_live {
            *active = None;
            log::info!("session {} ended; no replacement token issued", session_id);
            return Ok(None);
        }

        // Same window length and geofence as the token being replaced.
        let duration = current.valid_until - current.valid_from;
        let geofence = geofence_of(&current);
        let replacement = insert_token(db, session_id, duration, geofence, now).await?;
        *active = Some(replacement.clone());

        log::info!(
            "rotated session {}: {} -> {}",
            session_id,
            current.id,
            replacement.id
        );
        Ok(Some(replacement))
    }

    /// Get-or-create a session's slot. The map lock is held only long enough
    /// to fetch the entry; the store round trips in `issue`/`rotate` run
    /// under the session-scoped lock, so sessions never contend with each
    /// other.
    async fn slot(&self, session_id: i64) -> Slot {
        if let Some(slot) = self.sessions.read().await.get(&session_id) {
            return slot.clone();
        }
        self.sessions
            .write()
            .await
            .entry(session_id)
            .or_default()
            .clone()
    }
}

async fn insert_token(
    db: &DatabaseConnection,
    session_id: i64,
    duration: Duration,
    geofence: Option<Geofence>,
    now: DateTime<Utc>,
) -> Result<Token, DbErr> {
    token::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        session_id: Set(session_id),
        valid_from: Set(now),
        valid_until: Set(now + duration),
        status: Set(token::TokenStatus::Active),
        center_lat: Set(geofence.map(|g| g.center.lat)),
        center_lng: Set(geofence.map(|g| g.center.lng)),
        radius_m: Set(geofence.map(|g| g.radius_m)),
        created_at: Set(now),
    }
    .insert(db)
    .await
}

/// A token's geofence columns as a value, when all three are present.
pub(crate) fn geofence_of(token: &Token) -> Option<Geofence> {
    match (token.center_lat, token.center_lng, token.radius_m) {
        (Some(lat), Some(lng), Some(radius_m)) => Some(Geofence {
            center: crate::geo::GeoPoint { lat, lng },
            radius_m,
        }),
        _ => None,
    }
}
