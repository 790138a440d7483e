use crate::geo::Geofence;
use chrono::{DateTime, Utc};
use db::models::{session, token};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use uuid::Uuid;

pub async fn seed_session(
    db: &DatabaseConnection,
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> session::Model {
    session::ActiveModel {
        title: Set(title.to_owned()),
        location_name: Set(None),
        start_time: Set(start),
        end_time: Set(end),
        attendee_count: Set(0),
        created_at: Set(start),
        updated_at: Set(start),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed session")
}

pub async fn seed_token(
    db: &DatabaseConnection,
    session_id: i64,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    geofence: Option<Geofence>,
) -> token::Model {
    token::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        session_id: Set(session_id),
        valid_from: Set(valid_from),
        valid_until: Set(valid_until),
        status: Set(token::TokenStatus::Active),
        center_lat: Set(geofence.map(|g| g.center.lat)),
        center_lng: Set(geofence.map(|g| g.center.lng)),
        radius_m: Set(geofence.map(|g| g.radius_m)),
        created_at: Set(valid_from),
    }
    .insert(db)
    .await
    .expect("seed token")
}
