use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "sync_state_enum")]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "synced")]
    Synced,
    #[sea_orm(string_value = "rejected")]
    Rejected,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Pending
    }
}

/// A locally buffered attendance intent, recorded while the store was
/// unreachable. Owned by the scanning client until reconciliation hands it
/// to the verification service; the server-side record is authoritative from
/// then on.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, serde::Serialize)]
#[sea_orm(table_name = "pending_intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub local_id: String,
    pub token_id: String,
    pub user_id: i64,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub accuracy_m: Option<f64>,
    /// Client-side timestamp of the scan. Reconciliation drains in this
    /// order.
    pub captured_at: DateTime<Utc>,
    pub sync_state: SyncState,
    /// Human-readable reason when `sync_state` is `Rejected`; surfaced to
    /// the user for a manual re-scan, never silently dropped.
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        panic!("No RelationDef implemented")
    }
}

impl ActiveModelBehavior for ActiveModel {}
