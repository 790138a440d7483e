pub mod m202608280001_create_sessions;
pub mod m202608280002_create_tokens;
pub mod m202608280003_create_attendance_records;
pub mod m202608280004_create_pending_intents;
