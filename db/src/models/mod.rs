pub mod attendance_record;
pub mod pending_intent;
pub mod session;
pub mod token;
