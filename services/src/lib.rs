pub mod geo;
pub mod ledger;
pub mod offline;
pub mod token_issuer;
pub mod verification;

pub use geo::{Geofence, GeoPoint, ReportedLocation};
pub use ledger::{AttendanceLedger, LedgerError};
pub use offline::{Connectivity, DrainReport, ScanAck, ScanClient};
pub use token_issuer::TokenIssuer;
pub use verification::{VerificationService, VerifyError, VerifyOutcome};

#[cfg(test)]
pub(crate) mod test_helpers;
