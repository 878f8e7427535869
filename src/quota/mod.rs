pub mod handlers;
pub mod models;
mod policy;
mod service;

pub use models::{QuotaRecord, QuotaState, QuotaStatus};
pub use policy::FixedWindowPolicy;
pub use service::{QuotaError, QuotaService, ServiceOptions};
