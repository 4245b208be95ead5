mod api;

pub use api::{AdmittedResponse, HealthResponse, ServerInfoResponse};
