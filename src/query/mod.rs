//! Query orchestration for pg-console.
//!
//! Turns an execute request into a response envelope: validates credentials,
//! classifies the SQL and runs it with the matching strategy.

pub mod executor;
pub mod request;
pub mod response;

pub use executor::QueryExecutor;
pub use request::{Credentials, ExecuteRequest};
pub use response::{BatchResult, ErrorEnvelope, ExecuteResponse, ResponseStatus, StatementResult};
