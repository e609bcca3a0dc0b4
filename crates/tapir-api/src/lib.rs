//! HTTP surface of the TAP service
//!
//! Maps the TAP/UWS resource tree onto the core's job-lifecycle and
//! query-execution operations. Request tasks only create, steer and
//! observe jobs; query execution happens on worker tasks inside
//! `tapir-core`.

pub mod params;
pub mod response;
pub mod routes;
pub mod server;
pub mod state;
pub mod uws_xml;

pub use response::Dispatch;
pub use routes::create_router;
pub use server::{create_app_state, run};
pub use state::AppState;
