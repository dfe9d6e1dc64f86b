pub mod status_handler;

pub use status_handler::{router, ApiState, ErrorResponse};
