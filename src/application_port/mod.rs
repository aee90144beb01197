mod query_cache;
mod session_error;
mod session_service;
mod session_signal;
mod token_provider;

pub use query_cache::*;
pub use session_error::*;
pub use session_service::*;
pub use session_signal::*;
pub use token_provider::*;
