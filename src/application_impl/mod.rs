mod api_client;
mod request_interceptor;
mod session_coordinator;
mod session_facade;
mod token_store;

pub use api_client::*;
pub use request_interceptor::*;
pub use session_coordinator::*;
pub use session_facade::*;
pub use token_store::*;
