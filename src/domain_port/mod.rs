// storage

mod key_value_store;

pub use key_value_store::*;

// network

mod http_transport;

pub use http_transport::*;

// time

mod clock;

pub use clock::*;
