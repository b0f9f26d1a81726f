mod connection;

pub use connection::{ConnectionContext, ConnectionHandler};
