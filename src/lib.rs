pub mod bus;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod host;
pub mod protocol;
pub mod store;
pub mod transport;

// re-export selected public API
pub use bus::MessageBus;
pub use protocol::Message;
pub use protocol::config::{Config, load_config};
