pub mod command_tracker;
pub mod connection_registry;
pub mod events;
pub mod heartbeat_manager;
pub mod message_router;
pub mod offline_queue;
pub mod terminal_stream;
pub mod token_manager;

pub use command_tracker::CommandTracker;
pub use connection_registry::{Connection, ConnectionKind, ConnectionRegistry};
pub use events::HubEvent;
pub use heartbeat_manager::HeartbeatManager;
pub use message_router::MessageRouter;
pub use offline_queue::{EnqueueOutcome, OfflineQueue};
pub use terminal_stream::{TerminalStreamConfig, TerminalStreamManager};
pub use token_manager::TokenManager;
