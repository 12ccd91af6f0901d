//! Actor model implementation for the Session Directory and Protocol Gateway.
//!
//! ```text
//! SessionDirectory (singleton per node)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room with local participants)
//!         └── pushes events to ClientSinks
//!
//! ConnectionActor (one per client socket)
//! └── joins one RoomActor through the SessionDirectory
//! ```
//!
//! # Key Design Decisions
//!
//! - **One room per connection**: A user in two rooms holds two connections
//! - **Rooms outlive shutdown cancellation**: Room actors get their own tokens so
//!   connections can leave cleanly before the rooms are cancelled
//! - **Mailbox monitoring**: Depth thresholds with metrics (Room: 100/500, Connection: 50/200)
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`directory`] - `SessionDirectory` singleton that supervises rooms
//! - [`room`] - `RoomActor` per room, owns the local roster
//! - [`connection`] - `ConnectionActor` per client socket, owns the protocol state
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod directory;
pub mod messages;
pub mod metrics;
pub mod room;

// Re-export primary types
pub use connection::{
    ConnectionActor, ConnectionActorHandle, ConnectionContext, ConnectionSettings,
};
pub use directory::{SessionDirectory, SessionDirectoryHandle};
pub use messages::{
    ClientSink, ConnectionMessage, DirectoryStatus, Outbound, RelayEnvelope, RoomEvent,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{
    RoomActor, RoomActorHandle, RoomServices, REASON_PLACEMENT_LOST, REASON_WORKER_LOST,
};
