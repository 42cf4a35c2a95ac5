//! Realtime event distribution for the Courtside tournament platform
//!
//! This crate moves live tournament traffic (score deltas, leaderboard
//! changes, presence, notifications) to many concurrent viewers without one
//! physical connection per logical channel. It multiplexes channels over a
//! pooled set of websockets with health-scored load balancing, buffers
//! outbound traffic in a priority queue with retry accounting, suppresses
//! redundant inbound deliveries, and fans events out through room-based
//! pub/sub with presence rosters.
//!
//! # Thread Safety
//!
//! [`RealtimeService`] is `Clone + Send + Sync`; clones share one backend
//! and can be handed to any task.
//!
//! # Example
//!
//! ```no_run
//! use courtside_realtime::{RealtimeConfig, RealtimeService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RealtimeConfig::pooled(vec!["ws://localhost:9100".to_string()]);
//! let service = RealtimeService::from_config(config);
//!
//! let channel = service.subscribe("tournament-42").await?;
//! let _guard = channel.bind("score-update", |event| {
//!     println!("score update: {}", event.data);
//! });
//! channel.trigger("score-update", serde_json::json!({"points": 3})).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod pool;
pub mod queue;
pub mod rooms;
pub mod service;
pub mod tournament;
pub mod wire;

pub use config::{HostedConfig, PoolConfig, PooledConfig, QueueConfig, RealtimeConfig};
pub use dedup::Deduplicator;
pub use error::{RealtimeError, RealtimeResult};
pub use pool::{ConnectionPool, PoolMetrics};
pub use queue::{MessageQueue, Priority, QueueEvent, QueueStats, QueuedMessage};
pub use rooms::{
    PresenceMember, Room, RoomEvent, RoomRouter, RoomType, RouterEvent, SubscriptionGuard,
};
pub use service::{
    ChannelHandle, ConnectionState, PresenceChannel, RealtimeService, StateChange,
};
pub use tournament::{TournamentRoomManager, TournamentRooms};
pub use wire::WireMessage;
