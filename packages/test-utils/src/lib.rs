//! Shared test utilities for Courtside workspace
//!
//! This crate provides mock implementations of external services for testing
//! without network dependencies.
//!
//! # Mock Services
//!
//! - [`MockRealtimeServer`] - Mock realtime websocket endpoint for transport tests
//!
//! # Example
//!
//! ```rust,ignore
//! use courtside_test_utils::MockRealtimeServer;
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockRealtimeServer::start().await;
//!
//!     // Point your realtime config at server.url()
//! }
//! ```

mod server;

pub use server::MockRealtimeServer;
