//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU signaling service.
//!
//! This crate provides:
//! - Server test harness (`TestSfu`) running the real actor system and
//!   WebSocket endpoint on a loopback engine
//! - WebSocket signaling client (`TestClient`)
//! - In-memory room store mock (`MockRoomStore`)
//! - Negotiation payload fixtures matching the loopback engine's codecs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let sfu = TestSfu::builder().workers(2).spawn().await?;
//!     let mut alice = TestClient::connect(&sfu.ws_url()).await?;
//!
//!     let joined = alice.join("room-1").await?;
//!     let send = alice.connected_transport(TransportDirection::Sender).await?;
//!     let producer = alice.produce(&send, MediaKind::Audio).await?;
//!
//!     assert_eq!(sfu.engine().stats().live_producers, 1);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod mock_store;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_store::*;
pub use server_harness::*;
pub use ws_client::*;
