//! Client SDK facade (C9): a wallet connects to one relay, opens sessions
//! with peers, and sends/receives messages over them. The relay and the
//! Double Ratchet session protocol are consumed, not reimplemented, here —
//! this crate is the thin layer an app embeds.

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod event;

pub use client::{ChatSession, DeliveryReceipt, SolConnectClient, Subscription, WalletInfo};
pub use config::SdkConfig;
pub use directory::{InMemoryPeerDirectory, PeerDirectory};
pub use error::SdkError;
pub use event::{DeliveryStatus, Event};
