// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Point of entry for coordinating channels and payments.
//!
//! The [`ChannelManager`] within this module serializes every operation on a
//! channel — opening, promising, accepting, closing — behind per-pair and
//! per-channel locks, and coordinates local persistence with on-chain
//! contract interaction.
//!
//! The manager uses a context that implements the user-defined [`adapters`]
//! for contract interaction and storage handling. The [`context`] module
//! ships an in-memory context useful for testing and development; any
//! durable backend can be plugged in by implementing the same traits.
//!
//! # Example
//!
//! ```rust
//! use alloy::{
//!     primitives::{address, U256},
//!     signers::local::PrivateKeySigner,
//! };
//! use upc_core::{
//!     channel::ContractKind,
//!     manager::{
//!         context::memory::{InMemoryChain, InMemoryContext},
//!         ChannelManager, ManagerOptions,
//!     },
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let chain = InMemoryChain::new(
//!     address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef"),
//!     address!("feedfeedfeedfeedfeedfeedfeedfeedfeedfeed"),
//! );
//! let wallet = PrivateKeySigner::random();
//! chain.set_balance(None, wallet.address(), U256::from(10_000));
//!
//! let context = InMemoryContext::new(chain, "sender");
//! let manager = ChannelManager::new(context, wallet, ManagerOptions::default());
//!
//! let receiver = address!("deaddeaddeaddeaddeaddeaddeaddeaddeaddead");
//! let channel = manager
//!     .require_open_channel(receiver, U256::from(100), ContractKind::Native)
//!     .await
//!     .unwrap();
//! let payment = manager
//!     .next_payment(channel.channel_id, U256::from(100), String::new())
//!     .await
//!     .unwrap();
//! assert_eq!(payment.cumulative, U256::from(100));
//! # }
//! ```

pub mod adapters;
pub mod context;

mod channel_manager;
mod locks;

pub use channel_manager::{ChannelManager, ManagerOptions};
pub use locks::LockTable;
