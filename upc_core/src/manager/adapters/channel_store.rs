// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::channel::{ChannelId, ChannelState, PaymentChannel};

/// Durable store of local channel records, keyed by channel id.
///
/// Implementations must make each single operation atomic and must namespace
/// records so one backend can isolate sender-side from receiver-side
/// storage. Compound read-then-write logic is serialized by the channel
/// manager's locks, not here.
///
/// # Example
///
/// For example code see [`crate::manager::context::memory::InMemoryContext`]
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from
    /// the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Inserts a new record. Fails if the channel id is already present.
    async fn save(&self, channel: PaymentChannel) -> Result<(), Self::AdapterError>;

    /// Inserts the record, or folds it into an existing one through
    /// [`Self::spend`].
    async fn save_or_update(&self, channel: PaymentChannel) -> Result<(), Self::AdapterError>;

    async fn first_by_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<PaymentChannel>, Self::AdapterError>;

    /// Monotonic write of the spent total.
    ///
    /// A `new_spent` lower than the stored amount must be rejected, never
    /// silently applied.
    async fn spend(&self, channel_id: ChannelId, new_spent: U256)
        -> Result<(), Self::AdapterError>;

    /// Adds `delta` to the stored deposit.
    async fn deposit(&self, channel_id: ChannelId, delta: U256) -> Result<(), Self::AdapterError>;

    async fn update_state(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> Result<(), Self::AdapterError>;

    /// Every stored record, in insertion order.
    async fn all(&self) -> Result<Vec<PaymentChannel>, Self::AdapterError>;

    /// Records for one `(sender, receiver)` pair, in insertion order.
    async fn find_by_sender_receiver(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Vec<PaymentChannel>, Self::AdapterError>;

    async fn find_by_sender_receiver_channel_id(
        &self,
        sender: Address,
        receiver: Address,
        channel_id: ChannelId,
    ) -> Result<Option<PaymentChannel>, Self::AdapterError>;
}
