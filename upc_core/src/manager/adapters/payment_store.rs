// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{channel::ChannelId, payment::Payment};

/// Append-mostly log of accepted payments, receiver side only.
///
/// Payments are indexed by the opaque receipt token issued on acceptance and
/// by channel id.
///
/// # Example
///
/// For example code see [`crate::manager::context::memory::InMemoryContext`]
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from
    /// the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Records an accepted payment. The payment carries the receipt token it
    /// was issued under.
    async fn add_payment(&self, payment: Payment) -> Result<(), Self::AdapterError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Payment>, Self::AdapterError>;

    /// All accepted payments for one channel, in acceptance order.
    async fn find_by_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<Payment>, Self::AdapterError>;
}
