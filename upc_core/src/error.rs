// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Module containing Error type and Result typedef
//!

use std::result::Result as StdResult;

use alloy::primitives::{Address, SignatureError, B256, U256};
use thiserror::Error as ThisError;

use crate::channel::ChannelState;
use crate::payment::PaymentError;

/// Error type for the payment channel protocol
#[derive(ThisError, Debug)]
pub enum Error {
    /// Error when a channel is not known locally
    #[error("Channel {channel_id} not found")]
    ChannelNotFound { channel_id: B256 },

    /// Error when no payment was recorded under a receipt token
    #[error("No payment found for token {token}")]
    PaymentNotFound { token: String },

    /// Error when no signed promise is available to claim a channel with
    #[error("No signed promise available to claim channel {channel_id}")]
    NothingToClaim { channel_id: B256 },

    /// Error when an operation is not allowed from the channel's current
    /// on-chain state
    #[error("Channel {channel_id} is {state:?}: {operation} not allowed")]
    InvalidState {
        channel_id: B256,
        state: ChannelState,
        operation: &'static str,
    },

    /// Error when the channel cannot carry the requested amount
    #[error("Channel {channel_id} has {remaining} remaining, {required} required")]
    InsufficientCapacity {
        channel_id: B256,
        remaining: U256,
        required: U256,
    },

    /// Error on the payment side
    #[error("Invalid payment: {0}")]
    InvalidPayment(#[from] PaymentError),

    /// Error when a second channel shows up for a pair that is already being
    /// opened. The pair lock prevents this locally; observing it means
    /// external interference.
    #[error("Conflicting channel creation for sender {sender} and receiver {receiver}")]
    Conflict { sender: Address, receiver: Address },

    /// Generic error from the contract adapter
    #[error("Error from contract adapter.\n Caused by: {source_error}")]
    ChainError { source_error: anyhow::Error },

    /// Generic error from a storage adapter
    #[error("Error from storage adapter.\n Caused by: {source_error}")]
    StorageError { source_error: anyhow::Error },

    /// Generic error from the payment transport
    #[error("Error from payment transport.\n Caused by: {source_error}")]
    TransportError { source_error: anyhow::Error },

    /// `alloy` wallet error
    #[error(transparent)]
    WalletError(#[from] alloy::signers::Error),

    /// `alloy` signature error
    #[error(transparent)]
    SignatureError(#[from] SignatureError),
}

pub type Result<T> = StdResult<T, Error>;
