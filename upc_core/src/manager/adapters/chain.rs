// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

use alloy::primitives::{Address, Signature, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, ChannelState, ContractKind};

/// Snapshot of a channel's on-chain storage, in contract field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainChannel {
    pub sender: Address,
    pub receiver: Address,
    pub value: U256,
    pub settling_period: u64,
    /// Block height after which the sender may settle; zero while not
    /// settling.
    pub settling_until: u64,
    /// ERC20 contract for the token variant, zero for the native coin.
    pub token_contract: Address,
}

impl OnchainChannel {
    /// State derived the way the contract derives it: ABSENT when the sender
    /// field is zero, SETTLING when `settling_until` is set, OPEN otherwise.
    pub fn state(&self) -> ChannelState {
        if self.sender.is_zero() {
            ChannelState::Absent
        } else if self.settling_until != 0 {
            ChannelState::Settling
        } else {
            ChannelState::Open
        }
    }
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
}

/// Typed facade over the on-chain payment channel contract.
///
/// Implementations pick the concrete deployment (native-coin variant vs.
/// token variant) from the [`ContractKind`] a channel was opened with; the
/// protocol logic upstream is identical for both.
///
/// # Example
///
/// For example code see [`crate::manager::context::memory::InMemoryChain`]
#[async_trait]
pub trait ChannelContract: Send + Sync {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from
    /// the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Address of the deployed contract backing `kind`.
    fn contract_address(&self, kind: ContractKind) -> Address;

    /// Submits the opening transaction: locks `value` from `sender` into a
    /// fresh channel addressed to `receiver`.
    ///
    /// For the token variant the deposit is pulled through the ERC20
    /// allowance, which the implementation must have arranged beforehand.
    async fn open(
        &self,
        sender: Address,
        channel_id: ChannelId,
        receiver: Address,
        settling_period: u64,
        value: U256,
        kind: ContractKind,
    ) -> Result<TxReceipt, Self::AdapterError>;

    /// Adds `value` to the channel deposit. Rejected while the channel is
    /// SETTLING or ABSENT.
    async fn deposit(
        &self,
        sender: Address,
        channel_id: ChannelId,
        value: U256,
    ) -> Result<TxReceipt, Self::AdapterError>;

    /// Receiver-side short-circuit close: presents a signed promise of
    /// `cumulative` and collects. A cumulative at or above the deposit pays
    /// the full deposit to the receiver; anything unspent is refunded to the
    /// sender. Deletes the on-chain record.
    async fn claim(
        &self,
        receiver: Address,
        channel_id: ChannelId,
        cumulative: U256,
        signature: Signature,
    ) -> Result<TxReceipt, Self::AdapterError>;

    /// Sender-only, OPEN-only: starts the settling clock at
    /// `current_block + settling_period`.
    async fn start_settling(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError>;

    /// Sender-only, after `settling_until`: recovers the full remaining
    /// deposit and deletes the on-chain record.
    async fn settle(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError>;

    /// Lifecycle state as the contract derives it.
    async fn state(&self, channel_id: ChannelId) -> Result<ChannelState, Self::AdapterError>;

    /// The channel's on-chain storage, or `None` once it is absent.
    async fn channel_by_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<OnchainChannel>, Self::AdapterError>;

    /// The digest the contract would verify for `(channel_id, cumulative)`.
    ///
    /// Must be byte-identical with [`crate::digest::payment_digest`] for the
    /// channel's contract and token binding.
    async fn payment_digest(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
    ) -> Result<B256, Self::AdapterError>;

    /// Whether a `claim` by `origin` with this signature would succeed.
    async fn can_claim(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
        origin: Address,
        signature: Signature,
    ) -> Result<bool, Self::AdapterError>;

    /// Current block height, used to gate `settle`.
    async fn current_block(&self) -> Result<u64, Self::AdapterError>;
}
