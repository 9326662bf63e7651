// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Local channel records and their reconciliation with on-chain state.
//!
//! A [`PaymentChannel`] is the locally persisted view of a channel: the pair
//! of parties, the deposit, and the highest cumulative amount this party has
//! issued (sender side) or accepted (receiver side). The chain is
//! authoritative for the lifecycle state and the deposit; [`reconcile`]
//! folds the current on-chain snapshot into a stored row before the record
//! is acted on.

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::manager::adapters::ChannelContract;

/// 32-byte channel identifier, generated by the sender as a fresh random
/// value and opaque everywhere else.
pub type ChannelId = B256;

/// Lifecycle of an on-chain channel.
///
/// Transitions are OPEN → SETTLING → ABSENT, or OPEN → ABSENT when the
/// receiver claims directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Open = 0,
    Settling = 1,
    Absent = 2,
}

/// Which on-chain contract variant a channel is anchored on.
///
/// The protocol is identical for both variants; the token variant moves an
/// ERC20 via `transferFrom` instead of the native coin and binds the token
/// contract address into the payment digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
    /// Channel funded with the native coin.
    Native,
    /// Channel funded through the given ERC20 contract.
    Token(Address),
}

impl ContractKind {
    /// The ERC20 contract address bound into the digest, if any.
    pub fn token_contract(&self) -> Option<Address> {
        match self {
            ContractKind::Native => None,
            ContractKind::Token(token_contract) => Some(*token_contract),
        }
    }

    /// Maps the contract's `tokenContract` storage field, where the zero
    /// address marks the native variant.
    pub fn from_token_address(token_contract: Address) -> Self {
        if token_contract.is_zero() {
            ContractKind::Native
        } else {
            ContractKind::Token(token_contract)
        }
    }
}

/// A locally stored payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub channel_id: ChannelId,
    pub sender: Address,
    pub receiver: Address,
    /// Total amount deposited on-chain. Non-decreasing while the channel
    /// lives.
    pub value: U256,
    /// Highest cumulative payment issued or accepted locally. Never
    /// decreases; `spent <= value`.
    pub spent: U256,
    /// Last reconciled lifecycle state.
    pub state: ChannelState,
    /// Address of the on-chain contract governing this channel.
    pub contract_address: Address,
    /// Native-coin or token variant.
    pub kind: ContractKind,
}

impl PaymentChannel {
    /// Capacity still available for new promises.
    pub fn remaining(&self) -> U256 {
        self.value.saturating_sub(self.spent)
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn is_settling(&self) -> bool {
        self.state == ChannelState::Settling
    }

    pub fn is_absent(&self) -> bool {
        self.state == ChannelState::Absent
    }

    /// The ERC20 contract bound into this channel's digests, if any.
    pub fn token_contract(&self) -> Option<Address> {
        self.kind.token_contract()
    }
}

/// Folds the current on-chain view of a channel into its local record.
///
/// The chain wins for `state` and `value`; `spent` stays local. A channel
/// the chain no longer knows comes back as ABSENT and must not be reused.
pub async fn reconcile<C>(
    mut row: PaymentChannel,
    chain: &C,
) -> Result<PaymentChannel, C::AdapterError>
where
    C: ChannelContract + ?Sized,
{
    match chain.channel_by_id(row.channel_id).await? {
        Some(onchain) => {
            row.state = onchain.state();
            row.value = onchain.value;
        }
        None => row.state = ChannelState::Absent,
    }
    Ok(row)
}
