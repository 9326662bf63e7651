// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Module containing the off-chain payment promise
//!
//! A payment is a single signed promise of a new cumulative total on one
//! channel. The sender signs it and ships it to the receiver, who verifies
//! the signature and the monotonicity of the cumulative amount before
//! booking it. The highest promise seen is what the receiver later claims
//! on-chain.

use alloy::{
    primitives::{Address, Signature, U256},
    signers::local::PrivateKeySigner,
};
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelId, PaymentChannel},
    digest,
};

/// Validation errors on the payment side
#[derive(thiserror::Error, Debug, Clone, Serialize, Deserialize)]
pub enum PaymentError {
    #[error("signature recovers to {recovered}, channel sender is {expected}")]
    WrongSigner {
        expected: Address,
        recovered: Address,
    },
    #[error("Signature check failed:\n{source_error_message}")]
    InvalidSignature { source_error_message: String },
    #[error("cumulative {received} does not exceed the stored spent amount {stored}")]
    NonIncreasingCumulative { received: U256, stored: U256 },
    #[error("cumulative {cumulative} exceeds the channel deposit {value}")]
    CumulativeExceedsValue { cumulative: U256, value: U256 },
    #[error("payment is bound to contract {received}, channel is governed by {expected}")]
    ContractMismatch {
        expected: Address,
        received: Address,
    },
    #[error("price must be greater than zero")]
    ZeroPrice,
    #[error("price {price} exceeds the channel deposit {channel_value}")]
    PriceExceedsDeposit { price: U256, channel_value: U256 },
}

/// An off-chain payment promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub channel_id: ChannelId,
    pub sender: Address,
    pub receiver: Address,
    /// New cumulative total authorized by this promise; the signed quantity.
    pub cumulative: U256,
    /// Increment paid by this promise.
    pub price: U256,
    /// Snapshot of the channel deposit at signing time.
    pub channel_value: U256,
    /// Address of the on-chain contract governing the channel.
    pub contract_address: Address,
    /// ERC20 contract for the token variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<Address>,
    /// ECDSA signature over the recoverable payment digest.
    pub signature: Signature,
    /// Opaque caller-supplied tag.
    #[serde(default)]
    pub meta: String,
    /// Receipt issued by the receiver on acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Payment {
    /// Signs a new promise of `channel.spent + price` with `signing_wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`alloy::signers::Error`] if the wallet could not sign
    pub fn new(
        channel: &PaymentChannel,
        price: U256,
        meta: String,
        signing_wallet: &PrivateKeySigner,
    ) -> Result<Self, alloy::signers::Error> {
        let cumulative = channel.spent + price;
        let signature = digest::sign_payment(
            signing_wallet,
            channel.contract_address,
            channel.channel_id,
            cumulative,
            channel.token_contract(),
        )?;

        Ok(Self {
            channel_id: channel.channel_id,
            sender: channel.sender,
            receiver: channel.receiver,
            cumulative,
            price,
            channel_value: channel.value,
            contract_address: channel.contract_address,
            token_contract: channel.token_contract(),
            signature,
            meta,
            token: None,
        })
    }

    /// Recovers and returns the signer of the promise from the signature.
    pub fn recover_signer(&self) -> Result<Address, PaymentError> {
        digest::recover_signer(
            &self.signature,
            self.contract_address,
            self.channel_id,
            self.cumulative,
            self.token_contract,
        )
        .map_err(|e| PaymentError::InvalidSignature {
            source_error_message: e.to_string(),
        })
    }

    /// A promise is valid for a channel iff its signature recovers to the
    /// channel's sender.
    pub fn verify(&self, expected_sender: Address) -> Result<(), PaymentError> {
        let recovered = self.recover_signer()?;
        if recovered != expected_sender {
            return Err(PaymentError::WrongSigner {
                expected: expected_sender,
                recovered,
            });
        }
        Ok(())
    }
}
