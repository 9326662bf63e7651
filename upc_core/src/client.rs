// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Buyer- and receiver-facing facade.
//!
//! [`Client`] glues the channel manager to a [`PaymentTransport`]: `buy`
//! obtains a channel, signs the next promise, and ships it to the gateway;
//! `buy_url` first maps a `402 Payment Required` challenge into the same
//! flow. On the receiver side `accept_payment` validates an incoming promise
//! and issues the opaque receipt token the gateway hands back.

use std::result::Result as StdResult;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelId, ContractKind},
    error::{Error, Result},
    manager::{
        adapters::{ChannelContract, ChannelStore, PaymentStore},
        ChannelManager,
    },
    payment::Payment,
};

/// Challenge body a gateway returns with `402 Payment Required`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequired {
    pub receiver: Address,
    pub price: U256,
    /// URL the signed payment is POSTed to.
    pub gateway: String,
    #[serde(default)]
    pub meta: String,
    pub contract_address: Address,
    /// ERC20 contract for the token variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<Address>,
}

impl PaymentRequired {
    pub fn contract_kind(&self) -> ContractKind {
        match self.token_contract {
            Some(token_contract) => ContractKind::Token(token_contract),
            None => ContractKind::Native,
        }
    }
}

/// Response of a gateway that accepted a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptPaymentResponse {
    pub token: String,
}

/// Outcome of a successful `buy`.
#[derive(Debug, Clone)]
pub struct BuyResult {
    pub channel_id: ChannelId,
    pub token: String,
}

/// Delivery of challenges and payments over the wire.
///
/// The HTTP details live with the implementor; the facade only needs the two
/// round trips of the micropayment handshake.
#[async_trait]
pub trait PaymentTransport: Send + Sync {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from
    /// the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Requests `url` and maps its `402 Payment Required` challenge.
    async fn fetch_challenge(&self, url: &str)
        -> StdResult<PaymentRequired, Self::AdapterError>;

    /// POSTs the signed payment to the gateway.
    async fn send_payment(
        &self,
        gateway: &str,
        payment: &Payment,
    ) -> StdResult<AcceptPaymentResponse, Self::AdapterError>;
}

/// Buy / accept facade over a channel manager and a transport.
pub struct Client<E, T> {
    manager: ChannelManager<E>,
    transport: T,
}

impl<E, T> Client<E, T> {
    pub fn new(manager: ChannelManager<E>, transport: T) -> Self {
        Self { manager, transport }
    }

    pub fn manager(&self) -> &ChannelManager<E> {
        &self.manager
    }
}

impl<E, T> Client<E, T>
where
    E: ChannelStore + ChannelContract,
    T: PaymentTransport,
{
    /// Pays `price` to the receiver named in the challenge, reusing an open
    /// channel when one still has capacity.
    ///
    /// The spent total is committed locally before the payment goes out; a
    /// delivery failure surfaces as an error but the promise stays burned.
    pub async fn buy(&self, challenge: &PaymentRequired) -> Result<BuyResult> {
        let channel = self
            .manager
            .require_open_channel(challenge.receiver, challenge.price, challenge.contract_kind())
            .await?;
        let payment = self
            .manager
            .next_payment(channel.channel_id, challenge.price, challenge.meta.clone())
            .await?;
        let response = self.do_payment(&challenge.gateway, &payment).await?;
        Ok(BuyResult {
            channel_id: channel.channel_id,
            token: response.token,
        })
    }

    /// HTTP preflight: requests `url`, maps its `402 Payment Required`
    /// challenge, and pays it.
    pub async fn buy_url(&self, url: &str) -> Result<BuyResult> {
        let challenge = self
            .transport
            .fetch_challenge(url)
            .await
            .map_err(|err| Error::TransportError {
                source_error: anyhow::Error::new(err),
            })?;
        self.buy(&challenge).await
    }

    /// Ships a signed payment to a gateway and returns its receipt token.
    pub async fn do_payment(
        &self,
        gateway: &str,
        payment: &Payment,
    ) -> Result<AcceptPaymentResponse> {
        self.transport
            .send_payment(gateway, payment)
            .await
            .map_err(|err| Error::TransportError {
                source_error: anyhow::Error::new(err),
            })
    }
}

impl<E, T> Client<E, T>
where
    E: ChannelStore + PaymentStore + ChannelContract,
{
    /// Receiver side: validates the promise, issues an opaque token, and
    /// records the payment under it.
    pub async fn accept_payment(&self, payment: Payment) -> Result<AcceptPaymentResponse> {
        self.manager.accept_payment(&payment).await?;

        let token = fresh_token();
        let stored = Payment {
            token: Some(token.clone()),
            ..payment
        };
        self.manager
            .context()
            .add_payment(stored)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(AcceptPaymentResponse { token })
    }

    /// Looks up the payment a previously issued token stands for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PaymentNotFound`] for a token this side never issued
    pub async fn accept_verify(&self, token: &str) -> Result<Payment> {
        self.manager
            .context()
            .find_by_token(token)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?
            .ok_or_else(|| Error::PaymentNotFound {
                token: token.to_owned(),
            })
    }
}

fn fresh_token() -> String {
    let bytes: [u8; 32] = thread_rng().gen();
    alloy::hex::encode(bytes)
}
