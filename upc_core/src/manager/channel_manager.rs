// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp;

use alloy::{
    primitives::{Address, U256},
    signers::local::PrivateKeySigner,
};
use rand::{thread_rng, Rng};

use crate::{
    channel::{reconcile, ChannelId, ChannelState, ContractKind, PaymentChannel},
    error::{Error, Result},
    manager::{
        adapters::{ChannelContract, ChannelStore, PaymentStore, TxReceipt},
        locks::LockTable,
    },
    payment::{Payment, PaymentError},
};

/// Tunables for the channel manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Floor on the deposit of a freshly opened channel.
    pub minimum_channel_amount: U256,
    /// Fresh deposits are sized `price * deposit_multiplier`, floored by the
    /// minimum.
    pub deposit_multiplier: u64,
    /// Blocks the sender must wait between `start_settling` and `settle`.
    pub settling_period: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            minimum_channel_amount: U256::ZERO,
            deposit_multiplier: 10,
            // two days of 15-second blocks
            settling_period: 11520,
        }
    }
}

/// Serialized coordinator for one account's channels.
///
/// All operations touching one `(sender, receiver)` pair go through a
/// per-pair lock, and all operations touching one channel go through a
/// per-channel lock; both are held across every chain, storage, and signing
/// suspension point. The pair lock is always taken outside the channel lock.
pub struct ChannelManager<E> {
    /// Context that implements adapters
    context: E,

    /// Wallet this manager signs promises and transacts as
    wallet: PrivateKeySigner,

    options: ManagerOptions,

    pair_locks: LockTable,
    channel_locks: LockTable,
}

impl<E> ChannelManager<E> {
    /// Creates a new manager over the provided adapter context.
    pub fn new(context: E, wallet: PrivateKeySigner, options: ManagerOptions) -> Self {
        Self {
            context,
            wallet,
            options,
            pair_locks: LockTable::new(),
            channel_locks: LockTable::new(),
        }
    }

    /// Address this manager signs and transacts as.
    pub fn account(&self) -> Address {
        self.wallet.address()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn context(&self) -> &E {
        &self.context
    }

    fn pair_key(sender: Address, receiver: Address) -> String {
        format!("{sender}:{receiver}")
    }

    fn channel_key(channel_id: ChannelId) -> String {
        format!("{channel_id}")
    }
}

impl<E> ChannelManager<E>
where
    E: ChannelStore + ChannelContract,
{
    /// Returns an OPEN channel from this account to `receiver` that can
    /// still carry `price`, opening a fresh one on-chain when none
    /// qualifies.
    ///
    /// Holding the pair lock across the whole lookup-or-open is what keeps a
    /// burst of first-time buys down to a single `open` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainError`] if the opening transaction fails; no
    /// local record is persisted in that case. Returns [`Error::Conflict`]
    /// when a record for the pair shows up that the lookup never saw; the
    /// pair lock rules that out locally, so it means an outside writer is
    /// creating channels for this pair.
    pub async fn require_open_channel(
        &self,
        receiver: Address,
        price: U256,
        kind: ContractKind,
    ) -> Result<PaymentChannel> {
        let sender = self.account();
        let _pair = self
            .pair_locks
            .acquire(Self::pair_key(sender, receiver))
            .await;

        let rows = self.pair_rows(sender, receiver).await?;
        if let Some(channel) = self.first_usable(&rows, price).await? {
            return Ok(channel);
        }
        self.open_channel(receiver, price, kind, &rows).await
    }

    /// First OPEN channel for the pair whose remaining capacity covers
    /// `amount`, reconciled against the chain before being returned.
    /// Tie-break is earliest insertion.
    pub async fn usable_channel(
        &self,
        sender: Address,
        receiver: Address,
        amount: U256,
    ) -> Result<Option<PaymentChannel>> {
        let rows = self.pair_rows(sender, receiver).await?;
        self.first_usable(&rows, amount).await
    }

    async fn pair_rows(&self, sender: Address, receiver: Address) -> Result<Vec<PaymentChannel>> {
        self.context
            .find_by_sender_receiver(sender, receiver)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })
    }

    async fn first_usable(
        &self,
        rows: &[PaymentChannel],
        amount: U256,
    ) -> Result<Option<PaymentChannel>> {
        for row in rows {
            if !row.is_open() || row.remaining() < amount {
                continue;
            }
            let fresh = reconcile(row.clone(), &self.context)
                .await
                .map_err(|err| Error::ChainError {
                    source_error: anyhow::Error::new(err),
                })?;
            if fresh.is_open() && fresh.remaining() >= amount {
                return Ok(Some(fresh));
            }
        }
        Ok(None)
    }

    async fn open_channel(
        &self,
        receiver: Address,
        price: U256,
        kind: ContractKind,
        known: &[PaymentChannel],
    ) -> Result<PaymentChannel> {
        let sender = self.account();

        // A record the lookup did not see means another writer is creating
        // channels for this pair around the pair lock; fatal.
        let current = self.pair_rows(sender, receiver).await?;
        let foreign = current.iter().any(|row| {
            !known
                .iter()
                .any(|seen| seen.channel_id == row.channel_id)
        });
        if foreign {
            return Err(Error::Conflict { sender, receiver });
        }

        let deposit = cmp::max(
            price.saturating_mul(U256::from(self.options.deposit_multiplier)),
            self.options.minimum_channel_amount,
        );
        let channel_id = ChannelId::from(thread_rng().gen::<[u8; 32]>());

        self.context
            .open(
                sender,
                channel_id,
                receiver,
                self.options.settling_period,
                deposit,
                kind,
            )
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })?;

        let channel = PaymentChannel {
            channel_id,
            sender,
            receiver,
            value: deposit,
            spent: U256::ZERO,
            state: ChannelState::Open,
            contract_address: self.context.contract_address(kind),
            kind,
        };
        self.context
            .save(channel.clone())
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(channel)
    }

    /// Signs the next promise on the channel and persists the new spent
    /// total **before** returning it. A promise that is never delivered
    /// stays burned: the local record does not roll back, so a crash between
    /// signing and sending can never lead to two promises of the same
    /// cumulative amount.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the channel is OPEN and
    /// [`Error::InsufficientCapacity`] when `remaining < price`
    pub async fn next_payment(
        &self,
        channel_id: ChannelId,
        price: U256,
        meta: String,
    ) -> Result<Payment> {
        let _guard = self
            .channel_locks
            .acquire(Self::channel_key(channel_id))
            .await;

        let channel = self.loaded_channel(channel_id).await?;
        if !channel.is_open() {
            return Err(Error::InvalidState {
                channel_id,
                state: channel.state,
                operation: "next_payment",
            });
        }
        if channel.remaining() < price {
            return Err(Error::InsufficientCapacity {
                channel_id,
                remaining: channel.remaining(),
                required: price,
            });
        }

        let payment = Payment::new(&channel, price, meta, &self.wallet)?;
        self.context
            .spend(channel_id, payment.cumulative)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(payment)
    }

    /// Receiver-side validation and booking of an incoming promise.
    ///
    /// A channel seen for the first time is mirrored from its on-chain
    /// record. The receiver keeps accepting while the sender settles; only
    /// an ABSENT channel is refused outright.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayment`] when the signature does not recover
    /// to the channel sender, the cumulative amount is not strictly greater
    /// than the stored one, it exceeds the deposit, or the contract binding
    /// does not match. No `spend` write happens on any of these.
    pub async fn accept_payment(&self, payment: &Payment) -> Result<PaymentChannel> {
        let channel_id = payment.channel_id;
        let _guard = self
            .channel_locks
            .acquire(Self::channel_key(channel_id))
            .await;

        let record = self
            .context
            .first_by_id(channel_id)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        let record = match record {
            Some(record) => record,
            None => self.mirror_channel(payment).await?,
        };

        let fresh = reconcile(record, &self.context)
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })?;
        if fresh.is_absent() {
            return Err(Error::InvalidState {
                channel_id,
                state: fresh.state,
                operation: "accept_payment",
            });
        }
        if payment.contract_address != fresh.contract_address {
            return Err(PaymentError::ContractMismatch {
                expected: fresh.contract_address,
                received: payment.contract_address,
            }
            .into());
        }
        payment.verify(fresh.sender)?;
        if payment.cumulative <= fresh.spent {
            return Err(PaymentError::NonIncreasingCumulative {
                received: payment.cumulative,
                stored: fresh.spent,
            }
            .into());
        }
        if payment.cumulative > fresh.value {
            return Err(PaymentError::CumulativeExceedsValue {
                cumulative: payment.cumulative,
                value: fresh.value,
            }
            .into());
        }

        self.context
            .spend(channel_id, payment.cumulative)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(PaymentChannel {
            spent: payment.cumulative,
            ..fresh
        })
    }

    /// Books a first-seen channel from its on-chain record.
    async fn mirror_channel(&self, payment: &Payment) -> Result<PaymentChannel> {
        if payment.price.is_zero() {
            return Err(PaymentError::ZeroPrice.into());
        }
        if payment.price > payment.channel_value {
            return Err(PaymentError::PriceExceedsDeposit {
                price: payment.price,
                channel_value: payment.channel_value,
            }
            .into());
        }
        payment.verify(payment.sender)?;

        let onchain = self
            .context
            .channel_by_id(payment.channel_id)
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })?
            .ok_or(Error::ChannelNotFound {
                channel_id: payment.channel_id,
            })?;
        if onchain.sender != payment.sender {
            return Err(PaymentError::WrongSigner {
                expected: onchain.sender,
                recovered: payment.sender,
            }
            .into());
        }
        let kind = ContractKind::from_token_address(onchain.token_contract);
        if payment.contract_address != self.context.contract_address(kind) {
            return Err(PaymentError::ContractMismatch {
                expected: self.context.contract_address(kind),
                received: payment.contract_address,
            }
            .into());
        }

        let record = PaymentChannel {
            channel_id: payment.channel_id,
            sender: onchain.sender,
            receiver: onchain.receiver,
            value: onchain.value,
            spent: U256::ZERO,
            state: onchain.state(),
            contract_address: payment.contract_address,
            kind,
        };
        self.context
            .save(record.clone())
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(record)
    }

    /// Tops up an OPEN channel on-chain and mirrors the new deposit locally.
    pub async fn deposit(&self, channel_id: ChannelId, amount: U256) -> Result<TxReceipt> {
        let _guard = self
            .channel_locks
            .acquire(Self::channel_key(channel_id))
            .await;

        let channel = self.loaded_channel(channel_id).await?;
        if !channel.is_open() {
            return Err(Error::InvalidState {
                channel_id,
                state: channel.state,
                operation: "deposit",
            });
        }

        let receipt = ChannelContract::deposit(&self.context, self.account(), channel_id, amount)
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })?;
        ChannelStore::deposit(&self.context, channel_id, amount)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(receipt)
    }

    /// All locally known channels that are OPEN after chain reconciliation.
    pub async fn open_channels(&self) -> Result<Vec<PaymentChannel>> {
        self.channels_in_state(ChannelState::Open).await
    }

    /// All locally known channels that are SETTLING after chain
    /// reconciliation.
    pub async fn settling_channels(&self) -> Result<Vec<PaymentChannel>> {
        self.channels_in_state(ChannelState::Settling).await
    }

    async fn channels_in_state(&self, state: ChannelState) -> Result<Vec<PaymentChannel>> {
        let rows = self
            .context
            .all()
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        let mut channels = Vec::new();
        for row in rows {
            let fresh = reconcile(row, &self.context)
                .await
                .map_err(|err| Error::ChainError {
                    source_error: anyhow::Error::new(err),
                })?;
            if fresh.state == state {
                channels.push(fresh);
            }
        }
        Ok(channels)
    }

    async fn loaded_channel(&self, channel_id: ChannelId) -> Result<PaymentChannel> {
        let row = self
            .context
            .first_by_id(channel_id)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?
            .ok_or(Error::ChannelNotFound { channel_id })?;
        reconcile(row, &self.context)
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })
    }
}

impl<E> ChannelManager<E>
where
    E: ChannelStore + PaymentStore + ChannelContract,
{
    /// Closes the channel safely for whichever side this account is on.
    ///
    /// - receiver: claims with the highest signed promise on record;
    /// - sender of an OPEN channel: starts settling;
    /// - sender of a SETTLING channel past `settling_until`: settles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the sender calls during a
    /// settling period that has not elapsed, or once the channel is ABSENT
    pub async fn close_channel(&self, channel_id: ChannelId) -> Result<TxReceipt> {
        let _guard = self
            .channel_locks
            .acquire(Self::channel_key(channel_id))
            .await;

        let channel = self.loaded_channel(channel_id).await?;
        let account = self.account();
        if account == channel.receiver {
            if channel.is_absent() {
                return Err(Error::InvalidState {
                    channel_id,
                    state: channel.state,
                    operation: "claim",
                });
            }
            return self.claim_channel(&channel).await;
        }
        if account != channel.sender {
            return Err(Error::InvalidState {
                channel_id,
                state: channel.state,
                operation: "close_channel by a third party",
            });
        }

        match channel.state {
            ChannelState::Open => {
                let receipt = self
                    .context
                    .start_settling(account, channel_id)
                    .await
                    .map_err(|err| Error::ChainError {
                        source_error: anyhow::Error::new(err),
                    })?;
                self.context
                    .update_state(channel_id, ChannelState::Settling)
                    .await
                    .map_err(|err| Error::StorageError {
                        source_error: anyhow::Error::new(err),
                    })?;
                Ok(receipt)
            }
            ChannelState::Settling => {
                let onchain = self
                    .context
                    .channel_by_id(channel_id)
                    .await
                    .map_err(|err| Error::ChainError {
                        source_error: anyhow::Error::new(err),
                    })?
                    .ok_or(Error::ChannelNotFound { channel_id })?;
                let current_block =
                    self.context
                        .current_block()
                        .await
                        .map_err(|err| Error::ChainError {
                            source_error: anyhow::Error::new(err),
                        })?;
                if current_block < onchain.settling_until {
                    return Err(Error::InvalidState {
                        channel_id,
                        state: channel.state,
                        operation: "settle before the settling period has elapsed",
                    });
                }
                let receipt = self
                    .context
                    .settle(account, channel_id)
                    .await
                    .map_err(|err| Error::ChainError {
                        source_error: anyhow::Error::new(err),
                    })?;
                self.context
                    .update_state(channel_id, ChannelState::Absent)
                    .await
                    .map_err(|err| Error::StorageError {
                        source_error: anyhow::Error::new(err),
                    })?;
                Ok(receipt)
            }
            ChannelState::Absent => Err(Error::InvalidState {
                channel_id,
                state: channel.state,
                operation: "close_channel",
            }),
        }
    }

    async fn claim_channel(&self, channel: &PaymentChannel) -> Result<TxReceipt> {
        let payments = self
            .context
            .find_by_channel(channel.channel_id)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        let best = payments
            .into_iter()
            .max_by_key(|payment| payment.cumulative)
            .ok_or(Error::NothingToClaim {
                channel_id: channel.channel_id,
            })?;

        let receipt = self
            .context
            .claim(
                channel.receiver,
                channel.channel_id,
                best.cumulative,
                best.signature,
            )
            .await
            .map_err(|err| Error::ChainError {
                source_error: anyhow::Error::new(err),
            })?;
        self.context
            .update_state(channel.channel_id, ChannelState::Absent)
            .await
            .map_err(|err| Error::StorageError {
                source_error: anyhow::Error::new(err),
            })?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;
    use crate::manager::{
        adapters::ChannelStore,
        context::memory::{InMemoryChain, InMemoryContext},
    };

    const CONTRACT: Address = address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef");
    const TOKEN_VARIANT: Address = address!("feedfeedfeedfeedfeedfeedfeedfeedfeedfeed");
    const RECEIVER: Address = address!("deaddeaddeaddeaddeaddeaddeaddeaddeaddead");

    fn manager() -> ChannelManager<InMemoryContext> {
        let chain = InMemoryChain::new(CONTRACT, TOKEN_VARIANT);
        let wallet = PrivateKeySigner::random();
        chain.set_balance(None, wallet.address(), U256::from(10_000));
        ChannelManager::new(
            InMemoryContext::new(chain, "sender"),
            wallet,
            ManagerOptions::default(),
        )
    }

    #[tokio::test]
    async fn record_unseen_by_the_lookup_is_a_conflict() {
        let manager = manager();

        // a record for the pair that the lookup never reported
        let foreign = PaymentChannel {
            channel_id: ChannelId::from([0x66u8; 32]),
            sender: manager.account(),
            receiver: RECEIVER,
            value: U256::from(1000),
            spent: U256::ZERO,
            state: ChannelState::Open,
            contract_address: CONTRACT,
            kind: ContractKind::Native,
        };
        manager.context().save(foreign).await.unwrap();

        let conflicted = manager
            .open_channel(RECEIVER, U256::from(100), ContractKind::Native, &[])
            .await;
        assert!(matches!(conflicted, Err(Error::Conflict { .. })));
        assert_eq!(manager.context().chain().open_transaction_count(), 0);
    }

    #[tokio::test]
    async fn known_records_do_not_conflict() {
        let manager = manager();

        let first = manager
            .require_open_channel(RECEIVER, U256::from(100), ContractKind::Native)
            .await
            .unwrap();
        // the lookup sees the exhausted record, so the second open goes through
        manager
            .next_payment(first.channel_id, U256::from(1000), String::new())
            .await
            .unwrap();
        let second = manager
            .require_open_channel(RECEIVER, U256::from(100), ContractKind::Native)
            .await
            .unwrap();

        assert_ne!(second.channel_id, first.channel_id);
        assert_eq!(manager.context().chain().open_transaction_count(), 2);
    }
}
