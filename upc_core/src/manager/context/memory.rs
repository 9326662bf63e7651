// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory context implementation for the channel manager.
//!
//! This module provides an in-memory implementation of every adapter the
//! manager needs. [`InMemoryChain`] carries the contract semantics over
//! process-local maps — channel mapping, balance ledger, block counter — and
//! [`InMemoryContext`] layers namespaced channel and payment storage on top
//! of a shared chain. Useful for testing and development purposes.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use alloy::primitives::{Address, Signature, B256, U256};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use thiserror::Error;

use crate::{
    channel::{ChannelId, ChannelState, ContractKind, PaymentChannel},
    digest,
    manager::adapters::{ChannelContract, ChannelStore, OnchainChannel, PaymentStore, TxReceipt},
    payment::Payment,
};

/// Channel rows shared between contexts, ordered by insertion.
#[derive(Debug, Default)]
pub struct ChannelRows {
    rows: HashMap<String, (u64, PaymentChannel)>,
    insertions: u64,
}

pub type ChannelStorage = Arc<RwLock<ChannelRows>>;
pub type PaymentStorage = Arc<RwLock<Vec<(String, Payment)>>>;

#[derive(Debug, Error)]
pub enum InMemoryError {
    #[error("channel {0} already exists")]
    DuplicateChannel(ChannelId),
    #[error("channel {0} not found")]
    UnknownChannel(ChannelId),
    #[error("spent amount may not decrease: stored {stored}, received {received}")]
    DecreasingSpend { stored: U256, received: U256 },
    #[error("insufficient funds: {needed} needed, {available} available")]
    InsufficientFunds { needed: U256, available: U256 },
    #[error("transaction reverted: {0}")]
    Reverted(&'static str),
}

/// Miniature chain with the payment channel contract semantics.
///
/// One instance stands in for both deployed contract variants; shared by
/// cloning, so a sender-side and a receiver-side context can transact
/// against the same simulated chain.
#[derive(Clone)]
pub struct InMemoryChain {
    contract_address: Address,
    token_contract_address: Address,
    channels: Arc<RwLock<HashMap<ChannelId, OnchainChannel>>>,
    /// (asset, holder) → balance; the zero asset is the native coin.
    balances: Arc<RwLock<HashMap<(Address, Address), U256>>>,
    block_number: Arc<RwLock<u64>>,
    open_transactions: Arc<RwLock<u64>>,
}

impl InMemoryChain {
    /// Creates a chain with the native-variant contract deployed at
    /// `contract_address` and the token variant at `token_contract_address`.
    pub fn new(contract_address: Address, token_contract_address: Address) -> Self {
        Self {
            contract_address,
            token_contract_address,
            channels: Arc::new(RwLock::new(HashMap::new())),
            balances: Arc::new(RwLock::new(HashMap::new())),
            block_number: Arc::new(RwLock::new(1)),
            open_transactions: Arc::new(RwLock::new(0)),
        }
    }

    /// Funds `holder` with `amount` of the native coin (`asset: None`) or an
    /// ERC20.
    pub fn set_balance(&self, asset: Option<Address>, holder: Address, amount: U256) {
        let asset = asset.unwrap_or(Address::ZERO);
        self.balances.write().unwrap().insert((asset, holder), amount);
    }

    pub fn balance(&self, asset: Option<Address>, holder: Address) -> U256 {
        let asset = asset.unwrap_or(Address::ZERO);
        self.balances
            .read()
            .unwrap()
            .get(&(asset, holder))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Mines `count` empty blocks.
    pub fn advance_blocks(&self, count: u64) {
        *self.block_number.write().unwrap() += count;
    }

    /// Number of `open` transactions ever submitted.
    pub fn open_transaction_count(&self) -> u64 {
        *self.open_transactions.read().unwrap()
    }

    fn governing_address(&self, token_contract: Address) -> Address {
        if token_contract.is_zero() {
            self.contract_address
        } else {
            self.token_contract_address
        }
    }

    fn debit(&self, asset: Address, holder: Address, amount: U256) -> Result<(), InMemoryError> {
        let mut balances = self.balances.write().unwrap();
        let balance = balances.entry((asset, holder)).or_insert(U256::ZERO);
        if *balance < amount {
            return Err(InMemoryError::InsufficientFunds {
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(&self, asset: Address, holder: Address, amount: U256) {
        let mut balances = self.balances.write().unwrap();
        *balances.entry((asset, holder)).or_insert(U256::ZERO) += amount;
    }

    fn verify_promise(
        &self,
        channel_id: ChannelId,
        channel: &OnchainChannel,
        cumulative: U256,
        signature: &Signature,
    ) -> bool {
        let kind = ContractKind::from_token_address(channel.token_contract);
        digest::recover_signer(
            signature,
            self.governing_address(channel.token_contract),
            channel_id,
            cumulative,
            kind.token_contract(),
        )
        .map_or(false, |recovered| recovered == channel.sender)
    }

    fn next_receipt(&self) -> TxReceipt {
        let mut block_number = self.block_number.write().unwrap();
        *block_number += 1;
        TxReceipt {
            transaction_hash: B256::from(thread_rng().gen::<[u8; 32]>()),
            block_number: *block_number,
        }
    }
}

#[async_trait]
impl ChannelContract for InMemoryChain {
    type AdapterError = InMemoryError;

    fn contract_address(&self, kind: ContractKind) -> Address {
        match kind {
            ContractKind::Native => self.contract_address,
            ContractKind::Token(_) => self.token_contract_address,
        }
    }

    async fn open(
        &self,
        sender: Address,
        channel_id: ChannelId,
        receiver: Address,
        settling_period: u64,
        value: U256,
        kind: ContractKind,
    ) -> Result<TxReceipt, Self::AdapterError> {
        let token_contract = kind.token_contract().unwrap_or(Address::ZERO);
        {
            let mut channels = self.channels.write().unwrap();
            if channels.contains_key(&channel_id) {
                return Err(InMemoryError::DuplicateChannel(channel_id));
            }
            self.debit(token_contract, sender, value)?;
            channels.insert(
                channel_id,
                OnchainChannel {
                    sender,
                    receiver,
                    value,
                    settling_period,
                    settling_until: 0,
                    token_contract,
                },
            );
        }
        *self.open_transactions.write().unwrap() += 1;
        Ok(self.next_receipt())
    }

    async fn deposit(
        &self,
        sender: Address,
        channel_id: ChannelId,
        value: U256,
    ) -> Result<TxReceipt, Self::AdapterError> {
        {
            let mut channels = self.channels.write().unwrap();
            let channel = channels
                .get_mut(&channel_id)
                .ok_or(InMemoryError::UnknownChannel(channel_id))?;
            if channel.settling_until != 0 {
                return Err(InMemoryError::Reverted("deposit on a settling channel"));
            }
            if channel.sender != sender {
                return Err(InMemoryError::Reverted("deposit restricted to the sender"));
            }
            self.debit(channel.token_contract, sender, value)?;
            channel.value += value;
        }
        Ok(self.next_receipt())
    }

    async fn claim(
        &self,
        receiver: Address,
        channel_id: ChannelId,
        cumulative: U256,
        signature: Signature,
    ) -> Result<TxReceipt, Self::AdapterError> {
        {
            let mut channels = self.channels.write().unwrap();
            let channel = channels
                .get(&channel_id)
                .cloned()
                .ok_or(InMemoryError::UnknownChannel(channel_id))?;
            if receiver != channel.receiver {
                return Err(InMemoryError::Reverted("claim restricted to the receiver"));
            }
            if !self.verify_promise(channel_id, &channel, cumulative, &signature) {
                return Err(InMemoryError::Reverted(
                    "signature does not recover to the channel sender",
                ));
            }
            // a promise at or above the deposit pays out the whole deposit
            let paid = cumulative.min(channel.value);
            self.credit(channel.token_contract, channel.receiver, paid);
            self.credit(channel.token_contract, channel.sender, channel.value - paid);
            channels.remove(&channel_id);
        }
        Ok(self.next_receipt())
    }

    async fn start_settling(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError> {
        {
            let mut channels = self.channels.write().unwrap();
            let channel = channels
                .get_mut(&channel_id)
                .ok_or(InMemoryError::UnknownChannel(channel_id))?;
            if channel.sender != sender {
                return Err(InMemoryError::Reverted("settling restricted to the sender"));
            }
            if channel.settling_until != 0 {
                return Err(InMemoryError::Reverted("channel is already settling"));
            }
            let current = *self.block_number.read().unwrap();
            channel.settling_until = current + channel.settling_period;
        }
        Ok(self.next_receipt())
    }

    async fn settle(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError> {
        {
            let mut channels = self.channels.write().unwrap();
            let channel = channels
                .get(&channel_id)
                .cloned()
                .ok_or(InMemoryError::UnknownChannel(channel_id))?;
            if channel.sender != sender {
                return Err(InMemoryError::Reverted("settle restricted to the sender"));
            }
            if channel.settling_until == 0 {
                return Err(InMemoryError::Reverted("channel is not settling"));
            }
            if *self.block_number.read().unwrap() < channel.settling_until {
                return Err(InMemoryError::Reverted("settling period has not elapsed"));
            }
            self.credit(channel.token_contract, channel.sender, channel.value);
            channels.remove(&channel_id);
        }
        Ok(self.next_receipt())
    }

    async fn state(&self, channel_id: ChannelId) -> Result<ChannelState, Self::AdapterError> {
        Ok(self
            .channels
            .read()
            .unwrap()
            .get(&channel_id)
            .map_or(ChannelState::Absent, OnchainChannel::state))
    }

    async fn channel_by_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<OnchainChannel>, Self::AdapterError> {
        Ok(self.channels.read().unwrap().get(&channel_id).cloned())
    }

    async fn payment_digest(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
    ) -> Result<B256, Self::AdapterError> {
        let channels = self.channels.read().unwrap();
        let channel = channels
            .get(&channel_id)
            .ok_or(InMemoryError::UnknownChannel(channel_id))?;
        let kind = ContractKind::from_token_address(channel.token_contract);
        Ok(digest::payment_digest(
            self.governing_address(channel.token_contract),
            channel_id,
            cumulative,
            kind.token_contract(),
        ))
    }

    async fn can_claim(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
        origin: Address,
        signature: Signature,
    ) -> Result<bool, Self::AdapterError> {
        let channel = match self.channels.read().unwrap().get(&channel_id) {
            Some(channel) => channel.clone(),
            None => return Ok(false),
        };
        Ok(origin == channel.receiver
            && self.verify_promise(channel_id, &channel, cumulative, &signature))
    }

    async fn current_block(&self) -> Result<u64, Self::AdapterError> {
        Ok(*self.block_number.read().unwrap())
    }
}

/// In-memory channel and payment storage over a shared chain.
///
/// Records are namespaced so one backend can hold sender-side and
/// receiver-side state apart; two contexts built over the same
/// [`ChannelStorage`] with different namespaces never see each other's rows.
#[derive(Clone)]
pub struct InMemoryContext {
    chain: InMemoryChain,
    channel_storage: ChannelStorage,
    payment_storage: PaymentStorage,
    namespace: String,
}

impl InMemoryContext {
    /// Context with fresh private storage.
    pub fn new(chain: InMemoryChain, namespace: &str) -> Self {
        Self::with_storage(chain, namespace, Default::default(), Default::default())
    }

    /// Context over an existing backend, isolated by `namespace`.
    pub fn with_storage(
        chain: InMemoryChain,
        namespace: &str,
        channel_storage: ChannelStorage,
        payment_storage: PaymentStorage,
    ) -> Self {
        Self {
            chain,
            channel_storage,
            payment_storage,
            namespace: namespace.to_owned(),
        }
    }

    pub fn chain(&self) -> &InMemoryChain {
        &self.chain
    }

    fn key(&self, channel_id: ChannelId) -> String {
        format!("{}:{}", self.namespace, channel_id)
    }
}

#[async_trait]
impl ChannelStore for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn save(&self, channel: PaymentChannel) -> Result<(), Self::AdapterError> {
        let mut storage = self.channel_storage.write().unwrap();
        let key = self.key(channel.channel_id);
        if storage.rows.contains_key(&key) {
            return Err(InMemoryError::DuplicateChannel(channel.channel_id));
        }
        storage.insertions += 1;
        let insertion_id = storage.insertions;
        storage.rows.insert(key, (insertion_id, channel));
        Ok(())
    }

    async fn save_or_update(&self, channel: PaymentChannel) -> Result<(), Self::AdapterError> {
        let exists = {
            let storage = self.channel_storage.read().unwrap();
            storage.rows.contains_key(&self.key(channel.channel_id))
        };
        if exists {
            self.spend(channel.channel_id, channel.spent).await
        } else {
            self.save(channel).await
        }
    }

    async fn first_by_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<PaymentChannel>, Self::AdapterError> {
        let storage = self.channel_storage.read().unwrap();
        Ok(storage
            .rows
            .get(&self.key(channel_id))
            .map(|(_, channel)| channel.clone()))
    }

    async fn spend(
        &self,
        channel_id: ChannelId,
        new_spent: U256,
    ) -> Result<(), Self::AdapterError> {
        let mut storage = self.channel_storage.write().unwrap();
        let key = self.key(channel_id);
        let (_, channel) = storage
            .rows
            .get_mut(&key)
            .ok_or(InMemoryError::UnknownChannel(channel_id))?;
        if new_spent < channel.spent {
            return Err(InMemoryError::DecreasingSpend {
                stored: channel.spent,
                received: new_spent,
            });
        }
        channel.spent = new_spent;
        Ok(())
    }

    async fn deposit(&self, channel_id: ChannelId, delta: U256) -> Result<(), Self::AdapterError> {
        let mut storage = self.channel_storage.write().unwrap();
        let key = self.key(channel_id);
        let (_, channel) = storage
            .rows
            .get_mut(&key)
            .ok_or(InMemoryError::UnknownChannel(channel_id))?;
        channel.value += delta;
        Ok(())
    }

    async fn update_state(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> Result<(), Self::AdapterError> {
        let mut storage = self.channel_storage.write().unwrap();
        let key = self.key(channel_id);
        let (_, channel) = storage
            .rows
            .get_mut(&key)
            .ok_or(InMemoryError::UnknownChannel(channel_id))?;
        channel.state = state;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PaymentChannel>, Self::AdapterError> {
        let storage = self.channel_storage.read().unwrap();
        let prefix = format!("{}:", self.namespace);
        let mut rows: Vec<_> = storage
            .rows
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|(insertion_id, _)| *insertion_id);
        Ok(rows.into_iter().map(|(_, channel)| channel).collect())
    }

    async fn find_by_sender_receiver(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Vec<PaymentChannel>, Self::AdapterError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|channel| channel.sender == sender && channel.receiver == receiver)
            .collect())
    }

    async fn find_by_sender_receiver_channel_id(
        &self,
        sender: Address,
        receiver: Address,
        channel_id: ChannelId,
    ) -> Result<Option<PaymentChannel>, Self::AdapterError> {
        Ok(self
            .first_by_id(channel_id)
            .await?
            .filter(|channel| channel.sender == sender && channel.receiver == receiver))
    }
}

#[async_trait]
impl PaymentStore for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn add_payment(&self, payment: Payment) -> Result<(), Self::AdapterError> {
        let mut storage = self.payment_storage.write().unwrap();
        storage.push((self.namespace.clone(), payment));
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Payment>, Self::AdapterError> {
        let storage = self.payment_storage.read().unwrap();
        Ok(storage
            .iter()
            .find(|(namespace, payment)| {
                *namespace == self.namespace && payment.token.as_deref() == Some(token)
            })
            .map(|(_, payment)| payment.clone()))
    }

    async fn find_by_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<Payment>, Self::AdapterError> {
        let storage = self.payment_storage.read().unwrap();
        Ok(storage
            .iter()
            .filter(|(namespace, payment)| {
                *namespace == self.namespace && payment.channel_id == channel_id
            })
            .map(|(_, payment)| payment.clone())
            .collect())
    }
}

// The context fronts the chain it was built over, so one type satisfies
// every bound the manager asks for.
#[async_trait]
impl ChannelContract for InMemoryContext {
    type AdapterError = InMemoryError;

    fn contract_address(&self, kind: ContractKind) -> Address {
        self.chain.contract_address(kind)
    }

    async fn open(
        &self,
        sender: Address,
        channel_id: ChannelId,
        receiver: Address,
        settling_period: u64,
        value: U256,
        kind: ContractKind,
    ) -> Result<TxReceipt, Self::AdapterError> {
        self.chain
            .open(sender, channel_id, receiver, settling_period, value, kind)
            .await
    }

    async fn deposit(
        &self,
        sender: Address,
        channel_id: ChannelId,
        value: U256,
    ) -> Result<TxReceipt, Self::AdapterError> {
        ChannelContract::deposit(&self.chain, sender, channel_id, value).await
    }

    async fn claim(
        &self,
        receiver: Address,
        channel_id: ChannelId,
        cumulative: U256,
        signature: Signature,
    ) -> Result<TxReceipt, Self::AdapterError> {
        self.chain
            .claim(receiver, channel_id, cumulative, signature)
            .await
    }

    async fn start_settling(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError> {
        self.chain.start_settling(sender, channel_id).await
    }

    async fn settle(
        &self,
        sender: Address,
        channel_id: ChannelId,
    ) -> Result<TxReceipt, Self::AdapterError> {
        self.chain.settle(sender, channel_id).await
    }

    async fn state(&self, channel_id: ChannelId) -> Result<ChannelState, Self::AdapterError> {
        self.chain.state(channel_id).await
    }

    async fn channel_by_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<OnchainChannel>, Self::AdapterError> {
        self.chain.channel_by_id(channel_id).await
    }

    async fn payment_digest(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
    ) -> Result<B256, Self::AdapterError> {
        self.chain.payment_digest(channel_id, cumulative).await
    }

    async fn can_claim(
        &self,
        channel_id: ChannelId,
        cumulative: U256,
        origin: Address,
        signature: Signature,
    ) -> Result<bool, Self::AdapterError> {
        self.chain
            .can_claim(channel_id, cumulative, origin, signature)
            .await
    }

    async fn current_block(&self) -> Result<u64, Self::AdapterError> {
        self.chain.current_block().await
    }
}
