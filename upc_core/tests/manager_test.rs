// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

// These tests exercise the channel manager against the in-memory context:
// payment monotonicity under concurrency, single-open under a burst of
// first-time buys, promise validation on the receiver side, reuse, and the
// closure flows of both parties.

use std::sync::Arc;

use alloy::{
    primitives::{address, Address, U256},
    signers::local::PrivateKeySigner,
};
use rstest::*;
use upc_core::{
    channel::{ChannelState, ContractKind},
    manager::{
        adapters::{ChannelContract, ChannelStore, PaymentStore},
        context::memory::{InMemoryChain, InMemoryContext},
        ChannelManager, ManagerOptions,
    },
    payment::Payment,
    Error,
};

const CONTRACT: Address = address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef");
const TOKEN_VARIANT: Address = address!("feedfeedfeedfeedfeedfeedfeedfeedfeedfeed");

const SENDER_FUNDS: u64 = 100_000;

struct ContextFixture {
    chain: InMemoryChain,
    sender: ChannelManager<InMemoryContext>,
    receiver: ChannelManager<InMemoryContext>,
    receiver_address: Address,
}

fn options() -> ManagerOptions {
    ManagerOptions {
        minimum_channel_amount: U256::from(1000),
        deposit_multiplier: 10,
        settling_period: 5,
    }
}

#[fixture]
fn context() -> ContextFixture {
    let chain = InMemoryChain::new(CONTRACT, TOKEN_VARIANT);
    let sender_wallet = PrivateKeySigner::random();
    let receiver_wallet = PrivateKeySigner::random();
    let receiver_address = receiver_wallet.address();
    chain.set_balance(None, sender_wallet.address(), U256::from(SENDER_FUNDS));

    let sender = ChannelManager::new(
        InMemoryContext::new(chain.clone(), "sender"),
        sender_wallet,
        options(),
    );
    let receiver = ChannelManager::new(
        InMemoryContext::new(chain.clone(), "receiver"),
        receiver_wallet,
        options(),
    );

    ContextFixture {
        chain,
        sender,
        receiver,
        receiver_address,
    }
}

#[rstest]
#[tokio::test]
async fn sequential_payments_are_strictly_increasing(context: ContextFixture) {
    let ContextFixture {
        sender,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    assert_eq!(channel.value, U256::from(1000));

    for expected in [100u64, 200, 300] {
        let payment = sender
            .next_payment(channel.channel_id, U256::from(100), String::new())
            .await
            .unwrap();
        assert_eq!(payment.cumulative, U256::from(expected));
    }

    let stored = sender
        .context()
        .first_by_id(channel.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.spent, U256::from(300));
}

#[rstest]
#[tokio::test]
async fn concurrent_payments_serialize_per_channel(context: ContextFixture) {
    let ContextFixture {
        sender,
        receiver_address,
        ..
    } = context;
    let sender = Arc::new(sender);

    let channel = sender
        .require_open_channel(receiver_address, U256::from(10), ContractKind::Native)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let sender = sender.clone();
        let channel_id = channel.channel_id;
        handles.push(tokio::spawn(async move {
            sender
                .next_payment(channel_id, U256::from(10), String::new())
                .await
                .unwrap()
                .cumulative
        }));
    }

    let mut cumulative = Vec::new();
    for handle in handles {
        cumulative.push(handle.await.unwrap());
    }
    cumulative.sort();

    let expected: Vec<U256> = (1..=10u64).map(|i| U256::from(i * 10)).collect();
    assert_eq!(cumulative, expected);
}

#[rstest]
#[tokio::test]
async fn burst_of_first_time_buys_opens_one_channel(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver_address,
        ..
    } = context;
    let sender = Arc::new(sender);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sender = sender.clone();
        handles.push(tokio::spawn(async move {
            sender
                .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
                .await
                .unwrap()
                .channel_id
        }));
    }

    let mut channel_ids = Vec::new();
    for handle in handles {
        channel_ids.push(handle.await.unwrap());
    }

    channel_ids.dedup();
    assert_eq!(channel_ids.len(), 1);
    assert_eq!(chain.open_transaction_count(), 1);
}

#[rstest]
#[tokio::test]
async fn foreign_signature_is_rejected_without_a_spend(context: ContextFixture) {
    let ContextFixture {
        sender,
        receiver,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();

    // signed by a wallet that is not the channel sender
    let mallory = PrivateKeySigner::random();
    let forged = Payment::new(&channel, U256::from(100), String::new(), &mallory).unwrap();

    let rejected = receiver.accept_payment(&forged).await;
    assert!(matches!(rejected, Err(Error::InvalidPayment(_))));

    // nothing was booked on the receiver side
    assert!(receiver
        .context()
        .first_by_id(channel.channel_id)
        .await
        .unwrap()
        .is_none());
}

#[rstest]
#[tokio::test]
async fn receiver_mirrors_and_books_payments(context: ContextFixture) {
    let ContextFixture {
        sender,
        receiver,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();

    let payment = sender
        .next_payment(channel.channel_id, U256::from(100), String::new())
        .await
        .unwrap();
    let booked = receiver.accept_payment(&payment).await.unwrap();
    assert_eq!(booked.spent, U256::from(100));

    // replaying the same cumulative is rejected
    let replay = receiver.accept_payment(&payment).await;
    assert!(matches!(replay, Err(Error::InvalidPayment(_))));

    let stored = receiver
        .context()
        .first_by_id(channel.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.spent, U256::from(100));
}

#[rstest]
#[tokio::test]
async fn buys_reuse_the_channel_while_capacity_lasts(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver_address,
        ..
    } = context;

    let first = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    for _ in 0..3 {
        sender
            .next_payment(first.channel_id, U256::from(100), String::new())
            .await
            .unwrap();
    }

    let reused = sender
        .require_open_channel(receiver_address, U256::from(50), ContractKind::Native)
        .await
        .unwrap();
    assert_eq!(reused.channel_id, first.channel_id);

    let payment = sender
        .next_payment(reused.channel_id, U256::from(50), String::new())
        .await
        .unwrap();
    assert_eq!(payment.cumulative, U256::from(350));
    assert_eq!(chain.open_transaction_count(), 1);
}

#[rstest]
#[tokio::test]
async fn exhausted_channels_are_not_reused(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver_address,
        ..
    } = context;

    let first = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    sender
        .next_payment(first.channel_id, U256::from(950), String::new())
        .await
        .unwrap();

    // 50 remaining cannot carry 100
    let second = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    assert_ne!(second.channel_id, first.channel_id);
    assert_eq!(chain.open_transaction_count(), 2);

    let over = sender
        .next_payment(first.channel_id, U256::from(100), String::new())
        .await;
    assert!(matches!(over, Err(Error::InsufficientCapacity { .. })));
}

#[rstest]
#[tokio::test]
async fn receiver_close_claims_the_highest_promise(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver,
        receiver_address,
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    for index in 0..3 {
        let payment = sender
            .next_payment(channel.channel_id, U256::from(100), String::new())
            .await
            .unwrap();
        receiver.accept_payment(&payment).await.unwrap();
        receiver
            .context()
            .add_payment(Payment {
                token: Some(format!("token-{index}")),
                ..payment
            })
            .await
            .unwrap();
    }

    receiver.close_channel(channel.channel_id).await.unwrap();

    assert_eq!(chain.balance(None, receiver_address), U256::from(300));
    assert_eq!(chain.balance(None, sender.account()), U256::from(SENDER_FUNDS - 300));
    assert_eq!(
        chain.state(channel.channel_id).await.unwrap(),
        ChannelState::Absent
    );
    let local = receiver
        .context()
        .first_by_id(channel.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.state, ChannelState::Absent);
}

#[rstest]
#[tokio::test]
async fn sender_close_settles_after_the_period(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();

    sender.close_channel(channel.channel_id).await.unwrap();
    let settling = sender
        .context()
        .first_by_id(channel.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settling.state, ChannelState::Settling);

    // the settling period has not elapsed yet
    let early = sender.close_channel(channel.channel_id).await;
    assert!(matches!(early, Err(Error::InvalidState { .. })));

    chain.advance_blocks(options().settling_period);
    sender.close_channel(channel.channel_id).await.unwrap();

    assert_eq!(chain.balance(None, sender.account()), U256::from(SENDER_FUNDS));
    assert_eq!(
        chain.state(channel.channel_id).await.unwrap(),
        ChannelState::Absent
    );
}

#[rstest]
#[tokio::test]
async fn receiver_claims_while_the_sender_settles(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver,
        receiver_address,
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    let payment = sender
        .next_payment(channel.channel_id, U256::from(400), String::new())
        .await
        .unwrap();
    receiver.accept_payment(&payment).await.unwrap();
    receiver
        .context()
        .add_payment(Payment {
            token: Some("token-0".to_owned()),
            ..payment
        })
        .await
        .unwrap();

    sender.close_channel(channel.channel_id).await.unwrap();
    receiver.close_channel(channel.channel_id).await.unwrap();

    assert_eq!(chain.balance(None, receiver_address), U256::from(400));
    assert_eq!(chain.balance(None, sender.account()), U256::from(SENDER_FUNDS - 400));
    assert_eq!(
        chain.state(channel.channel_id).await.unwrap(),
        ChannelState::Absent
    );
}

#[rstest]
#[tokio::test]
async fn deposit_extends_capacity(context: ContextFixture) {
    let ContextFixture {
        sender,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    sender
        .next_payment(channel.channel_id, U256::from(1000), String::new())
        .await
        .unwrap();

    sender
        .deposit(channel.channel_id, U256::from(500))
        .await
        .unwrap();
    let payment = sender
        .next_payment(channel.channel_id, U256::from(500), String::new())
        .await
        .unwrap();
    assert_eq!(payment.cumulative, U256::from(1500));
}

#[rstest]
#[tokio::test]
async fn failed_open_leaves_no_local_record() {
    let chain = InMemoryChain::new(CONTRACT, TOKEN_VARIANT);
    // wallet holds nothing, so the opening transaction reverts
    let broke = ChannelManager::new(
        InMemoryContext::new(chain.clone(), "sender"),
        PrivateKeySigner::random(),
        options(),
    );

    let receiver_address = address!("deaddeaddeaddeaddeaddeaddeaddeaddeaddead");
    let failed = broke
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await;
    assert!(matches!(failed, Err(Error::ChainError { .. })));

    assert!(broke.context().all().await.unwrap().is_empty());
    assert_eq!(chain.open_transaction_count(), 0);
}

#[rstest]
#[tokio::test]
async fn open_channels_reflect_the_chain(context: ContextFixture) {
    let ContextFixture {
        chain,
        sender,
        receiver_address,
        ..
    } = context;

    let channel = sender
        .require_open_channel(receiver_address, U256::from(100), ContractKind::Native)
        .await
        .unwrap();
    assert_eq!(sender.open_channels().await.unwrap().len(), 1);
    assert!(sender.settling_channels().await.unwrap().is_empty());

    sender.close_channel(channel.channel_id).await.unwrap();
    assert!(sender.open_channels().await.unwrap().is_empty());
    assert_eq!(sender.settling_channels().await.unwrap().len(), 1);

    chain.advance_blocks(options().settling_period);
    sender.close_channel(channel.channel_id).await.unwrap();
    assert!(sender.settling_channels().await.unwrap().is_empty());
}
