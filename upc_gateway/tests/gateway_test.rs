// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

// These tests run the whole handshake over real HTTP: a gateway on an
// ephemeral port challenges an unpaid request, the sender pays through the
// HTTP transport, and the receipt token unlocks the resource.

use std::net::{Ipv4Addr, SocketAddr};

use alloy::{
    primitives::{address, Address, U256},
    signers::local::PrivateKeySigner,
};
use upc_core::{
    channel::ContractKind,
    client::Client,
    manager::{
        context::memory::{InMemoryChain, InMemoryContext},
        ChannelManager, ManagerOptions,
    },
    payment::Payment,
};
use upc_gateway::{
    server::{self, GatewayClient},
    transport::HttpTransport,
};

const CONTRACT: Address = address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef");
const TOKEN_VARIANT: Address = address!("feedfeedfeedfeedfeedfeedfeedfeedfeedfeed");

fn options() -> ManagerOptions {
    ManagerOptions {
        minimum_channel_amount: U256::from(1000),
        deposit_multiplier: 10,
        settling_period: 5,
    }
}

fn client_for(chain: &InMemoryChain, namespace: &str, wallet: PrivateKeySigner) -> GatewayClient {
    Client::new(
        ChannelManager::new(
            InMemoryContext::new(chain.clone(), namespace),
            wallet,
            options(),
        ),
        HttpTransport::new(),
    )
}

async fn spawn_gateway(chain: &InMemoryChain) -> (server::ServerHandle, SocketAddr) {
    let receiver = client_for(chain, "receiver", PrivateKeySigner::random());
    let bind: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
    server::run_server(bind, receiver, U256::from(100))
        .await
        .unwrap()
}

#[tokio::test]
async fn buy_url_against_a_live_gateway() {
    let chain = InMemoryChain::new(CONTRACT, TOKEN_VARIANT);
    let (mut handle, addr) = spawn_gateway(&chain).await;

    let sender_wallet = PrivateKeySigner::random();
    chain.set_balance(None, sender_wallet.address(), U256::from(100_000));
    let sender = client_for(&chain, "sender", sender_wallet);

    // the unpaid request is challenged with a 402 and paid transparently
    let bought = sender
        .buy_url(&format!("http://{addr}/content"))
        .await
        .unwrap();
    assert!(!bought.token.is_empty());

    // the token unlocks the resource
    let content = reqwest::get(format!("http://{addr}/content?token={}", bought.token))
        .await
        .unwrap();
    assert_eq!(content.status(), reqwest::StatusCode::OK);

    // the receipt is queryable
    let verify = reqwest::get(format!("http://{addr}/verify/{}", bought.token))
        .await
        .unwrap();
    assert_eq!(verify.status(), reqwest::StatusCode::OK);

    // a token never issued is not
    let missing = reqwest::get(format!("http://{addr}/verify/bogus"))
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    // a second buy reuses the channel
    let again = sender
        .buy_url(&format!("http://{addr}/content"))
        .await
        .unwrap();
    assert_eq!(again.channel_id, bought.channel_id);
    assert_eq!(chain.open_transaction_count(), 1);

    let listed: Vec<serde_json::Value> = reqwest::get(format!("http://{addr}/channels"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    handle.stop();
    handle.stopped().await;
}

#[tokio::test]
async fn forged_payments_are_refused_over_http() {
    let chain = InMemoryChain::new(CONTRACT, TOKEN_VARIANT);
    let (mut handle, addr) = spawn_gateway(&chain).await;

    let sender_wallet = PrivateKeySigner::random();
    chain.set_balance(None, sender_wallet.address(), U256::from(100_000));
    let sender = client_for(&chain, "sender", sender_wallet);

    // a real channel, but a promise signed by somebody else
    let challenge = sender
        .manager()
        .require_open_channel(
            address!("deaddeaddeaddeaddeaddeaddeaddeaddeaddead"),
            U256::from(100),
            ContractKind::Native,
        )
        .await
        .unwrap();
    let mallory = PrivateKeySigner::random();
    let forged = Payment::new(&challenge, U256::from(100), String::new(), &mallory).unwrap();

    let refused = reqwest::Client::new()
        .post(format!("http://{addr}/payments"))
        .json(&forged)
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::BAD_REQUEST);

    handle.stop();
    handle.stopped().await;
}
