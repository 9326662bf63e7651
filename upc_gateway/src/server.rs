// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Receiver-side HTTP surface.
//!
//! Four routes carry the whole handshake: unpaid requests to the paywalled
//! resource are answered with a `402 Payment Required` challenge, signed
//! payments are POSTed to `/payments` and answered with an opaque receipt
//! token, and `/verify/{token}` resolves a token back into the payment it
//! stands for. `/channels` lists the channels currently open towards this
//! gateway.

use std::{net::SocketAddr, sync::Arc};

use alloy::primitives::{Address, U256};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{register_counter, register_int_counter, Counter, IntCounter};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use upc_core::{
    channel::ContractKind,
    client::{Client, PaymentRequired},
    manager::{adapters::ChannelContract, context::memory::InMemoryContext},
    payment::Payment,
    Error,
};

use crate::transport::HttpTransport;

// Register the metrics into the global metrics registry.
lazy_static! {
    static ref PAYMENT_ACCEPTED_COUNTER: IntCounter = register_int_counter!(
        "payment_accepted_count",
        "Number of payments accepted by this gateway."
    )
    .unwrap();
    static ref PAYMENT_REJECTED_COUNTER: IntCounter = register_int_counter!(
        "payment_rejected_count",
        "Number of payments rejected (for any reason)."
    )
    .unwrap();
    static ref CHALLENGE_ISSUED_COUNTER: IntCounter = register_int_counter!(
        "challenge_issued_count",
        "Number of 402 challenges issued to unpaid requests."
    )
    .unwrap();
// Using float for the value because it can somewhat easily exceed the maximum value of int64.
    static ref TOTAL_VALUE_ACCEPTED: Counter = register_counter!(
        "total_value_accepted",
        "Total successfully accepted payment value (wei)."
    )
    .unwrap();
}

/// The concrete client this gateway runs: memory engine, HTTP transport.
pub type GatewayClient = Client<InMemoryContext, HttpTransport>;

#[derive(Clone)]
struct AppState {
    client: Arc<GatewayClient>,
    price: U256,
    contract_address: Address,
    gateway_url: String,
}

/// Running server, stoppable from the outside.
pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Signals the server to stop accepting connections.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Waits for in-flight requests to drain.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

/// Binds `addr` and serves the gateway routes until the handle is stopped.
pub async fn run_server(
    addr: SocketAddr,
    client: GatewayClient,
    price: U256,
) -> anyhow::Result<(ServerHandle, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let contract_address = client
        .manager()
        .context()
        .contract_address(ContractKind::Native);
    let state = AppState {
        client: Arc::new(client),
        price,
        contract_address,
        gateway_url: format!("http://{addr}/payments"),
    };

    let app = Router::new()
        .route("/payments", post(accept_payment))
        .route("/verify/{token}", get(verify))
        .route("/channels", get(channels))
        .route("/content", get(content))
        .route("/metrics", get(metrics))
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = serve.await {
            error!("server error: {err}");
        }
    });
    info!("gateway listening on {addr}");

    Ok((
        ServerHandle {
            shutdown: Some(shutdown_tx),
            task,
        },
        addr,
    ))
}

async fn accept_payment(State(state): State<AppState>, Json(payment): Json<Payment>) -> Response {
    let value = payment.price;
    match state.client.accept_payment(payment).await {
        Ok(response) => {
            PAYMENT_ACCEPTED_COUNTER.inc();
            TOTAL_VALUE_ACCEPTED.inc_by(value.to_string().parse::<f64>().unwrap_or(0.0));
            Json(response).into_response()
        }
        Err(err) => {
            PAYMENT_REJECTED_COUNTER.inc();
            error!("payment rejected: {err}");
            error_response(err)
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment: Option<Payment>,
}

async fn verify(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.client.accept_verify(&token).await {
        Ok(payment) => Json(VerifyResponse {
            accepted: true,
            payment: Some(payment),
        })
        .into_response(),
        Err(Error::PaymentNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(VerifyResponse {
                accepted: false,
                payment: None,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("verify failed: {err}");
            error_response(err)
        }
    }
}

async fn channels(State(state): State<AppState>) -> Response {
    match state.client.manager().open_channels().await {
        Ok(channels) => Json(channels).into_response(),
        Err(err) => {
            error!("channel listing failed: {err}");
            error_response(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentQuery {
    token: Option<String>,
}

async fn content(State(state): State<AppState>, Query(query): Query<ContentQuery>) -> Response {
    if let Some(token) = query.token {
        if state.client.accept_verify(&token).await.is_ok() {
            return "paid content\n".into_response();
        }
    }

    CHALLENGE_ISSUED_COUNTER.inc();
    let challenge = PaymentRequired {
        receiver: state.client.manager().account(),
        price: state.price,
        gateway: state.gateway_url.clone(),
        meta: "/content".to_owned(),
        contract_address: state.contract_address,
        token_contract: None,
    };
    (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response()
}

async fn metrics() -> Response {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => body.into_response(),
        Err(err) => {
            error!("metrics encoding failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::InvalidPayment(_) | Error::WalletError(_) | Error::SignatureError(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::ChannelNotFound { .. }
        | Error::PaymentNotFound { .. }
        | Error::NothingToClaim { .. } => StatusCode::NOT_FOUND,
        Error::InvalidState { .. }
        | Error::InsufficientCapacity { .. }
        | Error::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
