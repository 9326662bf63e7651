// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport for the micropayment handshake.

use std::result::Result as StdResult;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use upc_core::{
    client::{AcceptPaymentResponse, PaymentRequired, PaymentTransport},
    payment::Payment,
};

/// Errors crossing the HTTP boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The endpoint did not challenge for payment.
    #[error("expected a 402 challenge, got status {0}")]
    NotAChallenge(u16),

    /// The gateway refused the payment.
    #[error("gateway refused the payment: status {status}, body {body}")]
    Refused { status: u16, body: String },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),
}

/// Ships challenges and payments over HTTP.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PaymentTransport for HttpTransport {
    type AdapterError = TransportError;

    async fn fetch_challenge(&self, url: &str) -> StdResult<PaymentRequired, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if response.status() != StatusCode::PAYMENT_REQUIRED {
            return Err(TransportError::NotAChallenge(response.status().as_u16()));
        }
        response
            .json::<PaymentRequired>()
            .await
            .map_err(|e| TransportError::Json(e.to_string()))
    }

    async fn send_payment(
        &self,
        gateway: &str,
        payment: &Payment,
    ) -> StdResult<AcceptPaymentResponse, TransportError> {
        let response = self
            .client
            .post(gateway)
            .json(payment)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Refused {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<AcceptPaymentResponse>()
            .await
            .map_err(|e| TransportError::Json(e.to_string()))
    }
}
