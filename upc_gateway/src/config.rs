// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration surface.

use clap::Parser;

/// Storage backends the gateway can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Engine {
    /// Process-local storage over a simulated chain, for development and
    /// testing.
    Memory,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, default_value_t = 8080, env = "UPC_PORT")]
    pub port: u16,

    /// Hex-encoded private key the gateway signs and transacts as.
    #[arg(short = 'k', long, env = "UPC_PRIVATE_KEY")]
    pub private_key: String,

    /// Storage backend to bind.
    #[arg(long, value_enum, default_value = "memory", env = "UPC_ENGINE")]
    pub engine: Engine,

    /// Storage locator for engines that persist to disk.
    #[arg(long, env = "UPC_DATABASE_FILE")]
    pub database_file: Option<String>,

    /// Floor on fresh channel deposits, in wei.
    #[arg(long, default_value_t = 0, env = "UPC_MINIMUM_CHANNEL_AMOUNT")]
    pub minimum_channel_amount: u128,

    /// Blocks of delay on sender-initiated close.
    #[arg(long, default_value_t = 11520, env = "UPC_SETTLEMENT_PERIOD")]
    pub settlement_period: u64,

    /// Price of the paywalled demo resource, in wei.
    #[arg(long, default_value_t = 100, env = "UPC_PRICE")]
    pub price: u128,
}
