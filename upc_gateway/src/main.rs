use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
};

use alloy::{
    primitives::{address, Address, U256},
    signers::local::PrivateKeySigner,
};
use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use upc_core::{
    client::Client,
    manager::{
        context::memory::{InMemoryChain, InMemoryContext},
        ChannelManager, ManagerOptions,
    },
};
use upc_gateway::{
    config::{Args, Engine},
    server,
    transport::HttpTransport,
};

// Deployment addresses the memory engine simulates the contracts at.
const NATIVE_CONTRACT: Address = address!("0000000000000000000000000000000000000c0a");
const TOKEN_CONTRACT: Address = address!("0000000000000000000000000000000000000c0b");

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    // Create a wallet from the configured key.
    let wallet = PrivateKeySigner::from_str(args.private_key.trim_start_matches("0x"))?;

    let client = match args.engine {
        Engine::Memory => {
            if args.database_file.is_some() {
                warn!("the memory engine ignores --database-file");
            }
            warn!("memory engine: state and the simulated chain do not outlive the process");
            let chain = InMemoryChain::new(NATIVE_CONTRACT, TOKEN_CONTRACT);
            let context = InMemoryContext::new(chain, "receiver");
            let options = ManagerOptions {
                minimum_channel_amount: U256::from(args.minimum_channel_amount),
                settling_period: args.settlement_period,
                ..ManagerOptions::default()
            };
            Client::new(
                ChannelManager::new(context, wallet, options),
                HttpTransport::new(),
            )
        }
    };

    // Start the HTTP server.
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, args.port).into();
    let (mut handle, addr) = server::run_server(bind, client, U256::from(args.price)).await?;
    info!("accepting payments at http://{addr}/payments");

    // Have tokio wait for SIGTERM or SIGINT.
    let mut signal_sigint = signal(SignalKind::interrupt())?;
    let mut signal_sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal_sigint.recv() => println!("SIGINT"),
        _ = signal_sigterm.recv() => println!("SIGTERM"),
    }

    // If we're here, we've received a signal to exit.
    println!("Shutting down...");

    // Stop the server and wait for it to finish gracefully.
    handle.stop();
    handle.stopped().await;

    Ok(())
}
