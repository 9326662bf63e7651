// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Payment digests and signatures
//!
//! A payment promise authorizes the receiver of a channel to claim a
//! cumulative amount from it. The on-chain contract verifies an ECDSA
//! signature over the tight-packed
//! `keccak256(contractAddress ‖ channelId ‖ cumulative ‖ [tokenContract])`,
//! wrapped in the `"\x19Ethereum Signed Message:\n32"` prefix hash, so the
//! off-chain digest computed here must be bit-exact with the contract's
//! `paymentDigest` view.
//!
//! # Example
//! ```rust
//! use alloy::{
//!     primitives::{Address, B256, U256},
//!     signers::local::PrivateKeySigner,
//! };
//! use upc_core::digest::{recover_signer, sign_payment};
//!
//! let wallet = PrivateKeySigner::random();
//! let contract = Address::from([0x11u8; 20]);
//! let channel_id = B256::from([0x22u8; 32]);
//!
//! let signature = sign_payment(&wallet, contract, channel_id, U256::from(100), None).unwrap();
//! let signer = recover_signer(&signature, contract, channel_id, U256::from(100), None).unwrap();
//!
//! assert_eq!(signer, wallet.address());
//! ```

use alloy::{
    primitives::{
        eip191_hash_message, keccak256, Address, Signature, SignatureError, B256, U256,
    },
    signers::{local::PrivateKeySigner, SignerSync},
};

use crate::channel::ChannelId;

/// Raw digest of a payment promise, before the EIP-191 prefix.
///
/// Encoding is tight packed: 20-byte contract address, 32-byte channel id,
/// 32-byte big-endian cumulative amount, and for the token variant the
/// 20-byte ERC20 contract address. No length prefixes, no padding.
pub fn payment_digest(
    contract_address: Address,
    channel_id: ChannelId,
    cumulative: U256,
    token_contract: Option<Address>,
) -> B256 {
    let mut packed = Vec::with_capacity(20 + 32 + 32 + 20);
    packed.extend_from_slice(contract_address.as_slice());
    packed.extend_from_slice(channel_id.as_slice());
    packed.extend_from_slice(&cumulative.to_be_bytes::<32>());
    if let Some(token_contract) = token_contract {
        packed.extend_from_slice(token_contract.as_slice());
    }
    keccak256(packed)
}

/// The digest a wallet actually signs: [`payment_digest`] behind the
/// `"\x19Ethereum Signed Message:\n32"` prefix hash.
pub fn recoverable_digest(
    contract_address: Address,
    channel_id: ChannelId,
    cumulative: U256,
    token_contract: Option<Address>,
) -> B256 {
    eip191_hash_message(payment_digest(
        contract_address,
        channel_id,
        cumulative,
        token_contract,
    ))
}

/// Signs the promise of `cumulative` on the channel with `signing_wallet`.
///
/// # Errors
///
/// Returns [`alloy::signers::Error`] if the wallet could not sign
pub fn sign_payment(
    signing_wallet: &PrivateKeySigner,
    contract_address: Address,
    channel_id: ChannelId,
    cumulative: U256,
    token_contract: Option<Address>,
) -> Result<Signature, alloy::signers::Error> {
    let digest = recoverable_digest(contract_address, channel_id, cumulative, token_contract);
    signing_wallet.sign_hash_sync(&digest)
}

/// Recovers and returns the signer of a promise from its signature.
pub fn recover_signer(
    signature: &Signature,
    contract_address: Address,
    channel_id: ChannelId,
    cumulative: U256,
    token_contract: Option<Address>,
) -> Result<Address, SignatureError> {
    let digest = recoverable_digest(contract_address, channel_id, cumulative, token_contract);
    signature.recover_address_from_prehash(&digest)
}
