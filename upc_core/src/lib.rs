// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0
#![doc = include_str!("../README.md")]
//! ## Getting started
//!
//! To get started, take a look at the [`manager`] module for the channel
//! manager and the adapter traits it coordinates, and at [`client`] for the
//! buyer- and receiver-facing facade.

mod error;

pub mod channel;
pub mod client;
pub mod digest;
pub mod manager;
pub mod payment;

pub use error::{Error, Result};
