// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod memory;
