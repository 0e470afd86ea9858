// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wallet transfer saga on sagaflow-core.
//!
//! This crate demonstrates a two-wallet money transfer with retries,
//! compensation and a manual-attention failover step, persisted either in
//! memory or in SQLite.

pub mod transfer;
pub mod wallet;

pub use transfer::{
    TRANSFER_WORKFLOW, TransferCommand, TransferPolicy, TransferState, TransferStatus,
    TransferWorkflow,
};
pub use wallet::{MAX_PROCESSED_COMMANDS, Wallet, WalletError, WalletService};
