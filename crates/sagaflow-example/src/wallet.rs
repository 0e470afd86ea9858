// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A toy wallet service standing in for a remote ledger.
//!
//! Every balance change carries a command id. A wallet remembers the last
//! [`MAX_PROCESSED_COMMANDS`] ids it applied and ignores repeats, which makes
//! retried saga steps safe.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// How many command ids a wallet remembers for deduplication.
pub const MAX_PROCESSED_COMMANDS: usize = 1000;

/// Wallet operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    /// No wallet with this id.
    #[error("wallet '{0}' does not exist")]
    UnknownWallet(String),

    /// The balance does not cover the withdrawal.
    #[error("wallet '{wallet}' has balance {balance}, cannot withdraw {amount}")]
    InsufficientFunds {
        /// Wallet id.
        wallet: String,
        /// Current balance.
        balance: u64,
        /// Requested amount.
        amount: u64,
    },

    /// The deposit would push the balance past `u64::MAX`.
    #[error("wallet '{wallet}' cannot hold balance {balance} plus {amount}")]
    BalanceOverflow {
        /// Wallet id.
        wallet: String,
        /// Current balance.
        balance: u64,
        /// Requested amount.
        amount: u64,
    },

    /// The service is configured to reject calls.
    #[error("wallet service unavailable")]
    Unavailable,
}

/// One wallet: a balance plus the ids of recently applied commands.
#[derive(Debug, Clone, Default)]
pub struct Wallet {
    balance: u64,
    processed: VecDeque<String>,
}

impl Wallet {
    /// A wallet with an opening balance.
    pub fn with_balance(balance: u64) -> Self {
        Self {
            balance,
            processed: VecDeque::new(),
        }
    }

    /// Current balance.
    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Returns true if the command id was already applied.
    pub fn has_processed(&self, command_id: &str) -> bool {
        self.processed.iter().any(|id| id == command_id)
    }

    fn remember(&mut self, command_id: &str) {
        if self.processed.len() == MAX_PROCESSED_COMMANDS {
            self.processed.pop_front();
        }
        self.processed.push_back(command_id.to_string());
    }

    /// Debit the wallet unless the command was already applied.
    pub fn withdraw(
        &mut self,
        wallet: &str,
        command_id: &str,
        amount: u64,
    ) -> Result<u64, WalletError> {
        if self.has_processed(command_id) {
            return Ok(self.balance);
        }
        if self.balance < amount {
            return Err(WalletError::InsufficientFunds {
                wallet: wallet.to_string(),
                balance: self.balance,
                amount,
            });
        }
        self.balance -= amount;
        self.remember(command_id);
        Ok(self.balance)
    }

    /// Credit the wallet unless the command was already applied.
    pub fn deposit(
        &mut self,
        wallet: &str,
        command_id: &str,
        amount: u64,
    ) -> Result<u64, WalletError> {
        if self.has_processed(command_id) {
            return Ok(self.balance);
        }
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| WalletError::BalanceOverflow {
                wallet: wallet.to_string(),
                balance: self.balance,
                amount,
            })?;
        self.balance = balance;
        self.remember(command_id);
        Ok(self.balance)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    wallets: HashMap<String, Wallet>,
    unavailable: bool,
}

/// Shared handle to a set of wallets with simulated call latency.
#[derive(Debug, Clone, Default)]
pub struct WalletService {
    ledger: Arc<Mutex<Ledger>>,
    latency: Duration,
}

impl WalletService {
    /// An empty service answering immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create or replace a wallet.
    pub async fn open(&self, wallet: &str, balance: u64) {
        self.ledger
            .lock()
            .await
            .wallets
            .insert(wallet.to_string(), Wallet::with_balance(balance));
    }

    /// Balance of a wallet, if it exists.
    pub async fn balance(&self, wallet: &str) -> Option<u64> {
        self.ledger
            .lock()
            .await
            .wallets
            .get(wallet)
            .map(Wallet::balance)
    }

    /// Make every following call fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.ledger.lock().await.unavailable = unavailable;
    }

    /// Debit a wallet.
    pub async fn withdraw(
        &self,
        wallet: &str,
        command_id: &str,
        amount: u64,
    ) -> Result<u64, WalletError> {
        self.delay().await;
        let mut ledger = self.ledger.lock().await;
        if ledger.unavailable {
            return Err(WalletError::Unavailable);
        }
        let entry = ledger
            .wallets
            .get_mut(wallet)
            .ok_or_else(|| WalletError::UnknownWallet(wallet.to_string()))?;
        let balance = entry.withdraw(wallet, command_id, amount)?;
        debug!(wallet, command_id, amount, balance, "Withdrawal applied");
        Ok(balance)
    }

    /// Credit a wallet.
    pub async fn deposit(
        &self,
        wallet: &str,
        command_id: &str,
        amount: u64,
    ) -> Result<u64, WalletError> {
        self.delay().await;
        let mut ledger = self.ledger.lock().await;
        if ledger.unavailable {
            return Err(WalletError::Unavailable);
        }
        let entry = ledger
            .wallets
            .get_mut(wallet)
            .ok_or_else(|| WalletError::UnknownWallet(wallet.to_string()))?;
        let balance = entry.deposit(wallet, command_id, amount)?;
        debug!(wallet, command_id, amount, balance, "Deposit applied");
        Ok(balance)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}
