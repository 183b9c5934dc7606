//! Ledger commands read by the command driver, and the outcome rows it writes.
use serde::{Deserialize, Serialize};

use crate::bank::{
    LedgerError, Money,
    types::{AccountId, format_money},
};

/// Enum representing the type of command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// List the user's accounts.
    Accounts,
    /// Show the balance of one of the user's accounts.
    Balance,
    Deposit,
    Withdraw,
    /// Open a new account of type `kind`, funded with `amount`.
    Open,
    /// List the account types the user may still open.
    Options,
}

/// Represents one request against the ledger, as a CSV row.
#[derive(Deserialize, Debug, Clone)]
pub struct Command {
    #[serde(rename = "op")]
    command_type: CommandType,

    /// The logged-in user issuing the command.
    username: String,

    /// Target account, for balance, deposit and withdraw.
    account: Option<AccountId>,

    /// Raw amount as typed by the user.
    amount: Option<String>,

    /// Account type for `open`.
    kind: Option<String>,
}

impl Command {
    pub fn get_type(&self) -> CommandType {
        self.command_type
    }

    pub fn get_username(&self) -> &str {
        &self.username
    }

    /// The target account; blank values count as missing.
    pub fn get_account(&self) -> Option<&str> {
        self.account
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// The parsed amount. Missing or unparsable input yields NaN so the ledger rejects it.
    pub fn get_amount(&self) -> f64 {
        self.amount
            .as_deref()
            .and_then(|a| a.trim().parse().ok())
            .unwrap_or(f64::NAN)
    }

    /// The opening deposit; anything unparsable opens the account empty.
    pub fn get_initial_deposit(&self) -> f64 {
        let amount = self.get_amount();
        if amount.is_nan() { 0.0 } else { amount }
    }

    pub fn get_kind(&self) -> &str {
        self.kind.as_deref().map(str::trim).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn new(
        command_type: CommandType,
        username: &str,
        account: Option<&str>,
        amount: Option<&str>,
        kind: Option<&str>,
    ) -> Self {
        Command {
            command_type,
            username: username.to_string(),
            account: account.map(str::to_string),
            amount: amount.map(str::to_string),
            kind: kind.map(str::to_string),
        }
    }
}

fn serialize_balance<S>(balance: &Option<Money>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match balance {
        Some(balance) => serializer.serialize_str(&format_money(*balance)),
        None => serializer.serialize_none(),
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Result of one command, written as a CSV row.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Outcome {
    pub op: CommandType,
    pub username: String,
    pub account: Option<AccountId>,
    #[serde(serialize_with = "serialize_balance")]
    pub balance: Option<Money>,
    pub status: Status,
    pub message: String,
}

impl Outcome {
    pub fn success(
        command: &Command,
        account: Option<AccountId>,
        balance: Option<Money>,
        message: String,
    ) -> Self {
        Outcome {
            op: command.get_type(),
            username: command.username.clone(),
            account,
            balance,
            status: Status::Ok,
            message,
        }
    }

    pub fn failure(command: &Command, message: String) -> Self {
        Outcome {
            op: command.get_type(),
            username: command.username.clone(),
            account: command.get_account().map(str::to_string),
            balance: None,
            status: Status::Error,
            message,
        }
    }

    pub fn from_error(command: &Command, err: LedgerError) -> Self {
        Self::failure(command, err.to_string())
    }
}
