//! Account and client records shared by every store.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::bank::{
    LedgerError,
    types::{AccountId, Money, deserialize_money, serialize_money},
};

/// The fixed set of account types a client may hold, one of each.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountType {
    Chequing,
    Savings,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Chequing => "Chequing",
            AccountType::Savings => "Savings",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Chequing" => Ok(AccountType::Chequing),
            "Savings" => Ok(AccountType::Savings),
            _ => Err(LedgerError::InvalidAccountType),
        }
    }
}

/// Direction of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Deposit,
    Withdraw,
}

/// Represents a bank account.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// The unique identifier for the account.
    pub id: AccountId,

    /// Chequing or Savings.
    #[serde(rename = "accountType")]
    pub account_type: AccountType,

    /// The current balance, never negative.
    #[serde(
        default,
        serialize_with = "serialize_money",
        deserialize_with = "deserialize_money"
    )]
    pub balance: Money,
}

impl Account {
    /// Creates a new account with the given opening balance.
    pub fn new(id: impl Into<AccountId>, account_type: AccountType, balance: Money) -> Self {
        Account {
            id: id.into(),
            account_type,
            balance,
        }
    }

    /// Deposits the specified amount into the account.
    /// Returns an error if the new balance would not fit in `Money`.
    fn deposit(&mut self, amount: Money) -> Result<(), LedgerError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::AmountTooLarge)?;
        Ok(())
    }

    /// Withdraws the specified amount from the account. Returns an error if there are insufficient funds.
    fn withdraw(&mut self, amount: Money) -> Result<(), LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        self.balance = self
            .balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientFunds)?;
        Ok(())
    }

    /// Applies a positive amount in the given direction and returns the new balance.
    /// The account is left untouched on error.
    pub fn apply(&mut self, amount: Money, direction: Direction) -> Result<Money, LedgerError> {
        if amount <= Money::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        match direction {
            Direction::Deposit => self.deposit(amount)?,
            Direction::Withdraw => self.withdraw(amount)?,
        }
        Ok(self.balance)
    }
}

/// A bank customer and the accounts they hold.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Unique login name, usually an email address.
    pub username: String,

    #[serde(default)]
    pub chequing: Option<AccountId>,

    #[serde(default)]
    pub savings: Option<AccountId>,
}

impl Client {
    /// Creates a client holding no accounts.
    pub fn new(username: impl Into<String>) -> Self {
        Client {
            username: username.into(),
            chequing: None,
            savings: None,
        }
    }

    /// Returns the account reference held for the given type, if any.
    pub fn account_ref(&self, account_type: AccountType) -> Option<&AccountId> {
        match account_type {
            AccountType::Chequing => self.chequing.as_ref(),
            AccountType::Savings => self.savings.as_ref(),
        }
    }

    /// Points the reference for the given type at `account_id`.
    pub fn link(&mut self, account_type: AccountType, account_id: impl Into<AccountId>) {
        let slot = match account_type {
            AccountType::Chequing => &mut self.chequing,
            AccountType::Savings => &mut self.savings,
        };
        *slot = Some(account_id.into());
    }

    /// References in display order, Chequing first.
    pub fn account_refs(&self) -> impl Iterator<Item = (AccountType, &AccountId)> {
        [AccountType::Chequing, AccountType::Savings]
            .into_iter()
            .filter_map(|t| self.account_ref(t).map(|id| (t, id)))
    }
}
