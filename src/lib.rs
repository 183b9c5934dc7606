//! Account ledger for the web bank: balance lookups, deposits, withdrawals and account
//! openings served by a remote document store, with a local file store taking over
//! whenever the remote one is unreachable.
pub mod bank;
