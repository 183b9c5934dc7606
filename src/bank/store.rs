//! The store interface implemented by both the primary and the fallback backend.
use async_trait::async_trait;

use crate::bank::{Account, BackendResult, Client};

/// Passive holder of client and account records. No cross-record validation happens here.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn find_client_by_username(&self, username: &str) -> BackendResult<Option<Client>>;

    async fn find_account_by_id(&self, id: &str) -> BackendResult<Option<Account>>;

    /// Insert or replace the account with the same id.
    async fn save_account(&self, account: &Account) -> BackendResult<()>;

    /// Insert or replace the client with the same username.
    async fn save_client(&self, client: &Client) -> BackendResult<()>;

    /// First insertion of an account; fails with `Conflict` when the id is taken.
    async fn create_account(&self, account: &Account) -> BackendResult<()>;

    /// First insertion of a client; fails with `Conflict` when the username is taken.
    async fn create_client(&self, client: &Client) -> BackendResult<()>;
}
