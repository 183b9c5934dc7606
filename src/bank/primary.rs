//! Remote document store backed by MongoDB.
use std::time::Duration;

use async_trait::async_trait;
use mongodb::{
    Collection, Database,
    bson::doc,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::ClientOptions,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bank::{
    Account, BackendError, BackendResult, Client, Connector, DisconnectNotifier, LedgerStore,
};

pub const CLIENTS_COLLECTION: &str = "clients";
pub const ACCOUNTS_COLLECTION: &str = "accounts";

const DUPLICATE_KEY: i32 = 11000;

pub struct MongoStore {
    database: Database,
    clients: Collection<Client>,
    accounts: Collection<Account>,
    notifier: Mutex<Option<DisconnectNotifier>>,
}

impl MongoStore {
    /// Builds the driver client. No network traffic happens until the first call.
    pub async fn open(uri: &str, database: &str, timeout: Duration) -> BackendResult<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|err| BackendError::Failure(format!("invalid connection string: {err}")))?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        options.app_name.get_or_insert_with(|| "web-bank".to_string());

        let client = mongodb::Client::with_options(options)
            .map_err(|err| BackendError::Failure(err.to_string()))?;
        let database = client.database(database);
        info!("Primary store configured for database {}", database.name());

        Ok(MongoStore {
            clients: database.collection(CLIENTS_COLLECTION),
            accounts: database.collection(ACCOUNTS_COLLECTION),
            database,
            notifier: Mutex::new(None),
        })
    }

    /// Maps a driver error and reports transport failures to the connection monitor.
    fn convert(&self, err: MongoError) -> BackendError {
        let converted = classify(&err);
        if converted.is_transport() {
            if let Some(notifier) = self.notifier.lock().as_ref() {
                notifier.notify(&err.to_string());
            }
        }
        converted
    }
}

fn classify(err: &MongoError) -> BackendError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => {
            BackendError::Unreachable(err.to_string())
        }
        ErrorKind::BsonDeserialization(_) | ErrorKind::BsonSerialization(_) => {
            BackendError::Malformed(err.to_string())
        }
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
            BackendError::Conflict(write.message.clone())
        }
        _ => BackendError::Failure(err.to_string()),
    }
}

#[async_trait]
impl Connector for MongoStore {
    async fn connect(&self, notifier: DisconnectNotifier) -> BackendResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|err| classify(&err))?;
        *self.notifier.lock() = Some(notifier);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MongoStore {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn find_client_by_username(&self, username: &str) -> BackendResult<Option<Client>> {
        self.clients
            .find_one(doc! { "username": username })
            .await
            .map_err(|err| self.convert(err))
    }

    async fn find_account_by_id(&self, id: &str) -> BackendResult<Option<Account>> {
        self.accounts
            .find_one(doc! { "id": id })
            .await
            .map_err(|err| self.convert(err))
    }

    async fn save_account(&self, account: &Account) -> BackendResult<()> {
        let result = self
            .accounts
            .replace_one(doc! { "id": account.id.as_str() }, account)
            .upsert(true)
            .await
            .map_err(|err| self.convert(err))?;
        debug!(
            "Saved account {} (matched {}, upserted {})",
            account.id,
            result.matched_count,
            result.upserted_id.is_some()
        );
        Ok(())
    }

    async fn save_client(&self, client: &Client) -> BackendResult<()> {
        self.clients
            .replace_one(doc! { "username": client.username.as_str() }, client)
            .upsert(true)
            .await
            .map_err(|err| self.convert(err))?;
        Ok(())
    }

    async fn create_account(&self, account: &Account) -> BackendResult<()> {
        self.accounts
            .insert_one(account)
            .await
            .map_err(|err| self.convert(err))?;
        Ok(())
    }

    async fn create_client(&self, client: &Client) -> BackendResult<()> {
        self.clients
            .insert_one(client)
            .await
            .map_err(|err| self.convert(err))?;
        Ok(())
    }
}

/// Stand-in primary for deployments without a connection string.
/// It never connects, so every operation is served by the fallback store.
pub struct Unconfigured;

impl Unconfigured {
    fn refuse<T>() -> BackendResult<T> {
        Err(BackendError::Unreachable(
            "MongoDB URI not configured".to_string(),
        ))
    }
}

#[async_trait]
impl Connector for Unconfigured {
    async fn connect(&self, _notifier: DisconnectNotifier) -> BackendResult<()> {
        Self::refuse()
    }
}

#[async_trait]
impl LedgerStore for Unconfigured {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn find_client_by_username(&self, _username: &str) -> BackendResult<Option<Client>> {
        Self::refuse()
    }

    async fn find_account_by_id(&self, _id: &str) -> BackendResult<Option<Account>> {
        Self::refuse()
    }

    async fn save_account(&self, _account: &Account) -> BackendResult<()> {
        Self::refuse()
    }

    async fn save_client(&self, _client: &Client) -> BackendResult<()> {
        Self::refuse()
    }

    async fn create_account(&self, _account: &Account) -> BackendResult<()> {
        Self::refuse()
    }

    async fn create_client(&self, _client: &Client) -> BackendResult<()> {
        Self::refuse()
    }
}
