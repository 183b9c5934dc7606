//! Local flat-file store used when the primary is unreachable.
//!
//! Records live in two pretty-printed JSON arrays, `clients.json` and `accounts.json`,
//! inside a data directory. Every write reads the whole collection, changes it and
//! writes it back through a temporary file that is renamed into place.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{fs, sync::Mutex};
use tracing::{debug, warn};

use crate::bank::{Account, BackendError, BackendResult, Client, LedgerStore};

pub const CLIENTS_FILE: &str = "clients.json";
pub const ACCOUNTS_FILE: &str = "accounts.json";

/// Demonstration clients served while no client records have been persisted.
pub fn seed_clients() -> Vec<Client> {
    let seed = |username: &str, chequing: Option<&str>, savings: Option<&str>| Client {
        username: username.to_string(),
        chequing: chequing.map(str::to_string),
        savings: savings.map(str::to_string),
    };
    vec![
        seed(
            "george.tsang@senecapolytechnic.ca",
            Some("1000001"),
            Some("1000002"),
        ),
        seed("john@beatles.uk", Some("1000011"), None),
        seed("paul@beatles.uk", None, Some("1000022")),
        seed("george@beatles.uk", Some("1000031"), Some("1000032")),
        seed("ringo@beatles.uk", None, None),
        seed("mick@rollingstones.uk", Some("1000051"), Some("1000052")),
    ]
}

pub struct FileStore {
    data_dir: PathBuf,
    writable: bool,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>, writable: bool) -> Self {
        FileStore {
            data_dir: data_dir.into(),
            writable,
            write_lock: Mutex::new(()),
        }
    }

    fn clients_path(&self) -> PathBuf {
        self.data_dir.join(CLIENTS_FILE)
    }

    fn accounts_path(&self) -> PathBuf {
        self.data_dir.join(ACCOUNTS_FILE)
    }

    async fn load_clients(&self) -> BackendResult<Vec<Client>> {
        match read_collection(&self.clients_path()).await? {
            Some(clients) if !clients.is_empty() => Ok(clients),
            _ => Ok(seed_clients()),
        }
    }

    async fn load_accounts(&self) -> BackendResult<Vec<Account>> {
        Ok(read_collection(&self.accounts_path())
            .await?
            .unwrap_or_default())
    }

    fn check_writable(&self, what: &str) -> BackendResult<()> {
        if self.writable {
            Ok(())
        } else {
            debug!("Skipping {what} write, fallback store is read-only");
            Err(BackendError::ReadOnly)
        }
    }

    async fn modify_accounts<F>(&self, f: F) -> BackendResult<()>
    where
        F: FnOnce(&mut Vec<Account>) -> BackendResult<()> + Send,
    {
        self.check_writable("account")?;
        let _guard = self.write_lock.lock().await;
        let mut accounts = self.load_accounts().await?;
        f(&mut accounts)?;
        self.write_collection(&self.accounts_path(), &accounts)
            .await
    }

    async fn modify_clients<F>(&self, f: F) -> BackendResult<()>
    where
        F: FnOnce(&mut Vec<Client>) -> BackendResult<()> + Send,
    {
        self.check_writable("client")?;
        let _guard = self.write_lock.lock().await;
        let mut clients = self.load_clients().await?;
        f(&mut clients)?;
        self.write_collection(&self.clients_path(), &clients).await
    }

    async fn write_collection<T: Serialize + Sync>(
        &self,
        path: &Path,
        records: &[T],
    ) -> BackendResult<()> {
        fs::create_dir_all(&self.data_dir).await?;
        let body = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, path).await.map_err(|err| {
            warn!("Failed to replace {}: {err}", path.display());
            BackendError::from(err)
        })
    }
}

/// Reads a JSON array; `None` when the file does not exist or is blank.
async fn read_collection<T: DeserializeOwned>(path: &Path) -> BackendResult<Option<Vec<T>>> {
    let body = match fs::read_to_string(path).await {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&body).map(Some).map_err(|err| {
        warn!("Malformed fallback file {}: {err}", path.display());
        BackendError::Malformed(format!("{}: {err}", path.display()))
    })
}

#[async_trait]
impl LedgerStore for FileStore {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn find_client_by_username(&self, username: &str) -> BackendResult<Option<Client>> {
        Ok(self
            .load_clients()
            .await?
            .into_iter()
            .find(|c| c.username == username))
    }

    async fn find_account_by_id(&self, id: &str) -> BackendResult<Option<Account>> {
        Ok(self
            .load_accounts()
            .await?
            .into_iter()
            .find(|a| a.id == id))
    }

    async fn save_account(&self, account: &Account) -> BackendResult<()> {
        let account = account.clone();
        self.modify_accounts(move |accounts| {
            match accounts.iter_mut().find(|a| a.id == account.id) {
                Some(existing) => *existing = account,
                None => accounts.push(account),
            }
            Ok(())
        })
        .await
    }

    async fn save_client(&self, client: &Client) -> BackendResult<()> {
        let client = client.clone();
        self.modify_clients(move |clients| {
            match clients.iter_mut().find(|c| c.username == client.username) {
                Some(existing) => *existing = client,
                None => clients.push(client),
            }
            Ok(())
        })
        .await
    }

    async fn create_account(&self, account: &Account) -> BackendResult<()> {
        let account = account.clone();
        self.modify_accounts(move |accounts| {
            if accounts.iter().any(|a| a.id == account.id) {
                return Err(BackendError::Conflict(format!("account {}", account.id)));
            }
            accounts.push(account);
            Ok(())
        })
        .await
    }

    async fn create_client(&self, client: &Client) -> BackendResult<()> {
        let client = client.clone();
        self.modify_clients(move |clients| {
            if clients.iter().any(|c| c.username == client.username) {
                return Err(BackendError::Conflict(format!("client {}", client.username)));
            }
            clients.push(client);
            Ok(())
        })
        .await
    }
}
