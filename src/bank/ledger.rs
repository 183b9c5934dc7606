//! The ledger service: account lookup and balance changes over the primary store,
//! falling back to the local store whenever the primary is unreachable or fails.
//!
//! Writes to the same account (or openings for the same user) are serialized inside
//! the process. Two processes sharing a backend can still interleave their
//! read-modify-write cycles; neither store carries a version to detect that.
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bank::{
    Account, AccountId, AccountType, BackendError, BackendResult, Client, Config,
    ConnectionMonitor, Direction, FileStore, LedgerError, LedgerStore, Money, MongoStore,
    Unconfigured, money_from_f64,
};

/// Default bound on a single backend call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Generated account ids fall in `ACCOUNT_ID_MIN..ACCOUNT_ID_MAX`.
pub const ACCOUNT_ID_MIN: u32 = 1_000_000;
pub const ACCOUNT_ID_MAX: u32 = 1_900_000;

/// Number of candidates tried before an id is used without a uniqueness check.
const MAX_ID_ATTEMPTS: usize = 5;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Source of candidate account ids.
pub trait AccountIdSource: Send + Sync {
    fn next_id(&self) -> AccountId;
}

/// Uniformly random seven digit ids. Not cryptographically random.
pub struct RandomAccountIds;

impl AccountIdSource for RandomAccountIds {
    fn next_id(&self) -> AccountId {
        rand::thread_rng()
            .gen_range(ACCOUNT_ID_MIN..ACCOUNT_ID_MAX)
            .to_string()
    }
}

/// Result of opening an account.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedAccount {
    pub account_id: AccountId,
    pub balance: Money,
}

/// Which account types a user holds, as shown on the open-account page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountOptions {
    pub has_chequing: bool,
    pub has_savings: bool,
}

impl AccountOptions {
    pub fn can_open(&self, account_type: AccountType) -> bool {
        match account_type {
            AccountType::Chequing => !self.has_chequing,
            AccountType::Savings => !self.has_savings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Primary,
    Fallback,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Primary => f.write_str("primary"),
            Backend::Fallback => f.write_str("fallback"),
        }
    }
}

/// Outcome of running one operation against one backend.
enum Attempt<T> {
    Done(T),
    /// The backend answered but does not hold the record.
    NotFound,
    /// A ledger rule rejected the operation; no other backend is tried.
    Rejected(LedgerError),
    Failed(BackendError),
}

/// Per-key async locks. Idle entries are dropped on the next acquisition.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct LedgerService {
    monitor: ConnectionMonitor,
    primary: Arc<dyn LedgerStore>,
    fallback: Arc<dyn LedgerStore>,
    ids: Arc<dyn AccountIdSource>,
    call_timeout: Duration,
    account_locks: KeyedLocks,
    client_locks: KeyedLocks,
}

impl LedgerService {
    pub fn new(
        monitor: ConnectionMonitor,
        primary: Arc<dyn LedgerStore>,
        fallback: Arc<dyn LedgerStore>,
    ) -> Self {
        LedgerService {
            monitor,
            primary,
            fallback,
            ids: Arc::new(RandomAccountIds),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            account_locks: KeyedLocks::default(),
            client_locks: KeyedLocks::default(),
        }
    }

    /// Wires the MongoDB primary (or the unconfigured stand-in) and the file fallback
    /// described by `config`. The primary is not contacted until the first operation.
    pub async fn from_config(config: &Config) -> Self {
        let fallback = Arc::new(FileStore::new(&config.data_dir, config.fallback_writable));
        let primary = match &config.primary_uri {
            Some(uri) => {
                match MongoStore::open(uri, &config.database, config.call_timeout).await {
                    Ok(store) => Some(Arc::new(store)),
                    Err(err) => {
                        warn!("Primary store disabled: {err}");
                        None
                    }
                }
            }
            None => None,
        };

        let service = match primary {
            Some(store) => LedgerService::new(
                ConnectionMonitor::new(store.clone()),
                store,
                fallback,
            ),
            None => LedgerService::new(
                ConnectionMonitor::new(Arc::new(Unconfigured)),
                Arc::new(Unconfigured),
                fallback,
            ),
        };
        service.with_call_timeout(config.call_timeout)
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_id_source(mut self, ids: Arc<dyn AccountIdSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    fn store(&self, backend: Backend) -> &dyn LedgerStore {
        match backend {
            Backend::Primary => self.primary.as_ref(),
            Backend::Fallback => self.fallback.as_ref(),
        }
    }

    /// Runs one backend call under the timeout. Transport failures of the primary
    /// mark it disconnected.
    async fn call<T>(
        &self,
        backend: Backend,
        call: impl Future<Output = BackendResult<T>>,
    ) -> BackendResult<T> {
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.call_timeout)),
        };
        if let Err(err) = &result {
            debug!("{} store call failed: {err}", self.store(backend).name());
            if backend == Backend::Primary && err.is_transport() {
                self.monitor.mark_disconnected(&err.to_string());
            }
        }
        result
    }

    fn unavailable(&self) -> LedgerError {
        LedgerError::OperationUnavailable {
            primary_reachable: self.monitor.is_connected(),
        }
    }

    /// Accounts held by `username`, Chequing first. Unknown users hold none.
    pub async fn get_user_accounts(&self, username: &str) -> LedgerResult<Vec<Account>> {
        if self.monitor.ensure_connected().await {
            match self.resolve_accounts(Backend::Primary, username).await {
                Attempt::Done(accounts) => return Ok(accounts),
                Attempt::NotFound => {
                    debug!("Client {username} not in primary store, checking fallback")
                }
                Attempt::Failed(err) => {
                    warn!("Primary lookup for {username} failed, using fallback: {err}")
                }
                Attempt::Rejected(err) => return Err(err),
            }
        }

        match self.resolve_accounts(Backend::Fallback, username).await {
            Attempt::Done(accounts) => Ok(accounts),
            Attempt::NotFound => Ok(Vec::new()),
            Attempt::Rejected(err) => Err(err),
            Attempt::Failed(err) => {
                warn!("Fallback lookup for {username} failed: {err}");
                Err(self.unavailable())
            }
        }
    }

    async fn resolve_accounts(&self, backend: Backend, username: &str) -> Attempt<Vec<Account>> {
        let store = self.store(backend);
        let client = match self
            .call(backend, store.find_client_by_username(username))
            .await
        {
            Ok(Some(client)) => client,
            Ok(None) => return Attempt::NotFound,
            Err(err) => return Attempt::Failed(err),
        };

        let mut accounts = Vec::with_capacity(2);
        for (account_type, id) in client.account_refs() {
            match self.call(backend, store.find_account_by_id(id)).await {
                Ok(Some(account)) if account.account_type == account_type => accounts.push(account),
                Ok(Some(account)) => warn!(
                    "{backend} store: {username} references {id} as {account_type} but it is {}",
                    account.account_type
                ),
                Ok(None) => debug!("{backend} store: {username} references missing account {id}"),
                Err(err) => return Attempt::Failed(err),
            }
        }
        Attempt::Done(accounts)
    }

    /// The user's account with the given id.
    pub async fn account_balance(&self, username: &str, account_id: &str) -> LedgerResult<Account> {
        self.get_user_accounts(username)
            .await?
            .into_iter()
            .find(|a| a.id == account_id)
            .ok_or(LedgerError::AccountNotFound)
    }

    pub async fn account_options(&self, username: &str) -> LedgerResult<AccountOptions> {
        let accounts = self.get_user_accounts(username).await?;
        Ok(AccountOptions {
            has_chequing: accounts
                .iter()
                .any(|a| a.account_type == AccountType::Chequing),
            has_savings: accounts
                .iter()
                .any(|a| a.account_type == AccountType::Savings),
        })
    }

    pub async fn deposit(&self, account_id: &str, amount: f64) -> LedgerResult<Money> {
        self.mutate_balance(account_id, amount, Direction::Deposit)
            .await
    }

    pub async fn withdraw(&self, account_id: &str, amount: f64) -> LedgerResult<Money> {
        self.mutate_balance(account_id, amount, Direction::Withdraw)
            .await
    }

    /// Applies `amount` to the account and returns its new balance.
    pub async fn mutate_balance(
        &self,
        account_id: &str,
        amount: f64,
        direction: Direction,
    ) -> LedgerResult<Money> {
        let amount = validate_amount(amount)?;
        let _guard = self.account_locks.lock(account_id).await;

        self.monitor.ensure_connected().await;
        let mut missing_from_primary = false;
        if self.monitor.is_connected() {
            match self
                .mutate_in(Backend::Primary, account_id, amount, direction)
                .await
            {
                Attempt::Done(balance) => {
                    info!("{direction:?} on {account_id} applied to primary store");
                    return Ok(balance);
                }
                Attempt::Rejected(err) => return Err(err),
                Attempt::NotFound => {
                    missing_from_primary = true;
                    info!("Account {account_id} not found in primary store");
                }
                Attempt::Failed(err) => {
                    warn!("Primary update of {account_id} failed, trying fallback: {err}")
                }
            }
        } else {
            info!("Primary store not connected, using fallback for {account_id}");
        }

        match self
            .mutate_in(Backend::Fallback, account_id, amount, direction)
            .await
        {
            Attempt::Done(balance) => {
                info!("{direction:?} on {account_id} applied to fallback store");
                Ok(balance)
            }
            Attempt::Rejected(err) => Err(err),
            Attempt::NotFound if missing_from_primary => Err(LedgerError::AccountNotFound),
            Attempt::NotFound => {
                warn!("Account {account_id} not found in fallback store");
                Err(self.unavailable())
            }
            Attempt::Failed(err) => {
                warn!("Fallback update of {account_id} failed: {err}");
                Err(self.unavailable())
            }
        }
    }

    async fn mutate_in(
        &self,
        backend: Backend,
        account_id: &str,
        amount: Money,
        direction: Direction,
    ) -> Attempt<Money> {
        let store = self.store(backend);
        let mut account = match self.call(backend, store.find_account_by_id(account_id)).await {
            Ok(Some(account)) => account,
            Ok(None) => return Attempt::NotFound,
            Err(err) => return Attempt::Failed(err),
        };
        let balance = match account.apply(amount, direction) {
            Ok(balance) => balance,
            Err(err) => return Attempt::Rejected(err),
        };
        match self.call(backend, store.save_account(&account)).await {
            Ok(()) => Attempt::Done(balance),
            Err(err) => Attempt::Failed(err),
        }
    }

    /// Opens an account of `account_type` for `username`, creating the client on first use.
    pub async fn open_account(
        &self,
        username: &str,
        account_type: &str,
        initial_deposit: f64,
    ) -> LedgerResult<OpenedAccount> {
        let account_type: AccountType = account_type.parse()?;
        let balance = validate_opening_deposit(initial_deposit)?;
        let _guard = self.client_locks.lock(username).await;

        let existing = self.get_user_accounts(username).await?;
        if existing.iter().any(|a| a.account_type == account_type) {
            return Err(LedgerError::DuplicateAccountType(account_type));
        }

        let account = Account::new(self.fresh_account_id().await, account_type, balance);
        let opened = OpenedAccount {
            account_id: account.id.clone(),
            balance,
        };

        if self.monitor.is_connected() {
            match self.open_in(Backend::Primary, username, &account).await {
                Ok(()) => {
                    info!("Opened {account_type} account {} for {username}", account.id);
                    return Ok(opened);
                }
                Err(err) => warn!("Primary insert failed, using fallback: {err}"),
            }
        }

        match self.open_in(Backend::Fallback, username, &account).await {
            Ok(()) => {
                info!(
                    "Opened {account_type} account {} for {username} in fallback store",
                    account.id
                );
                Ok(opened)
            }
            Err(err) => {
                warn!("Fallback insert failed: {err}");
                Err(self.unavailable())
            }
        }
    }

    async fn open_in(
        &self,
        backend: Backend,
        username: &str,
        account: &Account,
    ) -> BackendResult<()> {
        let store = self.store(backend);
        self.call(backend, store.create_account(account)).await?;
        match self
            .call(backend, store.find_client_by_username(username))
            .await?
        {
            Some(mut client) => {
                client.link(account.account_type, account.id.clone());
                self.call(backend, store.save_client(&client)).await
            }
            None => {
                let mut client = Client::new(username);
                client.link(account.account_type, account.id.clone());
                self.call(backend, store.create_client(&client)).await
            }
        }
    }

    /// Draws ids until one is unknown to every reachable backend, up to `MAX_ID_ATTEMPTS`.
    async fn fresh_account_id(&self) -> AccountId {
        let mut candidate = self.ids.next_id();
        for _ in 1..MAX_ID_ATTEMPTS {
            if !self.account_id_taken(&candidate).await {
                return candidate;
            }
            debug!("Account id {candidate} already in use, drawing another");
            candidate = self.ids.next_id();
        }
        candidate
    }

    async fn account_id_taken(&self, id: &str) -> bool {
        let mut backends = vec![Backend::Fallback];
        if self.monitor.is_connected() {
            backends.insert(0, Backend::Primary);
        }
        for backend in backends {
            let store = self.store(backend);
            if let Ok(Some(_)) = self.call(backend, store.find_account_by_id(id)).await {
                return true;
            }
        }
        false
    }
}

/// A mutation amount must be finite and positive.
fn validate_amount(amount: f64) -> LedgerResult<Money> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::InvalidAmount);
    }
    match money_from_f64(amount) {
        Some(amount) if amount > Money::ZERO => Ok(amount),
        None if amount > 1.0 => Err(LedgerError::AmountTooLarge),
        // Below the smallest decimal step.
        _ => Err(LedgerError::InvalidAmount),
    }
}

fn validate_opening_deposit(amount: f64) -> LedgerResult<Money> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(LedgerError::InvalidAmount);
    }
    match money_from_f64(amount) {
        Some(amount) if amount >= Money::ZERO => Ok(amount),
        None if amount > 1.0 => Err(LedgerError::AmountTooLarge),
        _ => Err(LedgerError::InvalidAmount),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    use super::*;
    use crate::bank::{
        ACCOUNTS_FILE, BackendError, ConnectionState, FileStore, connection::tests::FakeConnector,
        format_money,
    };

    /// In-memory store with switches for failing or hanging calls.
    struct MemoryStore {
        name: &'static str,
        clients: Mutex<HashMap<String, Client>>,
        accounts: Mutex<HashMap<String, Account>>,
        failing: AtomicBool,
        /// Fails client writes only.
        failing_clients: AtomicBool,
        hanging: AtomicBool,
        calls: AtomicUsize,
    }

    impl MemoryStore {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(MemoryStore {
                name,
                clients: Mutex::new(HashMap::new()),
                accounts: Mutex::new(HashMap::new()),
                failing: AtomicBool::new(false),
                failing_clients: AtomicBool::new(false),
                hanging: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        fn insert_account(&self, account: Account) {
            self.accounts.lock().insert(account.id.clone(), account);
        }

        fn insert_client(&self, client: Client) {
            self.clients.lock().insert(client.username.clone(), client);
        }

        fn balance(&self, id: &str) -> Option<Money> {
            self.accounts.lock().get(id).map(|a| a.balance)
        }

        async fn enter(&self) -> BackendResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hanging.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::Failure("write concern error".into()));
            }
            Ok(())
        }

        async fn enter_client_write(&self) -> BackendResult<()> {
            self.enter().await?;
            if self.failing_clients.load(Ordering::SeqCst) {
                return Err(BackendError::Failure("client write rejected".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LedgerStore for MemoryStore {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn find_client_by_username(&self, username: &str) -> BackendResult<Option<Client>> {
            self.enter().await?;
            Ok(self.clients.lock().get(username).cloned())
        }

        async fn find_account_by_id(&self, id: &str) -> BackendResult<Option<Account>> {
            self.enter().await?;
            Ok(self.accounts.lock().get(id).cloned())
        }

        async fn save_account(&self, account: &Account) -> BackendResult<()> {
            self.enter().await?;
            self.insert_account(account.clone());
            Ok(())
        }

        async fn save_client(&self, client: &Client) -> BackendResult<()> {
            self.enter_client_write().await?;
            self.insert_client(client.clone());
            Ok(())
        }

        async fn create_account(&self, account: &Account) -> BackendResult<()> {
            self.enter().await?;
            let mut accounts = self.accounts.lock();
            if accounts.contains_key(&account.id) {
                return Err(BackendError::Conflict(account.id.clone()));
            }
            accounts.insert(account.id.clone(), account.clone());
            Ok(())
        }

        async fn create_client(&self, client: &Client) -> BackendResult<()> {
            self.enter_client_write().await?;
            let mut clients = self.clients.lock();
            if clients.contains_key(&client.username) {
                return Err(BackendError::Conflict(client.username.clone()));
            }
            clients.insert(client.username.clone(), client.clone());
            Ok(())
        }
    }

    /// Hands out a fixed sequence of ids.
    struct SequenceIds(Mutex<Vec<&'static str>>);

    impl AccountIdSource for SequenceIds {
        fn next_id(&self) -> AccountId {
            let mut ids = self.0.lock();
            ids.remove(0).to_string()
        }
    }

    struct Fixture {
        _dir: TempDir,
        connector: Arc<FakeConnector>,
        primary: Arc<MemoryStore>,
        fallback: Arc<FileStore>,
        ledger: LedgerService,
    }

    fn demo_accounts() -> Vec<Account> {
        vec![
            Account::new("1000001", AccountType::Chequing, dec!(1250)),
            Account::new("1000002", AccountType::Savings, dec!(5000)),
            Account::new("1000011", AccountType::Chequing, dec!(320.15)),
            Account::new("1000022", AccountType::Savings, dec!(9.99)),
            Account::new("1000031", AccountType::Chequing, dec!(864.93)),
            Account::new("1000032", AccountType::Savings, dec!(783497.58)),
        ]
    }

    fn fixture(primary_up: bool, fallback_writable: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ACCOUNTS_FILE),
            serde_json::to_vec_pretty(&demo_accounts()).unwrap(),
        )
        .unwrap();

        let connector = if primary_up {
            FakeConnector::reachable()
        } else {
            FakeConnector::unreachable()
        };
        let primary = MemoryStore::new("primary");
        let fallback = Arc::new(FileStore::new(dir.path(), fallback_writable));
        let ledger = LedgerService::new(
            ConnectionMonitor::new(connector.clone()),
            primary.clone(),
            fallback.clone(),
        )
        .with_call_timeout(Duration::from_millis(100));

        Fixture {
            _dir: dir,
            connector,
            primary,
            fallback,
            ledger,
        }
    }

    async fn fallback_balance(fixture: &Fixture, id: &str) -> Money {
        fixture
            .fallback
            .find_account_by_id(id)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    #[tokio::test]
    async fn test_deposit_and_overdraw_while_disconnected() {
        let fixture = fixture(false, true);
        let ledger = &fixture.ledger;

        let accounts = ledger.get_user_accounts("george@beatles.uk").await.unwrap();
        let ids: Vec<_> = accounts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1000031", "1000032"]);

        let balance = ledger
            .mutate_balance("1000031", 100.0, Direction::Deposit)
            .await
            .unwrap();
        assert_eq!(balance, dec!(964.93));
        assert_eq!(format_money(balance), "964.93");
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(964.93));

        assert_eq!(
            ledger
                .mutate_balance("1000032", 1_000_000.0, Direction::Withdraw)
                .await,
            Err(LedgerError::InsufficientFunds)
        );
        assert_eq!(fallback_balance(&fixture, "1000032").await, dec!(783497.58));
        assert_eq!(fixture.primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_amount_touches_nothing() {
        let fixture = fixture(true, true);
        for amount in [0.0, -10.0, -0.00001, f64::NAN, f64::INFINITY] {
            assert_eq!(
                fixture.ledger.deposit("1000031", amount).await,
                Err(LedgerError::InvalidAmount)
            );
            assert_eq!(
                fixture.ledger.withdraw("1000031", amount).await,
                Err(LedgerError::InvalidAmount)
            );
        }
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.primary.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(864.93));
    }

    #[tokio::test]
    async fn test_open_first_account() {
        let fixture = fixture(false, true);
        let ledger = &fixture.ledger;
        assert!(
            ledger
                .get_user_accounts("ringo@beatles.uk")
                .await
                .unwrap()
                .is_empty()
        );

        let opened = ledger
            .open_account("ringo@beatles.uk", "Savings", 0.0)
            .await
            .unwrap();
        assert_eq!(opened.account_id.len(), 7);
        assert!(opened.account_id.chars().all(|c| c.is_ascii_digit()));
        let numeric: u32 = opened.account_id.parse().unwrap();
        assert!((ACCOUNT_ID_MIN..ACCOUNT_ID_MAX).contains(&numeric));
        assert_eq!(format_money(opened.balance), "0.00");

        let accounts = ledger.get_user_accounts("ringo@beatles.uk").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, opened.account_id);
        assert_eq!(accounts[0].account_type, AccountType::Savings);
        assert_eq!(accounts[0].balance, Money::ZERO);
    }

    #[tokio::test]
    async fn test_open_for_unknown_user_creates_client() {
        let fixture = fixture(false, true);
        let opened = fixture
            .ledger
            .open_account("brian@beatles.uk", "Chequing", 25.5)
            .await
            .unwrap();
        assert_eq!(opened.balance, dec!(25.5));
        let client = fixture
            .fallback
            .find_client_by_username("brian@beatles.uk")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.chequing, Some(opened.account_id));
        assert_eq!(client.savings, None);
    }

    #[tokio::test]
    async fn test_duplicate_account_type() {
        let fixture = fixture(false, true);
        let ledger = &fixture.ledger;
        assert_eq!(
            ledger
                .open_account("george@beatles.uk", "Chequing", 10.0)
                .await,
            Err(LedgerError::DuplicateAccountType(AccountType::Chequing))
        );
        let accounts = ledger.get_user_accounts("george@beatles.uk").await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(
            ledger.account_options("george@beatles.uk").await.unwrap(),
            AccountOptions {
                has_chequing: true,
                has_savings: true
            }
        );
    }

    #[tokio::test]
    async fn test_open_rejects_bad_input() {
        let fixture = fixture(false, true);
        assert_eq!(
            fixture
                .ledger
                .open_account("ringo@beatles.uk", "Brokerage", 0.0)
                .await,
            Err(LedgerError::InvalidAccountType)
        );
        assert_eq!(
            fixture
                .ledger
                .open_account("ringo@beatles.uk", "Savings", -1.0)
                .await,
            Err(LedgerError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn test_primary_serves_when_connected() {
        let fixture = fixture(true, true);
        fixture
            .primary
            .insert_account(Account::new("1000031", AccountType::Chequing, dec!(100)));

        assert_eq!(fixture.ledger.deposit("1000031", 50.0).await, Ok(dec!(150)));
        assert_eq!(fixture.primary.balance("1000031"), Some(dec!(150)));
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(864.93));

        assert_eq!(
            fixture.ledger.withdraw("1000031", 200.0).await,
            Err(LedgerError::InsufficientFunds)
        );
        assert_eq!(fixture.primary.balance("1000031"), Some(dec!(150)));
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(864.93));
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back() {
        let fixture = fixture(true, true);
        fixture
            .primary
            .insert_account(Account::new("1000031", AccountType::Chequing, dec!(100)));
        fixture.primary.failing.store(true, Ordering::SeqCst);

        assert_eq!(fixture.ledger.deposit("1000031", 100.0).await, Ok(dec!(964.93)));
        assert_eq!(fixture.primary.balance("1000031"), Some(dec!(100)));
        // A failed write is not a transport error.
        assert!(fixture.ledger.monitor().is_connected());
    }

    #[tokio::test]
    async fn test_hanging_primary_times_out() {
        let fixture = fixture(true, true);
        fixture.primary.hanging.store(true, Ordering::SeqCst);

        assert_eq!(fixture.ledger.deposit("1000031", 100.0).await, Ok(dec!(964.93)));
        assert_eq!(
            fixture.ledger.monitor().state(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_read_only_fallback_is_unavailable() {
        let fixture = fixture(false, false);
        assert_eq!(
            fixture.ledger.deposit("1000031", 100.0).await,
            Err(LedgerError::OperationUnavailable {
                primary_reachable: false
            })
        );
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(864.93));
        assert_eq!(
            fixture
                .ledger
                .open_account("ringo@beatles.uk", "Savings", 0.0)
                .await,
            Err(LedgerError::OperationUnavailable {
                primary_reachable: false
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let fixture = fixture(true, true);
        assert_eq!(
            fixture.ledger.deposit("9999999", 1.0).await,
            Err(LedgerError::AccountNotFound)
        );

        let offline = self::fixture(false, true);
        assert_eq!(
            offline.ledger.deposit("9999999", 1.0).await,
            Err(LedgerError::OperationUnavailable {
                primary_reachable: false
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_deposits_lose_nothing() {
        let fixture = fixture(false, true);
        let ledger = Arc::new(fixture.ledger);
        let handles: Vec<_> = (0..25)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.deposit("1000031", 1.0).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let account = fixture
            .fallback
            .find_account_by_id("1000031")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, dec!(889.93));
    }

    #[tokio::test]
    async fn test_user_accounts_from_primary() {
        let fixture = fixture(true, true);
        let mut client = Client::new("paul@beatles.uk");
        client.link(AccountType::Savings, "2000002");
        client.link(AccountType::Chequing, "2000001");
        fixture.primary.insert_client(client);
        fixture
            .primary
            .insert_account(Account::new("2000002", AccountType::Savings, dec!(0.001)));

        // The chequing reference dangles and is omitted.
        let accounts = fixture
            .ledger
            .get_user_accounts("paul@beatles.uk")
            .await
            .unwrap();
        assert_eq!(accounts, vec![Account::new("2000002", AccountType::Savings, dec!(0.001))]);

        // Primary errors abandon the primary result entirely.
        fixture.primary.failing.store(true, Ordering::SeqCst);
        let accounts = fixture
            .ledger
            .get_user_accounts("paul@beatles.uk")
            .await
            .unwrap();
        assert_eq!(accounts, vec![Account::new("1000022", AccountType::Savings, dec!(9.99))]);
    }

    #[tokio::test]
    async fn test_user_missing_from_primary_reads_fallback() {
        let fixture = fixture(true, true);
        let accounts = fixture
            .ledger
            .get_user_accounts("john@beatles.uk")
            .await
            .unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "1000011");
        assert!(
            fixture
                .ledger
                .get_user_accounts("nobody@example.com")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_open_account_in_primary_retries_taken_ids() {
        let fixture = fixture(true, true);
        let ledger = fixture
            .ledger
            .with_id_source(Arc::new(SequenceIds(Mutex::new(vec!["1000031", "1234567"]))));

        let opened = ledger
            .open_account("ringo@beatles.uk", "Chequing", 10.0)
            .await
            .unwrap();
        assert_eq!(opened.account_id, "1234567");
        assert_eq!(fixture.primary.balance("1234567"), Some(dec!(10)));
        let client = fixture.primary.clients.lock().get("ringo@beatles.uk").cloned();
        assert_eq!(client.unwrap().chequing.as_deref(), Some("1234567"));
        assert!(
            fixture
                .fallback
                .find_account_by_id("1234567")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_account_balance_requires_ownership() {
        let fixture = fixture(false, true);
        let account = fixture
            .ledger
            .account_balance("george@beatles.uk", "1000032")
            .await
            .unwrap();
        assert_eq!(format_money(account.balance), "783497.58");
        assert_eq!(
            fixture
                .ledger
                .account_balance("george@beatles.uk", "1000011")
                .await,
            Err(LedgerError::AccountNotFound)
        );
    }

    #[tokio::test]
    async fn test_deposit_keeps_exact_amount() {
        let fixture = fixture(false, true);
        assert_eq!(
            fixture.ledger.deposit("1000031", 0.123456).await,
            Ok(dec!(865.053456))
        );
        assert_eq!(
            fixture.ledger.deposit("1000031", 0.00001).await,
            Ok(dec!(865.053466))
        );
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(865.053466));
        let account = fixture
            .ledger
            .account_balance("george@beatles.uk", "1000031")
            .await
            .unwrap();
        assert_eq!(format_money(account.balance), "865.05");
    }

    #[tokio::test]
    async fn test_large_deposits_do_not_overflow() {
        let fixture = fixture(false, true);
        let first = fixture.ledger.deposit("1000031", 9.0e14).await.unwrap();
        assert_eq!(first, dec!(900000000000864.93));
        let second = fixture.ledger.deposit("1000031", 9.0e14).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_deposit_beyond_decimal_range() {
        let fixture = fixture(true, true);
        assert_eq!(
            fixture.ledger.deposit("1000031", 1.0e30).await,
            Err(LedgerError::AmountTooLarge)
        );
        assert_eq!(fixture.primary.calls.load(Ordering::SeqCst), 0);

        fixture
            .primary
            .insert_account(Account::new("1000031", AccountType::Chequing, Money::MAX));
        assert_eq!(
            fixture.ledger.deposit("1000031", 1.0).await,
            Err(LedgerError::AmountTooLarge)
        );
        assert_eq!(fixture.primary.balance("1000031"), Some(Money::MAX));
        assert_eq!(fallback_balance(&fixture, "1000031").await, dec!(864.93));
    }

    #[tokio::test]
    async fn test_open_account_falls_back_when_primary_fails() {
        let fixture = fixture(true, true);
        fixture.primary.failing.store(true, Ordering::SeqCst);
        let ledger = fixture
            .ledger
            .with_id_source(Arc::new(SequenceIds(Mutex::new(vec!["1234567"]))));

        assert_eq!(
            ledger
                .open_account("ringo@beatles.uk", "Chequing", 10.0)
                .await,
            Ok(OpenedAccount {
                account_id: "1234567".to_string(),
                balance: dec!(10),
            })
        );
        assert!(ledger.monitor().is_connected());
        assert_eq!(fixture.primary.balance("1234567"), None);
        assert_eq!(
            fixture
                .fallback
                .find_account_by_id("1234567")
                .await
                .unwrap()
                .unwrap()
                .balance,
            dec!(10)
        );
        let client = fixture
            .fallback
            .find_client_by_username("ringo@beatles.uk")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.chequing.as_deref(), Some("1234567"));
    }

    #[tokio::test]
    async fn test_open_account_after_failed_client_write() {
        let fixture = fixture(true, true);
        fixture.primary.failing_clients.store(true, Ordering::SeqCst);
        let ledger = fixture
            .ledger
            .with_id_source(Arc::new(SequenceIds(Mutex::new(vec!["1234567"]))));

        let opened = ledger
            .open_account("ringo@beatles.uk", "Savings", 5.0)
            .await
            .unwrap();
        assert_eq!(opened.account_id, "1234567");

        // The primary keeps the account without a client pointing at it.
        assert_eq!(fixture.primary.balance("1234567"), Some(dec!(5)));
        assert!(fixture.primary.clients.lock().is_empty());

        assert_eq!(
            fixture
                .fallback
                .find_account_by_id("1234567")
                .await
                .unwrap()
                .unwrap()
                .balance,
            dec!(5)
        );
        let client = fixture
            .fallback
            .find_client_by_username("ringo@beatles.uk")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.savings.as_deref(), Some("1234567"));

        let accounts = ledger.get_user_accounts("ringo@beatles.uk").await.unwrap();
        assert_eq!(
            accounts,
            vec![Account::new("1234567", AccountType::Savings, dec!(5))]
        );
    }

    #[test]
    fn test_account_options() {
        let options = AccountOptions {
            has_chequing: true,
            has_savings: false,
        };
        assert!(!options.can_open(AccountType::Chequing));
        assert!(options.can_open(AccountType::Savings));
    }
}
