//! Accounts and account selection
//!
//! The engine only reads three things off an account: its chunk cap, whether
//! it may resume, and its connection pool.

use parking_lot::RwLock;
use std::sync::Arc;

use super::pool::DownloadPool;

/// Host pattern that matches every host
pub const ANY_HOST: &str = "*";

/// Credentials-independent view of a hoster account
#[derive(Clone, Debug)]
pub struct Account {
    /// Display name, recorded on the file while it downloads
    pub name: String,
    /// Host the account belongs to, or [`ANY_HOST`]
    pub host: String,
    /// Preference among usable accounts (higher wins)
    pub weight: u32,
    /// Chunk cap for downloads under this account
    pub max_chunks: Option<u32>,
    /// Whether downloads under this account may resume
    pub can_resume: bool,
    /// Connections this account may hold at once
    pub pool: DownloadPool,
}

impl Account {
    /// Account for `host` with `connections` parallel slots
    pub fn new(name: impl Into<String>, host: impl Into<String>, connections: usize) -> Self {
        let name = name.into();
        Self {
            pool: DownloadPool::new(format!("account:{name}"), connections),
            name,
            host: host.into(),
            weight: 0,
            max_chunks: None,
            can_resume: true,
        }
    }

    /// Set the selection weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Cap the chunks per file
    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    /// Forbid or allow resuming
    pub fn with_resume(mut self, can_resume: bool) -> Self {
        self.can_resume = can_resume;
        self
    }

    fn serves(&self, host: &str) -> bool {
        self.host == ANY_HOST || self.host.eq_ignore_ascii_case(host)
    }
}

/// Picks the account a download runs under
pub trait AccountSelector: Send + Sync {
    /// Best account for `host`, `None` if nothing can serve it
    fn select(&self, host: &str) -> Option<Account>;
}

/// Account registry with weight-based selection
///
/// Among accounts serving the host, the heaviest one with free pool capacity
/// wins. When all of them are busy the heaviest one is returned anyway and the
/// download waits on its pool.
#[derive(Clone, Debug, Default)]
pub struct AccountList {
    accounts: Arc<RwLock<Vec<Account>>>,
}

impl AccountList {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a single anonymous account for every host
    pub fn anonymous(connections: usize) -> Self {
        let list = Self::new();
        list.add(Account::new("anonymous", ANY_HOST, connections));
        list
    }

    /// Register an account, replacing one with the same name
    pub fn add(&self, account: Account) {
        let mut accounts = self.accounts.write();
        accounts.retain(|a| a.name != account.name);
        accounts.push(account);
    }

    /// Remove an account by name
    pub fn remove(&self, name: &str) -> bool {
        let mut accounts = self.accounts.write();
        let before = accounts.len();
        accounts.retain(|a| a.name != name);
        accounts.len() != before
    }

    /// Number of registered accounts
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// Whether no accounts are registered
    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }
}

impl AccountSelector for AccountList {
    fn select(&self, host: &str) -> Option<Account> {
        let accounts = self.accounts.read();
        let mut candidates: Vec<&Account> = accounts.iter().filter(|a| a.serves(host)).collect();
        // heaviest first, exact host before wildcard on ties
        candidates.sort_by_key(|a| (std::cmp::Reverse(a.weight), a.host == ANY_HOST));
        candidates
            .iter()
            .find(|a| a.pool.has_capacity())
            .or_else(|| candidates.first())
            .map(|a| (*a).clone())
    }
}
