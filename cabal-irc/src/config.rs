use std::path::PathBuf;
use std::time::Duration;

use cabal_store::{LocalStore, StoreError, store::normalize_key};
use clap::Parser;

/// IRC gateway for a cabal chat log.
#[derive(Parser, Debug, Clone)]
#[command(name = "cabal-irc", version, about)]
pub struct GatewayConfig {
    /// Plain TCP listener address.
    #[arg(long, default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// Host name used as the prefix of server replies.
    #[arg(long, default_value = "127.0.0.1")]
    pub hostname: String,

    /// Path to the SQLite log. Defaults to ~/.cabal/archives/<key>/irc.db when
    /// --key is given, otherwise the log lives in memory.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Local writer key. cabal://, cbl:// and dat:// prefixes are accepted.
    #[arg(long)]
    pub key: Option<String>,

    /// Messages replayed per channel by a recap.
    #[arg(long, default_value = "100")]
    pub recap_limit: usize,

    /// Pause between the forced join burst and the recap, in milliseconds.
    #[arg(long, default_value = "1500")]
    pub recap_delay_ms: u64,

    /// Announce available channels after registration instead of joining
    /// the client to all of them.
    #[arg(long)]
    pub lazy_join: bool,

    /// Skip the recap that follows the forced join.
    #[arg(long)]
    pub no_recap: bool,

    /// Extra line appended to the MOTD.
    #[arg(long)]
    pub motd: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6667".to_string(),
            hostname: "127.0.0.1".to_string(),
            db_path: None,
            key: None,
            recap_limit: 100,
            recap_delay_ms: 1500,
            lazy_join: false,
            no_recap: false,
            motd: None,
        }
    }
}

impl GatewayConfig {
    pub fn recap_delay(&self) -> Duration {
        Duration::from_millis(self.recap_delay_ms)
    }

    /// Resolve where the log is stored. `None` means in memory.
    pub fn storage_path(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.db_path {
            return Some(PathBuf::from(path));
        }
        let key = self.key.as_deref()?;
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Some(
            home.join(".cabal")
                .join("archives")
                .join(normalize_key(key))
                .join("irc.db"),
        )
    }

    /// Open the log this gateway serves.
    pub fn open_store(&self) -> Result<LocalStore, StoreError> {
        let key = self.key.as_deref();
        match self.storage_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Unavailable(format!("{}: {e}", parent.display()))
                    })?;
                }
                tracing::info!("Opening log at {}", path.display());
                LocalStore::open(path, key)
            }
            None => {
                tracing::info!("Using an in-memory log");
                LocalStore::open_memory(key)
            }
        }
    }
}
