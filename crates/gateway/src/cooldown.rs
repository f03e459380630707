//! Provider cooldown management.
//!
//! A cooldown is a time-bounded assertion that a `(provider, model?,
//! account?)` tuple must not be selected. Entries live in memory and are
//! persisted fire-and-forget after every mutation; expiry is lazy, on read.

use std::time::Duration;

use config::{CooldownReason, SharedConfig};
use dashmap::DashMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::CooldownStore;

/// Identity of a cooldown entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CooldownKey {
    /// Provider name.
    pub provider: String,
    /// Optional model scope.
    pub model: Option<String>,
    /// Optional account scope.
    pub account: Option<String>,
}

impl CooldownKey {
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            account: None,
        }
    }
}

/// An active (or expired-but-not-yet-evicted) cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub reason: CooldownReason,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Upstream-requested wait, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl CooldownEntry {
    fn key(&self) -> CooldownKey {
        CooldownKey {
            provider: self.provider.clone(),
            model: self.model.clone(),
            account: self.account.clone(),
        }
    }

    fn is_active(&self, now: Timestamp) -> bool {
        now < self.end_time
    }
}

/// Everything `set_cooldown` needs to know.
#[derive(Debug, Default)]
pub struct SetCooldown {
    pub provider: String,
    pub model: Option<String>,
    pub account: Option<String>,
    pub reason: Option<CooldownReason>,
    /// Explicit duration, overriding every other source.
    pub duration: Option<Duration>,
    pub http_status: Option<u16>,
    pub message: Option<String>,
    /// Parsed `Retry-After`, used when no explicit duration or provider
    /// override applies.
    pub retry_after: Option<Duration>,
}

/// Persisted form of the cooldown table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CooldownState {
    pub entries: Vec<CooldownEntry>,
}

/// The manager. Shared behind an `Arc`; all methods take `&self`.
pub struct CooldownManager {
    config: SharedConfig,
    entries: DashMap<CooldownKey, CooldownEntry>,
    store: Arc<dyn CooldownStore>,
}

impl CooldownManager {
    pub fn new(config: SharedConfig, store: Arc<dyn CooldownStore>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            store,
        }
    }

    /// Load persisted state once at startup. Expired entries are dropped on
    /// the way in.
    pub async fn load(&self) {
        match self.store.load().await {
            Ok(state) => {
                let now = Timestamp::now();
                let mut restored = 0usize;

                for entry in state.entries {
                    if entry.is_active(now) {
                        self.entries.insert(entry.key(), entry);
                        restored += 1;
                    }
                }

                if restored > 0 {
                    log::info!("Restored {restored} active cooldown entries");
                }
            }
            Err(e) => {
                log::warn!("Failed to load cooldown state, starting empty: {e}");
            }
        }
    }

    /// Write (or overwrite) a cooldown entry.
    ///
    /// Duration precedence: explicit duration, provider per-reason override,
    /// upstream `Retry-After`, global default for the reason. The result is
    /// always clamped into the configured bounds.
    pub fn set_cooldown(&self, request: SetCooldown) -> CooldownEntry {
        let config = self.config.get();
        let reason = request.reason.unwrap_or(CooldownReason::ServerError);

        let provider_override = config
            .providers
            .get(&request.provider)
            .and_then(|provider| provider.cooldowns.get(&reason))
            .map(|duration| duration.0);

        let duration = request
            .duration
            .or(provider_override)
            .or(request.retry_after)
            .unwrap_or_else(|| config.cooldowns.default_for(reason));

        let duration = config.cooldowns.clamp(duration);

        let now = Timestamp::now();
        let entry = CooldownEntry {
            provider: request.provider,
            model: request.model,
            account: request.account,
            reason,
            start_time: now,
            end_time: now + duration,
            http_status: request.http_status,
            message: request.message,
            retry_after: request.retry_after.map(|d| d.as_secs()),
        };

        log::info!(
            "Cooldown set: provider={provider} model={model:?} reason={reason} duration={duration:?}",
            provider = entry.provider,
            model = entry.model,
        );

        self.entries.insert(entry.key(), entry.clone());
        self.persist();

        entry
    }

    /// The active entry for a key, evicting it lazily when expired.
    pub fn get_cooldown(&self, key: &CooldownKey) -> Option<CooldownEntry> {
        let now = Timestamp::now();

        if let Some(entry) = self.entries.get(key) {
            if entry.is_active(now) {
                return Some(entry.clone());
            }
        } else {
            return None;
        }

        self.entries.remove(key);
        self.persist();
        None
    }

    /// Boolean form of `get_cooldown`.
    pub fn is_on_cooldown(&self, key: &CooldownKey) -> bool {
        self.get_cooldown(key).is_some()
    }

    /// Whether any scope matching `(provider, model, account)` is cooling
    /// down: the exact tuple, the provider+model, the provider+account, or
    /// the whole provider.
    pub fn matches(&self, provider: &str, model: &str, account: Option<&str>) -> bool {
        let mut keys = vec![
            CooldownKey {
                provider: provider.to_string(),
                model: Some(model.to_string()),
                account: account.map(str::to_string),
            },
            CooldownKey {
                provider: provider.to_string(),
                model: Some(model.to_string()),
                account: None,
            },
            CooldownKey::provider(provider),
        ];

        if let Some(account) = account {
            keys.push(CooldownKey {
                provider: provider.to_string(),
                model: None,
                account: Some(account.to_string()),
            });
        }

        keys.iter().any(|key| self.is_on_cooldown(key))
    }

    /// Remove an entry immediately.
    pub fn clear(&self, key: &CooldownKey) {
        if self.entries.remove(key).is_some() {
            self.persist();
        }
    }

    /// Remove every entry immediately.
    pub fn clear_all(&self) {
        self.entries.clear();
        self.persist();
    }

    /// All unexpired entries; expired ones are evicted as a side effect.
    pub fn active_entries(&self) -> Vec<CooldownEntry> {
        let now = Timestamp::now();
        let mut evicted = false;

        self.entries.retain(|_, entry| {
            let active = entry.is_active(now);
            evicted |= !active;
            active
        });

        if evicted {
            self.persist();
        }

        let mut entries: Vec<CooldownEntry> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by_key(|entry| entry.end_time);
        entries
    }

    /// Whole seconds until the entry expires, rounded up; 0 when absent.
    pub fn remaining_seconds(&self, key: &CooldownKey) -> u64 {
        let Some(entry) = self.get_cooldown(key) else {
            return 0;
        };

        let remaining_ms = (entry.end_time - Timestamp::now()).total(jiff::Unit::Millisecond).unwrap_or(0.0);

        if remaining_ms <= 0.0 {
            0
        } else {
            (remaining_ms / 1000.0).ceil() as u64
        }
    }

    /// Fire-and-forget persistence. The in-memory table is authoritative;
    /// a failed write is logged and the next mutation retries.
    fn persist(&self) {
        let state = CooldownState {
            entries: self.entries.iter().map(|entry| entry.value().clone()).collect(),
        };

        let store = self.store.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.save(&state).await {
                        log::error!("Failed to persist cooldown state: {e}");
                    }
                });
            }
            Err(_) => {
                log::warn!("No async runtime available, cooldown state not persisted");
            }
        }
    }
}

/// Map an upstream HTTP status to a cooldown reason. Other 4xx statuses are
/// the client's problem, not the provider's, and set no cooldown.
pub fn reason_for_status(status: u16) -> Option<CooldownReason> {
    match status {
        429 => Some(CooldownReason::RateLimit),
        401 | 403 => Some(CooldownReason::AuthError),
        408 => Some(CooldownReason::Timeout),
        500..=599 => Some(CooldownReason::ServerError),
        _ => None,
    }
}

const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "fetch failed",
    "econnrefused",
    "enotfound",
    "etimedout",
    "econnreset",
    "network",
    "connection",
];

/// Whether an error message looks like a network-layer failure.
pub fn is_connection_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CONNECTION_ERROR_MARKERS.iter().any(|marker| lowered.contains(marker))
}
