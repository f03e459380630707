//! Read-mostly shared configuration handle.

use std::sync::{Arc, RwLock};

use crate::Config;

/// The current configuration behind an atomically swappable pointer.
///
/// Readers grab an `Arc` snapshot once at the start of a request and keep
/// using it for the whole pipeline; a reload swings the pointer without
/// disturbing in-flight requests.
#[derive(Clone)]
pub struct SharedConfig {
    current: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    /// Wrap an initial configuration.
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> Arc<Config> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Replace the current configuration.
    pub fn replace(&self, config: Config) {
        let next = Arc::new(config);
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_replace() {
        let shared = SharedConfig::new(Config::default());
        let before = shared.get();

        let mut next = Config::default();
        next.storage.path = "/tmp/elsewhere".into();
        shared.replace(next);

        assert_eq!(before.storage.path, std::path::PathBuf::from("./data"));
        assert_eq!(shared.get().storage.path, std::path::PathBuf::from("/tmp/elsewhere"));
    }
}
