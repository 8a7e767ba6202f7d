//! Registry of dispatchers keyed by worker script path.
//!
//! Owned by the application and passed around explicitly. Asking twice for the
//! same script returns the same dispatcher; a dispatcher whose worker has
//! retired is replaced on the next request.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: DashMap<PathBuf, Dispatcher>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live dispatcher for `config.script_path`, starting one if
    /// there is none.
    ///
    /// The rest of `config` only matters when a new dispatcher is started.
    pub fn get_or_start(&self, config: DispatcherConfig) -> Result<Dispatcher, DispatchError> {
        match self.dispatchers.entry(config.script_path.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_terminated() {
                    return Ok(entry.get().clone());
                }
                tracing::info!(
                    script = %config.script_path.display(),
                    "Replacing retired dispatcher"
                );
                let dispatcher = Dispatcher::start(config)?;
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            }
            Entry::Vacant(entry) => {
                let dispatcher = Dispatcher::start(config)?;
                entry.insert(dispatcher.clone());
                Ok(dispatcher)
            }
        }
    }

    pub fn get(&self, script_path: &Path) -> Option<Dispatcher> {
        self.dispatchers.get(script_path).map(|d| d.clone())
    }

    /// Forget a dispatcher. Its worker keeps running while other handles exist.
    pub fn remove(&self, script_path: &Path) -> Option<Dispatcher> {
        self.dispatchers.remove(script_path).map(|(_, d)| d)
    }

    /// Shut down every dispatcher and empty the registry.
    pub async fn shutdown_all(&self) {
        let dispatchers: Vec<Dispatcher> = self
            .dispatchers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.dispatchers.clear();

        for dispatcher in dispatchers {
            dispatcher.shutdown().await;
        }
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}
