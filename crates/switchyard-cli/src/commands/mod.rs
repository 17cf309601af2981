pub mod history;
pub mod rollout;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use switchyard_core::FileConfig;
use switchyard_platform::SimPlatform;
use switchyard_rollout::Orchestrator;
use switchyard_state::StateStore;

/// Shared command context: the orchestrator over an on-disk store.
///
/// The CLI drives the simulated platform; real control-plane adapters
/// plug in through the `switchyard-platform` traits.
pub struct CliContext {
    pub orchestrator: Orchestrator,
    pub store: StateStore,
}

impl CliContext {
    pub fn open(config_path: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let file = match config_path {
            Some(path) => FileConfig::from_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => FileConfig::default(),
        };
        let config = file.resolve()?;

        // Flag wins over config file; last resort is .switchyard/.
        let data_dir: PathBuf = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => file
                .store
                .as_ref()
                .and_then(|s| s.data_dir.clone())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".switchyard")),
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let store = StateStore::open(&data_dir.join("switchyard.redb"))?;

        let platform = Arc::new(SimPlatform::new());
        let orchestrator =
            Orchestrator::new(store.clone(), platform.clone(), platform, config)?;
        Ok(Self {
            orchestrator,
            store,
        })
    }
}
