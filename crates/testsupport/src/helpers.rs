use std::path::Path;
use stowage_models::Config;

/// Default configuration pointed at `store_dir`, with a short grace period.
pub fn test_config(store_dir: &Path) -> Config {
    let mut config = Config::default().with_store_dir(store_dir);
    config.launcher.grace_period_secs = 2;
    config.installer.timeout_secs = 30;
    config
}
