//! `backup` example
use std::{error::Error, path::PathBuf, sync::Arc};

use blockvault_backend::LocalBackend;
use blockvault_core::{
    BackupOptions, ConfigOptions, IndexStore, LocalStore, NoEncryption, Repository,
};
use simplelog::{Config, LevelFilter, SimpleLogger};

fn main() -> Result<(), Box<dyn Error>> {
    // Display info logs
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());

    // Volumes go to /tmp/vault/data, the indexes to /tmp/vault/state.json
    let transport = Arc::new(LocalBackend::new("/tmp/vault")?);
    let store = Arc::new(LocalStore::new("/tmp/vault/state.json"));

    let repo = if store.load()?.is_some() {
        Repository::open(transport, store, NoEncryption)?
    } else {
        Repository::init(transport, store, NoEncryption, &ConfigOptions::default())?
    };

    let summary = repo.backup(&BackupOptions::default(), &[PathBuf::from("src")])?;
    println!("fileset {}: {:?}", summary.version, summary.summary);
    Ok(())
}
