//! `restore` example
use std::{error::Error, sync::Arc};

use blockvault_backend::LocalBackend;
use blockvault_core::{LocalStore, NoEncryption, Repository, RestoreOptions};
use simplelog::{Config, LevelFilter, SimpleLogger};

fn main() -> Result<(), Box<dyn Error>> {
    // Display info logs
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());

    // Open the repository written by the `backup` example
    let repo = Repository::open(
        Arc::new(LocalBackend::new("/tmp/vault")?),
        Arc::new(LocalStore::new("/tmp/vault/state.json")),
        NoEncryption,
    )?;

    let Some(latest) = repo.latest() else {
        println!("no fileset to restore");
        return Ok(());
    };
    let summary = repo.restore(latest.version, "/tmp/restore", &RestoreOptions::default())?;
    for file in &summary.failed {
        eprintln!("{}: {}", file.path.display(), file.error);
    }
    println!(
        "restored {} files ({} bytes) of fileset {}",
        summary.restored.len(),
        summary.bytes_written,
        summary.version
    );
    Ok(())
}
