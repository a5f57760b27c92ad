/*!
Transports for blockvault repositories.

# Overview

A [`blockvault_core::Transport`] stores the sealed volumes of a repository.
This crate provides [`LocalBackend`], which keeps them in a local directory,
e.g. a mounted network share or an external disk.

# Example

```rust
    use std::sync::Arc;

    use blockvault_backend::LocalBackend;
    use blockvault_core::{ConfigOptions, LocalStore, NoEncryption, Repository};

    let dir = tempfile::tempdir().unwrap();
    let transport = LocalBackend::new(dir.path().join("volumes")).unwrap();
    let store = LocalStore::new(dir.path().join("index.json"));

    let repo = Repository::init(
        Arc::new(transport),
        Arc::new(store),
        NoEncryption,
        &ConfigOptions::default(),
    )
    .unwrap();
    assert!(repo.list_versions().is_empty());
```
*/

pub mod error;
pub mod local;

// blockvault_backend Public API
pub use crate::local::LocalBackend;
