//! The in-memory indexes of a repository.
//!
//! * [`dedup::DedupIndex`] maps block fingerprints to their stored location and reference count
//! * [`catalog::VolumeCatalog`] knows every volume referenced by the repository
//! * [`fileset::FilesetIndex`] holds the committed filesets and the active backup run

pub mod catalog;
pub mod dedup;
pub mod fileset;
