//! `recreate` command
use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use log::{debug, info, warn};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::{
    block::{BlockId, VolumeId, VolumeLocation},
    codec::BlockCodec,
    crypto::{hasher::hash, CryptoKey},
    error::{ConfigErrorKind, MetaErrorKind, VaultErrorKind},
    index::{
        catalog::{VolumeRecord, VolumeState},
        dedup::DedupEntry,
    },
    repofile::{
        indexfile::IndexVolume,
        metafile::{self, MetaKind},
        ConfigFile, Fileset, VolumeFile,
    },
    store::RepositorySnapshot,
    transport::Transport,
    VaultResult,
};

/// An object of the transport, as far as it could be read
enum Object {
    Config(ConfigFile),
    Fileset(VolumeId, Fileset),
    Volume(IndexVolume),
}

fn read_object<C: CryptoKey>(
    codec: &BlockCodec<C>,
    id: VolumeId,
    data: Bytes,
) -> VaultResult<Option<Object>> {
    if metafile::is_meta(&data) {
        return Ok(Some(match metafile::read_kind(&data)? {
            MetaKind::Config => Object::Config(metafile::decode_file(codec, &data)?),
            MetaKind::Fileset => Object::Fileset(id, metafile::decode_file(codec, &data)?),
        }));
    }

    if VolumeId::from(hash(&data)) != id {
        warn!("object {id} does not match its id, ignoring it");
        return Ok(None);
    }
    let size = u32::try_from(data.len()).ok();
    match VolumeFile::from_bytes(data) {
        Ok(volume) => Ok(Some(Object::Volume(IndexVolume {
            id,
            blocks: volume.blocks().to_vec(),
            time: None,
            size,
        }))),
        Err(err) => {
            warn!("object {id} is no readable volume, ignoring it: {err}");
            Ok(None)
        }
    }
}

/// Reads every object of the transport and rebuilds the repository state from it.
///
/// Blocks are indexed from the manifests of the volumes. A block stored in more than
/// one volume is indexed at the volume with the smallest id. Reference counts are the
/// number of filesets using a block.
///
/// # Errors
///
/// * [`MetaErrorKind::DownloadFailed`] - If an object could not be fetched
/// * [`MetaErrorKind::NoConfigFound`] - If no object holds a repository config
/// * [`MetaErrorKind::ConflictingConfigs`] - If different configs are found
/// * [`MetaErrorKind::BlockNotFound`] - If a fileset uses a block no volume holds
/// * [`ConfigErrorKind::EncryptionMismatch`] - If `key` does not match the repository cipher
/// * If a metadata object could not be decoded, e.g. because of a wrong key
pub(crate) fn recreate<C: CryptoKey>(
    transport: &dyn Transport,
    key: C,
) -> VaultResult<RepositorySnapshot> {
    let mut ids: Vec<VolumeId> = transport
        .list()
        .map_err(VaultErrorKind::Transport)?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    ids.sort_unstable();
    let count = ids.len();
    debug!("reading {count} objects from {}", transport.location());

    let codec = BlockCodec::new(key, None);
    let objects = ids
        .into_par_iter()
        .map(|id| {
            let data = transport
                .download(&id)
                .map_err(|error| MetaErrorKind::DownloadFailed { id, error })?;
            read_object(&codec, id, data)
        })
        .collect::<VaultResult<Vec<_>>>()?;

    let mut configs = Vec::new();
    let mut filesets = Vec::new();
    let mut fileset_objects = BTreeMap::new();
    let mut volumes = Vec::new();
    for object in objects.into_iter().flatten() {
        match object {
            Object::Config(config) => {
                if !configs.contains(&config) {
                    configs.push(config);
                }
            }
            Object::Fileset(id, fileset) => {
                if let Some(other) = fileset_objects.insert(fileset.version, id) {
                    warn!(
                        "fileset {} is stored twice, ignoring object {other}",
                        fileset.version
                    );
                    filesets.retain(|known: &Fileset| known.version != fileset.version);
                }
                filesets.push(fileset);
            }
            Object::Volume(volume) => volumes.push(volume),
        }
    }

    let config = match configs.len() {
        0 => return Err(MetaErrorKind::NoConfigFound(count).into()),
        1 => configs.remove(0),
        n => return Err(MetaErrorKind::ConflictingConfigs(n).into()),
    };
    config.validate()?;
    if config.encryption != C::KIND {
        return Err(ConfigErrorKind::EncryptionMismatch {
            expected: config.encryption.to_string(),
            given: C::KIND.to_string(),
        }
        .into());
    }

    let mut locations: HashMap<BlockId, VolumeLocation> = HashMap::new();
    for volume in &volumes {
        for block in &volume.blocks {
            _ = locations
                .entry(block.id)
                .or_insert_with(|| VolumeLocation::new(volume.id, block));
        }
    }

    let mut refcounts: HashMap<BlockId, u64> = HashMap::new();
    for fileset in &filesets {
        for id in fileset.distinct_blocks() {
            if !locations.contains_key(&id) {
                return Err(MetaErrorKind::BlockNotFound {
                    version: fileset.version,
                    id,
                }
                .into());
            }
            *refcounts.entry(id).or_default() += 1;
        }
    }

    let blocks = locations
        .into_iter()
        .map(|(id, location)| DedupEntry {
            id,
            location,
            refcount: refcounts.get(&id).copied().unwrap_or_default(),
        })
        .collect();
    let last_version = filesets
        .iter()
        .map(|fileset| fileset.version.0)
        .max()
        .unwrap_or_default();
    info!(
        "recreated repository {}: {} volumes, {} filesets",
        config.id,
        volumes.len(),
        filesets.len()
    );

    Ok(RepositorySnapshot {
        config,
        blocks,
        volumes: volumes
            .into_iter()
            .map(|volume| VolumeRecord {
                state: VolumeState::Uploaded,
                volume,
            })
            .collect(),
        filesets,
        last_version,
        fileset_objects,
    })
}
