use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use futures::stream::BoxStream;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::io::AsyncWriteExt;
use tracing::{instrument, warn};

use super::{BlockService, StoredBlock};
use crate::{BlockId, Error};

/// Keeps blocks as plain files below an existing directory on a
/// POSIX-compliant filesystem.
///
/// Layout below `path`:
/// - `blocks/<hex[..2]>/<hex>`: the encoded block,
/// - `refcounts/<hex[..2]>/<hex>`: its refcount, as 8 bytes big endian,
/// - `roots/<base64url(label)>`: the hex id a label points at,
/// - `tmp/`: staging area.
///
/// Every file is staged in `tmp` and renamed into place, so readers only
/// ever see complete files. A block file without a refcount file counts as
/// refcount zero, which is what an interrupted insert or delete leaves
/// behind; garbage collection reclaims those.
#[derive(Clone)]
pub struct SimpleFsBlockService {
    path: PathBuf,
}

impl SimpleFsBlockService {
    pub async fn new(path: PathBuf) -> io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        for dir in ["tmp", "blocks", "refcounts", "roots"] {
            tokio::fs::create_dir_all(path.join(dir)).await?;
        }

        Ok(Self { path })
    }

    fn derive_path(&self, kind: &str, id: &BlockId) -> PathBuf {
        let prefix = HEXLOWER.encode(&id.as_slice()[..1]);
        self.path.join(kind).join(prefix).join(id.to_hex())
    }

    fn root_path(&self, label: &str) -> PathBuf {
        self.path
            .join("roots")
            .join(BASE64URL_NOPAD.encode(label.as_bytes()))
    }

    /// Writes `data` to a temporary file, then renames it to `dst`.
    async fn write_atomic(&self, dst: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = async_tempfile::TempFile::new_in(self.path.join("tmp"))
            .await
            .map_err(tempfile_error)?;
        file.write_all(data).await?;
        file.sync_all().await?;
        file.flush().await?;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(file.file_path(), dst).await
    }

    async fn read_refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        match read_optional(&self.derive_path("refcounts", id)).await? {
            Some(raw) => {
                let raw: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    warn!(block.id = %id, "stored refcount has the wrong length");
                    Error::StorageError(format!("invalid refcount stored for {}", id))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }
}

fn tempfile_error(e: async_tempfile::Error) -> io::Error {
    match e {
        async_tempfile::Error::Io(io_error) => io_error,
        async_tempfile::Error::InvalidFile => {
            io::Error::new(io::ErrorKind::NotFound, "invalid or missing file specified")
        }
        async_tempfile::Error::InvalidDirectory => io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing directory specified",
        ),
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_optional(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl BlockService for SimpleFsBlockService {
    #[instrument(skip_all, err, fields(block.id = %id))]
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error> {
        let Some(data) = read_optional(&self.derive_path("blocks", id)).await? else {
            return Ok(None);
        };
        let refcount = self.read_refcount(id).await?.unwrap_or(0);

        Ok(Some(StoredBlock {
            data: Bytes::from(data),
            refcount,
        }))
    }

    #[instrument(skip_all, err, fields(block.id = %id))]
    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        if let Some(refcount) = self.read_refcount(id).await? {
            return Ok(Some(refcount));
        }
        if tokio::fs::try_exists(self.derive_path("blocks", id)).await? {
            return Ok(Some(0));
        }
        Ok(None)
    }

    #[instrument(skip_all, err, fields(block.id = %id))]
    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error> {
        self.write_atomic(&self.derive_path("blocks", id), &data)
            .await?;
        self.write_atomic(
            &self.derive_path("refcounts", id),
            &refcount.to_be_bytes(),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(block.id = %id))]
    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error> {
        if !tokio::fs::try_exists(self.derive_path("blocks", id)).await? {
            return Err(Error::NotFound(format!("block {}", id)));
        }
        self.write_atomic(
            &self.derive_path("refcounts", id),
            &refcount.to_be_bytes(),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(block.id = %id))]
    async fn delete(&self, id: &BlockId) -> Result<bool, Error> {
        // refcount first, so an interruption leaves a zero-refcount block
        remove_optional(&self.derive_path("refcounts", id)).await?;
        Ok(remove_optional(&self.derive_path("blocks", id)).await?)
    }

    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>> {
        let service = self.clone();
        Box::pin(try_stream! {
            let mut shards = tokio::fs::read_dir(service.path.join("blocks")).await?;
            while let Some(shard) = shards.next_entry().await? {
                if !shard.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(shard.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let Some(id) = name.to_str().and_then(|s| s.parse::<BlockId>().ok()) else {
                        warn!(path = ?entry.path(), "skipping unexpected file");
                        continue;
                    };
                    let refcount = service.read_refcount(&id).await?.unwrap_or(0);
                    yield (id, refcount);
                }
            }
        })
    }

    #[instrument(skip(self), err)]
    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        match read_optional(&self.root_path(label)).await? {
            Some(raw) => {
                let hex = String::from_utf8(raw)
                    .map_err(|e| Error::StorageError(format!("invalid root file: {}", e)))?;
                Ok(Some(hex.trim().parse()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, id), err)]
    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error> {
        let path = self.root_path(label);
        match id {
            Some(id) => self.write_atomic(&path, id.to_hex().as_bytes()).await?,
            None => {
                remove_optional(&path).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        let mut roots = Vec::new();
        let mut entries = tokio::fs::read_dir(self.path.join("roots")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let label = name
                .to_str()
                .and_then(|s| BASE64URL_NOPAD.decode(s.as_bytes()).ok())
                .and_then(|raw| String::from_utf8(raw).ok());
            let Some(label) = label else {
                warn!(path = ?entry.path(), "skipping unexpected file");
                continue;
            };
            // raced with a concurrent removal
            if let Some(id) = self.get_root(&label).await? {
                roots.push((label, id));
            }
        }
        roots.sort();
        Ok(roots)
    }
}
