use std::sync::Arc;
use url::Url;

use crate::{blockstore::StoreOptions, Error};

use super::{
    BlockService, MemoryBlockService, RedbBlockService, SimpleFsBlockService, SledBlockService,
};

/// Constructs a new instance of a [BlockService] from an URI, together with
/// the store options carried in its query string.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryBlockService])
/// - `sled://` ([SledBlockService]), in memory only without a path
/// - `redb://` ([RedbBlockService]), in memory only without a path
/// - `simplefs:///path` ([SimpleFsBlockService])
///
/// Options are described in [StoreOptions], for example
/// `sled:///var/lib/tfhfs?compress=false&shared=true`.
pub async fn from_addr(uri: &str) -> Result<(Arc<dyn BlockService>, StoreOptions), Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let options: StoreOptions = match url.query() {
        Some(query) => serde_qs::from_str(query)
            .map_err(|e| Error::InvalidRequest(format!("invalid store options: {}", e)))?,
        None => StoreOptions::default(),
    };

    let block_service: Arc<dyn BlockService> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Arc::new(MemoryBlockService::default())
        }
        "sled" => {
            if url.has_host() {
                return Err(Error::InvalidRequest("no host allowed".to_string()));
            }

            if url.path() == "/" {
                return Err(Error::InvalidRequest(
                    "cowardly refusing to open / with sled".to_string(),
                ));
            }

            Arc::new(if url.path().is_empty() {
                SledBlockService::new_temporary()?
            } else {
                SledBlockService::new(url.path())?
            })
        }
        "redb" => {
            if url.has_host() {
                return Err(Error::InvalidRequest("no host allowed".to_string()));
            }

            Arc::new(if url.path().is_empty() {
                RedbBlockService::new_temporary()?
            } else {
                RedbBlockService::new(url.path().into()).await?
            })
        }
        "simplefs" => {
            if url.has_host() {
                return Err(Error::InvalidRequest("no host allowed".to_string()));
            }
            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::InvalidRequest(
                    "simplefs needs a directory to live in".to_string(),
                ));
            }

            Arc::new(SimpleFsBlockService::new(url.path().into()).await?)
        }
        scheme => {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok((block_service, options))
}

#[cfg(test)]
mod tests {
    use super::from_addr;
    use lazy_static::lazy_static;
    use rstest::rstest;
    use tempfile::TempDir;

    lazy_static! {
        static ref TMPDIR_SLED_1: TempDir = TempDir::new().unwrap();
        static ref TMPDIR_REDB_1: TempDir = TempDir::new().unwrap();
        static ref TMPDIR_SIMPLEFS_1: TempDir = TempDir::new().unwrap();
    }

    #[rstest]
    /// This uses an unsupported scheme.
    #[case::unsupported_scheme("http://foo.example/test", false)]
    /// This configures sled in temporary mode.
    #[case::sled_temporary("sled://", true)]
    /// This configures sled with /, which should fail.
    #[case::sled_invalid_root("sled:///", false)]
    /// This configures sled with a host, not path, which should fail.
    #[case::sled_invalid_host("sled://foo.example", false)]
    /// This configures sled with a valid path, which should succeed.
    #[case::sled_valid_path(&format!("sled://{}", &TMPDIR_SLED_1.path().to_str().unwrap()), true)]
    /// This configures redb in temporary mode.
    #[case::redb_temporary("redb://", true)]
    /// This configures redb with a valid path, which should succeed.
    #[case::redb_valid_path(&format!("redb://{}", &TMPDIR_REDB_1.path().join("db").to_str().unwrap()), true)]
    /// This configures a memory store, which should succeed.
    #[case::memory("memory://", true)]
    /// This configures a memory store, with a host, which should fail.
    #[case::memory_invalid_host("memory://foo.example", false)]
    /// simplefs always needs a path.
    #[case::simplefs_no_path("simplefs://", false)]
    #[case::simplefs_valid_path(&format!("simplefs://{}", &TMPDIR_SIMPLEFS_1.path().to_str().unwrap()), true)]
    /// Options are parsed from the query string.
    #[case::memory_with_options("memory://?compress=false&shared=true&cache_size=8", true)]
    /// Unknown options are rejected.
    #[case::memory_unknown_option("memory://?colour=blue", false)]
    #[tokio::test]
    async fn test_from_addr_tokio(#[case] uri_str: &str, #[case] exp_succeed: bool) {
        if exp_succeed {
            from_addr(uri_str).await.expect("should succeed");
        } else {
            assert!(from_addr(uri_str).await.is_err(), "should fail");
        }
    }

    #[tokio::test]
    async fn options_from_query() {
        let (_, options) = from_addr("memory://?compress=false&shared=true&pad_to=4096")
            .await
            .expect("should succeed");
        assert!(!options.compress);
        assert!(options.shared);
        assert_eq!(Some(4096), options.pad_to);
        assert_eq!(100_000, options.pbkdf2_iterations);
    }
}
