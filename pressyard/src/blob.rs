//! Blob store selection and the output upload.
//!
//! Outputs land under `<username>/<slug>/<relative-path>` with forward
//! slashes whatever the host separator is, so a rerender overwrites the
//! previous render of the same blog and nothing else.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use url::Url;

/// `file://<path>` or `s3://<bucket>`.
pub fn open_store(url: &Url) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| anyhow::anyhow!("invalid file URL: {url}"))?;

            std::fs::create_dir_all(&path).context("failed to create the blob output directory")?;

            let store = LocalFileSystem::new_with_prefix(&path).context("failed to open the local blob store")?;

            Ok(Arc::new(store))
        }
        "s3" => {
            let bucket = url.host_str().context("s3 URL carries no bucket name")?;

            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .context("failed to build the S3 blob store")?;

            Ok(Arc::new(store))
        }
        other => anyhow::bail!("unsupported blob output scheme: {other}"),
    }
}

pub fn blob_key(username: &str, slug: &str, relative: &Path) -> anyhow::Result<String> {
    let mut key = format!("{username}/{slug}");

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                key.push('/');
                key.push_str(part.to_str().context("output file name is not valid UTF-8")?);
            }
            other => anyhow::bail!("unexpected path component in output tree: {other:?}"),
        }
    }

    Ok(key)
}

/// Walks `root` and writes every regular file to the store. Directories
/// are skipped (object stores have no directories); anything else aborts
/// the upload.
pub async fn upload_directory(store: &dyn ObjectStore, root: &Path, username: &str, slug: &str) -> anyhow::Result<()> {
    let mut directories: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(directory) = directories.pop() {
        let mut entries = tokio::fs::read_dir(&directory)
            .await
            .with_context(|| format!("failed to list {}", directory.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to walk {}", directory.display()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed to stat {}", path.display()))?;

            if file_type.is_dir() {
                directories.push(path);
                continue;
            }

            anyhow::ensure!(file_type.is_file(), "{} is not a regular file", path.display());

            let relative = path.strip_prefix(root).context("walked outside the output tree")?;
            let key = blob_key(username, slug, relative)?;

            let contents = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;

            store
                .put(&ObjectPath::from(key.as_str()), PutPayload::from(Bytes::from(contents)))
                .await
                .with_context(|| format!("failed to upload {key}"))?;

            trace!(%key, "Uploaded output file");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_forward_slashes() {
        let relative: PathBuf = ["post", "first", "index.html"].iter().collect();

        let key = blob_key("renderer", "myblog", &relative).expect("key");

        assert_eq!(key, "renderer/myblog/post/first/index.html");
    }

    #[test]
    fn keys_reject_escaping_components() {
        let relative: PathBuf = ["..", "index.html"].iter().collect();

        assert!(blob_key("renderer", "myblog", &relative).is_err());
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let url = Url::parse("ftp://example.org/out").expect("url");

        assert!(open_store(&url).is_err());
    }

    #[tokio::test]
    async fn uploads_a_tree_to_a_local_store() {
        let source = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");

        std::fs::create_dir_all(source.path().join("post")).expect("mkdir");
        std::fs::write(source.path().join("index.html"), b"<html>home</html>").expect("write");
        std::fs::write(source.path().join("post/first.html"), b"<html>post</html>").expect("write");

        let url = Url::from_directory_path(target.path()).expect("file url");
        let store = open_store(&url).expect("store");

        upload_directory(store.as_ref(), source.path(), "renderer", "myblog")
            .await
            .expect("upload");

        let uploaded = std::fs::read(target.path().join("renderer/myblog/index.html")).expect("read");
        assert_eq!(uploaded, b"<html>home</html>");

        let uploaded = std::fs::read(target.path().join("renderer/myblog/post/first.html")).expect("read");
        assert_eq!(uploaded, b"<html>post</html>");
    }
}
