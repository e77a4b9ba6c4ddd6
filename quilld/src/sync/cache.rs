use std::path::{Path, PathBuf};

use thiserror::Error;

use super::record::Attachment;

#[derive(Debug, Error, PartialEq)]
pub enum CachePathError {
    #[error("attachment has neither client id nor server id")]
    NoIdentity,
    #[error("invalid blob cache key: {0}")]
    InvalidKey(String),
}

/// Stable key for an attachment's blob in the local cache. Locally
/// created attachments are keyed by client id; server-originated ones
/// that never had a client id fall back to the server id.
pub fn blob_cache_key(attachment: &Attachment) -> Result<String, CachePathError> {
    if let Some(client_id) = &attachment.meta.client_id {
        return Ok(client_id.clone());
    }
    attachment
        .meta
        .server_id
        .map(|sid| format!("srv-{sid}"))
        .ok_or(CachePathError::NoIdentity)
}

/// Cache keys come from the database, so treat them as untrusted: a key
/// must stay a single path component under the cache root.
pub fn blob_path(root: &Path, key: &str) -> Result<PathBuf, CachePathError> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(CachePathError::InvalidKey(key.to_string()));
    }
    Ok(root.join(key))
}

pub fn blob_path_for(root: &Path, attachment: &Attachment) -> Result<PathBuf, CachePathError> {
    blob_path(root, &blob_cache_key(attachment)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::RecordMeta;

    fn attachment(client_id: Option<&str>, server_id: Option<i64>) -> Attachment {
        let mut meta = RecordMeta::new_local();
        meta.client_id = client_id.map(str::to_string);
        meta.server_id = server_id;
        Attachment {
            meta,
            note_id: 1,
            file_name: "a.jpg".into(),
            mime_type: "image/jpeg".into(),
            size: 10,
            blob_cached: false,
        }
    }

    #[test]
    fn key_prefers_client_id_and_falls_back_to_server_id() {
        assert_eq!(
            blob_cache_key(&attachment(Some("abc"), Some(7))).unwrap(),
            "abc"
        );
        assert_eq!(blob_cache_key(&attachment(None, Some(7))).unwrap(), "srv-7");
        assert_eq!(
            blob_cache_key(&attachment(None, None)),
            Err(CachePathError::NoIdentity)
        );
    }

    #[test]
    fn path_escapes_are_rejected() {
        let root = Path::new("/cache");
        assert!(blob_path(root, "../etc/passwd").is_err());
        assert!(blob_path(root, "a/b").is_err());
        assert!(blob_path(root, "..").is_err());
        assert!(blob_path(root, "").is_err());
        assert_eq!(blob_path(root, "abc").unwrap(), Path::new("/cache/abc"));
    }
}
