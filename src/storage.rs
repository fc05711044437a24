//! Blob storage for generated image assets.
//!
//! Supports two backends, tried in order:
//! - **Local disk**: writes under `LOCAL_STORAGE_PATH`
//! - **GCS**: writes to the configured bucket (requires
//!   `GOOGLE_APPLICATION_CREDENTIALS`)
//!
//! The contract is "put a blob, get back a stable path"; asset serving is
//! handled elsewhere.

use bytes::Bytes;
use chrono::Utc;
use std::path::PathBuf;

/// Upload data to local storage or GCS.
pub async fn put_object(
    gcs: Option<&google_cloud_storage::client::Storage>,
    local_storage_path: Option<&PathBuf>,
    bucket_name: &str,
    path: &str,
    data: &[u8],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(local_path) = local_storage_path {
        let full_path = local_path.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, data).await?;
    } else if let Some(gcs) = gcs {
        let bucket = format!("projects/_/buckets/{}", bucket_name);
        let bytes = Bytes::copy_from_slice(data);
        gcs.write_object(&bucket, path, bytes)
            .send_buffered()
            .await?;
    } else {
        return Err(
            "No storage backend configured (set LOCAL_STORAGE_PATH or GOOGLE_APPLICATION_CREDENTIALS)"
                .into(),
        );
    }
    Ok(())
}

/// Build the storage path for a generated image.
///
/// Path: generated/user_123/2025-12-06/42_1733500000000.png
pub fn generated_asset_path(user_id: i64, job_id: i64) -> String {
    let now = Utc::now();
    let day_bucket = now.format("%Y-%m-%d");
    let timestamp = now.timestamp_millis();
    format!(
        "generated/user_{}/{}/{}_{}.png",
        user_id, day_bucket, job_id, timestamp
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_asset_path_shape() {
        let path = generated_asset_path(7, 42);
        assert!(path.starts_with("generated/user_7/"));
        assert!(path.ends_with(".png"));
        assert!(path.contains("/42_"));
    }
}
