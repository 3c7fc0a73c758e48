// III-IV
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Generic abstraction to access object storage systems.
//!
//! Objects live in buckets and are transferred by clients via presigned URLs, so the storage
//! service never handles object contents directly.  The S3 backend lives in a sibling crate and an
//! in-memory backend for tests is available in `testutils`.

use async_trait::async_trait;
use std::time::Duration;

/// Default size of each part in a multipart upload.
pub const DEFAULT_PART_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum number of parts in a multipart upload.
pub const MAX_FILE_PART_NUMBER: u32 = 10_000;

/// Default validity period of presigned URLs.
pub const DEFAULT_URL_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Object storage errors.  Any unexpected errors that come from the backend are classified as
/// `Bucket`, `Object` or `Backend` depending on what they refer to.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Indicates that a bucket does not exist.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Indicates that a bucket to be created already exists.
    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    /// Indicates that a bucket cannot be deleted because it still holds objects.
    #[error("Bucket is not empty: {0}")]
    BucketNotEmpty(String),

    /// Indicates that an object does not exist.
    #[error("Object not found: {bucket_id}/{object_id}")]
    ObjectNotFound {
        /// Bucket that was searched.
        bucket_id: String,

        /// Object that was not found.
        object_id: String,
    },

    /// Indicates that an object to be created already exists.
    #[error("Object already exists: {bucket_id}/{object_id}")]
    ObjectAlreadyExists {
        /// Bucket holding the object.
        bucket_id: String,

        /// Object that already exists.
        object_id: String,
    },

    /// Indicates that a bucket ID does not follow the naming rules.
    #[error("Invalid bucket ID '{bucket_id}': {reason}")]
    InvalidBucketId {
        /// The rejected ID.
        bucket_id: String,

        /// The rule that was violated.
        reason: &'static str,
    },

    /// Indicates that an object ID does not follow the naming rules.
    #[error("Invalid object ID '{object_id}': {reason}")]
    InvalidObjectId {
        /// The rejected ID.
        object_id: String,

        /// The rule that was violated.
        reason: &'static str,
    },

    /// Indicates that a multipart upload does not exist.
    #[error("Upload {upload_id} for {bucket_id}/{object_id} not found")]
    MultiPartUploadNotFound {
        /// ID of the upload.
        upload_id: String,

        /// Bucket the upload was for.
        bucket_id: String,

        /// Object the upload was for.
        object_id: String,
    },

    /// Indicates that the completion of a multipart upload was rejected.
    #[error("Upload confirmation rejected: {0}")]
    MultiPartUploadConfirm(String),

    /// Catch-all error for unexpected bucket-related failures.
    #[error("Bucket error: {0}")]
    Bucket(String),

    /// Catch-all error for unexpected object-related failures.
    #[error("Object error: {0}")]
    Object(String),

    /// Catch-all error for any other unexpected failure.
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Result type for this module.
pub type StorageResult<T> = Result<T, StorageError>;

/// A request that a client can issue to the storage service without further credentials.
#[derive(Clone, Debug, PartialEq)]
pub struct PresignedRequest {
    /// HTTP method to use.
    pub method: http::Method,

    /// Full URL to send the request to.
    pub url: String,

    /// Headers that must accompany the request.
    pub headers: Vec<(String, String)>,
}

/// Validates that `bucket_id` follows the naming rules for buckets: between 3 and 63 lowercase
/// letters, digits or hyphens, not starting nor ending with a hyphen.
pub fn validate_bucket_id(bucket_id: &str) -> StorageResult<()> {
    let invalid =
        |reason| StorageError::InvalidBucketId { bucket_id: bucket_id.to_owned(), reason };

    if !(3..=63).contains(&bucket_id.chars().count()) {
        return Err(invalid("must be between 3 and 63 characters long"));
    }
    if !bucket_id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(invalid("only lowercase letters, digits and hyphens are allowed"));
    }
    if bucket_id.starts_with('-') || bucket_id.ends_with('-') {
        return Err(invalid("must not start or end with a hyphen"));
    }
    Ok(())
}

/// Validates that `object_id` follows the naming rules for objects: between 3 and 63 letters,
/// digits, hyphens or dots, not starting nor ending with a hyphen or a dot.
pub fn validate_object_id(object_id: &str) -> StorageResult<()> {
    let invalid =
        |reason| StorageError::InvalidObjectId { object_id: object_id.to_owned(), reason };

    if !(3..=63).contains(&object_id.chars().count()) {
        return Err(invalid("must be between 3 and 63 characters long"));
    }
    if !object_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return Err(invalid("only letters, digits, hyphens and dots are allowed"));
    }
    if object_id.starts_with(['-', '.']) || object_id.ends_with(['-', '.']) {
        return Err(invalid("must not start or end with a hyphen or a dot"));
    }
    Ok(())
}

/// Validates that `part_number` is within the range supported by multipart uploads.
pub fn validate_part_number(part_number: u32) -> StorageResult<()> {
    if part_number == 0 || part_number > MAX_FILE_PART_NUMBER {
        return Err(StorageError::Object(format!(
            "Part number {} is not in the range [1, {}]",
            part_number, MAX_FILE_PART_NUMBER
        )));
    }
    Ok(())
}

/// Checks the sizes of the uploaded `parts` of a multipart upload, sorted by part number, against
/// the expectations given when completing the upload.
///
/// When given, exactly `anticipated_part_quantity` parts must exist, and all parts except the last
/// must be `anticipated_part_size` bytes long with the last one being no larger than that.
pub fn check_uploaded_parts(
    parts: &[u64],
    anticipated_part_quantity: Option<u32>,
    anticipated_part_size: Option<u64>,
) -> StorageResult<()> {
    let Some((last, rest)) = parts.split_last() else {
        return Err(StorageError::MultiPartUploadConfirm("No parts have been uploaded".to_owned()));
    };

    if let Some(quantity) = anticipated_part_quantity {
        if parts.len() != quantity as usize {
            return Err(StorageError::MultiPartUploadConfirm(format!(
                "Expected {} parts but found {}",
                quantity,
                parts.len()
            )));
        }
    }

    if let Some(size) = anticipated_part_size {
        if let Some(i) = rest.iter().position(|s| *s != size) {
            return Err(StorageError::MultiPartUploadConfirm(format!(
                "Part {} has size {} but expected {}",
                i + 1,
                rest[i],
                size
            )));
        }
        if *last > size {
            return Err(StorageError::MultiPartUploadConfirm(format!(
                "Last part has size {} which exceeds {}",
                last, size
            )));
        }
    }

    Ok(())
}

/// Abstraction over an object storage system.
///
/// Implementations must validate bucket and object IDs with `validate_bucket_id` and
/// `validate_object_id`, and must check the existence preconditions of every operation so that
/// callers get the specific `StorageError` variants instead of backend-specific failures.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Checks whether the bucket `bucket_id` exists.
    async fn does_bucket_exist(&self, bucket_id: &str) -> StorageResult<bool>;

    /// Creates the bucket `bucket_id`, which must not exist yet.
    async fn create_bucket(&self, bucket_id: &str) -> StorageResult<()>;

    /// Deletes the bucket `bucket_id`.
    ///
    /// If the bucket holds objects, they are deleted when `delete_content` is true and the
    /// operation fails otherwise.
    async fn delete_bucket(&self, bucket_id: &str, delete_content: bool) -> StorageResult<()>;

    /// Returns a request to upload the new object `object_id` into `bucket_id` in one go.
    ///
    /// `max_upload_size` limits the size of the upload if the backend supports it.
    async fn get_object_upload_url(
        &self,
        bucket_id: &str,
        object_id: &str,
        expires_after: Duration,
        max_upload_size: Option<u64>,
    ) -> StorageResult<PresignedRequest>;

    /// Starts a multipart upload of the new object `object_id` into `bucket_id` and returns the
    /// upload ID.
    async fn init_multipart_upload(&self, bucket_id: &str, object_id: &str)
    -> StorageResult<String>;

    /// Returns a request to upload part `part_number` of the multipart upload `upload_id`.
    async fn get_part_upload_url(
        &self,
        upload_id: &str,
        bucket_id: &str,
        object_id: &str,
        part_number: u32,
    ) -> StorageResult<PresignedRequest>;

    /// Completes the multipart upload `upload_id` after checking the uploaded parts with
    /// `check_uploaded_parts`.
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        bucket_id: &str,
        object_id: &str,
        anticipated_part_quantity: Option<u32>,
        anticipated_part_size: Option<u64>,
    ) -> StorageResult<()>;

    /// Returns a URL to download the existing object `object_id` from `bucket_id`.
    async fn get_object_download_url(
        &self,
        bucket_id: &str,
        object_id: &str,
        expires_after: Duration,
    ) -> StorageResult<String>;

    /// Checks whether the object `object_id` exists in `bucket_id`.  A missing bucket holds no
    /// objects, so this returns false for it.
    async fn does_object_exist(&self, bucket_id: &str, object_id: &str) -> StorageResult<bool>;

    /// Copies an existing object to a destination that must not exist yet.
    async fn copy_object(
        &self,
        source_bucket_id: &str,
        source_object_id: &str,
        dest_bucket_id: &str,
        dest_object_id: &str,
    ) -> StorageResult<()>;

    /// Deletes the existing object `object_id` from `bucket_id`.
    async fn delete_object(&self, bucket_id: &str, object_id: &str) -> StorageResult<()>;
}

/// Fails with `BucketNotFound` unless `bucket_id` exists in `storage`.
pub async fn assert_bucket_exists<S>(storage: &S, bucket_id: &str) -> StorageResult<()>
where
    S: ObjectStorage + ?Sized,
{
    if !storage.does_bucket_exist(bucket_id).await? {
        return Err(StorageError::BucketNotFound(bucket_id.to_owned()));
    }
    Ok(())
}

/// Fails with `BucketAlreadyExists` if `bucket_id` exists in `storage`.
pub async fn assert_bucket_not_exists<S>(storage: &S, bucket_id: &str) -> StorageResult<()>
where
    S: ObjectStorage + ?Sized,
{
    if storage.does_bucket_exist(bucket_id).await? {
        return Err(StorageError::BucketAlreadyExists(bucket_id.to_owned()));
    }
    Ok(())
}

/// Fails with `BucketNotFound` unless `bucket_id` exists and with `ObjectNotFound` unless
/// `object_id` exists in it.
pub async fn assert_object_exists<S>(
    storage: &S,
    bucket_id: &str,
    object_id: &str,
) -> StorageResult<()>
where
    S: ObjectStorage + ?Sized,
{
    assert_bucket_exists(storage, bucket_id).await?;
    if !storage.does_object_exist(bucket_id, object_id).await? {
        return Err(StorageError::ObjectNotFound {
            bucket_id: bucket_id.to_owned(),
            object_id: object_id.to_owned(),
        });
    }
    Ok(())
}

/// Fails with `BucketNotFound` unless `bucket_id` exists and with `ObjectAlreadyExists` if
/// `object_id` exists in it.
pub async fn assert_object_not_exists<S>(
    storage: &S,
    bucket_id: &str,
    object_id: &str,
) -> StorageResult<()>
where
    S: ObjectStorage + ?Sized,
{
    assert_bucket_exists(storage, bucket_id).await?;
    if storage.does_object_exist(bucket_id, object_id).await? {
        return Err(StorageError::ObjectAlreadyExists {
            bucket_id: bucket_id.to_owned(),
            object_id: object_id.to_owned(),
        });
    }
    Ok(())
}

/// Test utilities for object storage backends.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    pub use paste::paste;

    /// State of an in-progress multipart upload.
    #[derive(Default)]
    struct Upload {
        /// Object that the upload will create.
        object_id: String,

        /// Contents of the parts uploaded so far, keyed by part number.
        parts: BTreeMap<u32, Vec<u8>>,
    }

    /// Contents of a bucket.
    #[derive(Default)]
    struct Bucket {
        /// Objects and their contents.
        objects: HashMap<String, Vec<u8>>,

        /// In-progress multipart uploads keyed by their ID.
        uploads: HashMap<String, Upload>,
    }

    /// Object storage backed by memory.
    ///
    /// Presigned URLs use a `memory://` scheme and cannot be fetched, so tests use `put_object`
    /// and `upload_part` to simulate what clients would do with them.
    #[derive(Clone, Default)]
    pub struct MemoryObjectStorage {
        /// All buckets keyed by their ID.
        buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    }

    impl MemoryObjectStorage {
        /// Stores `content` as `object_id` in the existing `bucket_id`, as a client holding an
        /// upload URL would do.
        pub fn put_object(&self, bucket_id: &str, object_id: &str, content: &[u8]) {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.get_mut(bucket_id).expect("Bucket must exist");
            bucket.objects.insert(object_id.to_owned(), content.to_vec());
        }

        /// Records the upload of part `part_number` with `size` zero bytes for `upload_id`.
        pub fn upload_part(&self, bucket_id: &str, upload_id: &str, part_number: u32, size: u64) {
            self.upload_part_content(bucket_id, upload_id, part_number, &vec![0; size as usize]);
        }

        /// Records the upload of part `part_number` with `content` for `upload_id`.
        pub fn upload_part_content(
            &self,
            bucket_id: &str,
            upload_id: &str,
            part_number: u32,
            content: &[u8],
        ) {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.get_mut(bucket_id).expect("Bucket must exist");
            let upload = bucket.uploads.get_mut(upload_id).expect("Upload must exist");
            upload.parts.insert(part_number, content.to_vec());
        }

        /// Returns the contents of `object_id` in `bucket_id`, if it exists.
        pub fn get_object(&self, bucket_id: &str, object_id: &str) -> Option<Vec<u8>> {
            let buckets = self.buckets.lock().unwrap();
            buckets.get(bucket_id).and_then(|b| b.objects.get(object_id)).cloned()
        }

        /// Builds a fake presigned URL for `bucket_id`/`object_id` with `query` parameters.
        fn url(bucket_id: &str, object_id: &str, query: &str) -> String {
            format!("memory://{}/{}?{}", bucket_id, object_id, query)
        }

        /// Runs `op` on the in-progress upload `upload_id`, which must target `object_id`.
        fn with_upload<T, F>(
            &self,
            upload_id: &str,
            bucket_id: &str,
            object_id: &str,
            op: F,
        ) -> StorageResult<T>
        where
            F: FnOnce(&mut Bucket) -> StorageResult<T>,
        {
            let not_found = || StorageError::MultiPartUploadNotFound {
                upload_id: upload_id.to_owned(),
                bucket_id: bucket_id.to_owned(),
                object_id: object_id.to_owned(),
            };
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.get_mut(bucket_id).ok_or_else(not_found)?;
            match bucket.uploads.get(upload_id) {
                Some(upload) if upload.object_id == object_id => op(bucket),
                _ => Err(not_found()),
            }
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryObjectStorage {
        async fn does_bucket_exist(&self, bucket_id: &str) -> StorageResult<bool> {
            validate_bucket_id(bucket_id)?;
            Ok(self.buckets.lock().unwrap().contains_key(bucket_id))
        }

        async fn create_bucket(&self, bucket_id: &str) -> StorageResult<()> {
            assert_bucket_not_exists(self, bucket_id).await?;
            self.buckets.lock().unwrap().insert(bucket_id.to_owned(), Bucket::default());
            Ok(())
        }

        async fn delete_bucket(&self, bucket_id: &str, delete_content: bool) -> StorageResult<()> {
            assert_bucket_exists(self, bucket_id).await?;
            let mut buckets = self.buckets.lock().unwrap();
            let empty = buckets.get(bucket_id).map(|b| b.objects.is_empty()).unwrap_or(true);
            if !empty && !delete_content {
                return Err(StorageError::BucketNotEmpty(bucket_id.to_owned()));
            }
            buckets.remove(bucket_id);
            Ok(())
        }

        async fn get_object_upload_url(
            &self,
            bucket_id: &str,
            object_id: &str,
            expires_after: Duration,
            _max_upload_size: Option<u64>,
        ) -> StorageResult<PresignedRequest> {
            assert_object_not_exists(self, bucket_id, object_id).await?;
            let query = format!("expires={}", expires_after.as_secs());
            Ok(PresignedRequest {
                method: http::Method::PUT,
                url: Self::url(bucket_id, object_id, &query),
                headers: vec![],
            })
        }

        async fn init_multipart_upload(
            &self,
            bucket_id: &str,
            object_id: &str,
        ) -> StorageResult<String> {
            assert_object_not_exists(self, bucket_id, object_id).await?;
            let upload_id = uuid::Uuid::new_v4().to_string();
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets
                .get_mut(bucket_id)
                .ok_or_else(|| StorageError::BucketNotFound(bucket_id.to_owned()))?;
            let upload = Upload { object_id: object_id.to_owned(), ..Default::default() };
            bucket.uploads.insert(upload_id.clone(), upload);
            Ok(upload_id)
        }

        async fn get_part_upload_url(
            &self,
            upload_id: &str,
            bucket_id: &str,
            object_id: &str,
            part_number: u32,
        ) -> StorageResult<PresignedRequest> {
            validate_bucket_id(bucket_id)?;
            validate_object_id(object_id)?;
            validate_part_number(part_number)?;
            self.with_upload(upload_id, bucket_id, object_id, |_| {
                let query = format!("upload_id={}&part_number={}", upload_id, part_number);
                Ok(PresignedRequest {
                    method: http::Method::PUT,
                    url: Self::url(bucket_id, object_id, &query),
                    headers: vec![],
                })
            })
        }

        async fn complete_multipart_upload(
            &self,
            upload_id: &str,
            bucket_id: &str,
            object_id: &str,
            anticipated_part_quantity: Option<u32>,
            anticipated_part_size: Option<u64>,
        ) -> StorageResult<()> {
            validate_bucket_id(bucket_id)?;
            validate_object_id(object_id)?;
            self.with_upload(upload_id, bucket_id, object_id, |bucket| {
                let upload = bucket.uploads.remove(upload_id).expect("Presence checked by caller");
                let sizes = upload.parts.values().map(|p| p.len() as u64).collect::<Vec<u64>>();
                if let Err(e) =
                    check_uploaded_parts(&sizes, anticipated_part_quantity, anticipated_part_size)
                {
                    bucket.uploads.insert(upload_id.to_owned(), upload);
                    return Err(e);
                }
                let content = upload.parts.into_values().flatten().collect::<Vec<u8>>();
                bucket.objects.insert(object_id.to_owned(), content);
                Ok(())
            })
        }

        async fn get_object_download_url(
            &self,
            bucket_id: &str,
            object_id: &str,
            expires_after: Duration,
        ) -> StorageResult<String> {
            assert_object_exists(self, bucket_id, object_id).await?;
            Ok(Self::url(bucket_id, object_id, &format!("expires={}", expires_after.as_secs())))
        }

        async fn does_object_exist(&self, bucket_id: &str, object_id: &str) -> StorageResult<bool> {
            validate_bucket_id(bucket_id)?;
            validate_object_id(object_id)?;
            let buckets = self.buckets.lock().unwrap();
            Ok(buckets.get(bucket_id).map(|b| b.objects.contains_key(object_id)).unwrap_or(false))
        }

        async fn copy_object(
            &self,
            source_bucket_id: &str,
            source_object_id: &str,
            dest_bucket_id: &str,
            dest_object_id: &str,
        ) -> StorageResult<()> {
            assert_object_exists(self, source_bucket_id, source_object_id).await?;
            assert_object_not_exists(self, dest_bucket_id, dest_object_id).await?;
            let content = self
                .get_object(source_bucket_id, source_object_id)
                .expect("Presence checked above");
            self.put_object(dest_bucket_id, dest_object_id, &content);
            Ok(())
        }

        async fn delete_object(&self, bucket_id: &str, object_id: &str) -> StorageResult<()> {
            assert_object_exists(self, bucket_id, object_id).await?;
            let mut buckets = self.buckets.lock().unwrap();
            if let Some(bucket) = buckets.get_mut(bucket_id) {
                bucket.objects.remove(object_id);
            }
            Ok(())
        }
    }

    /// Hook to let a test suite place and read back object contents in a backend under test.
    ///
    /// Real backends need an HTTP client to use the presigned URLs, so the suite delegates this
    /// to the caller.
    #[async_trait]
    pub trait ObjectPlacer {
        /// Creates `object_id` in the existing `bucket_id` with `content`.
        async fn place_object(&self, bucket_id: &str, object_id: &str, content: &[u8]);

        /// Uploads `content` as part `part_number` of the pending `upload_id` for `object_id`.
        async fn place_part(
            &self,
            bucket_id: &str,
            object_id: &str,
            upload_id: &str,
            part_number: u32,
            content: &[u8],
        );

        /// Returns the contents of the existing `object_id` in `bucket_id`.
        async fn fetch_object(&self, bucket_id: &str, object_id: &str) -> Vec<u8>;
    }

    #[async_trait]
    impl ObjectPlacer for MemoryObjectStorage {
        async fn place_object(&self, bucket_id: &str, object_id: &str, content: &[u8]) {
            self.put_object(bucket_id, object_id, content)
        }

        async fn place_part(
            &self,
            bucket_id: &str,
            _object_id: &str,
            upload_id: &str,
            part_number: u32,
            content: &[u8],
        ) {
            self.upload_part_content(bucket_id, upload_id, part_number, content)
        }

        async fn fetch_object(&self, bucket_id: &str, object_id: &str) -> Vec<u8> {
            self.get_object(bucket_id, object_id).expect("Object must exist")
        }
    }

    /// Generates `size` bytes of content for uploads that span several parts.
    ///
    /// The bytes follow a pattern that does not repeat at part boundaries, so parts that are
    /// reassembled in the wrong order yield different content.
    pub fn big_content(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    /// Generates a random bucket ID that is valid and unlikely to clash with existing buckets.
    pub fn random_bucket_id() -> String {
        format!("test-{}", uuid::Uuid::new_v4().simple())
    }

    /// Generates a random object ID that is valid.
    pub fn random_object_id() -> String {
        format!("obj-{}.dat", uuid::Uuid::new_v4().simple())
    }

    /// Backend-independent tests for `ObjectStorage` implementations.
    pub mod suite {
        use super::*;

        /// Tests the creation, lookup and deletion of empty buckets.
        pub async fn bucket_lifecycle<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let bucket_id = random_bucket_id();
            assert!(!storage.does_bucket_exist(&bucket_id).await.unwrap());

            storage.create_bucket(&bucket_id).await.unwrap();
            assert!(storage.does_bucket_exist(&bucket_id).await.unwrap());
            assert_eq!(
                StorageError::BucketAlreadyExists(bucket_id.clone()),
                storage.create_bucket(&bucket_id).await.unwrap_err()
            );

            storage.delete_bucket(&bucket_id, false).await.unwrap();
            assert!(!storage.does_bucket_exist(&bucket_id).await.unwrap());
            assert_eq!(
                StorageError::BucketNotFound(bucket_id.clone()),
                storage.delete_bucket(&bucket_id, false).await.unwrap_err()
            );
        }

        /// Tests that non-empty buckets are only deleted on request.
        pub async fn delete_bucket_with_content<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let bucket_id = random_bucket_id();
            let object_id = random_object_id();
            storage.create_bucket(&bucket_id).await.unwrap();
            storage.place_object(&bucket_id, &object_id, b"content").await;

            match storage.delete_bucket(&bucket_id, false).await.unwrap_err() {
                StorageError::BucketNotEmpty(_) | StorageError::Bucket(_) => (),
                e => panic!("Unexpected error {:?}", e),
            }
            assert!(storage.does_bucket_exist(&bucket_id).await.unwrap());

            storage.delete_bucket(&bucket_id, true).await.unwrap();
            assert!(!storage.does_bucket_exist(&bucket_id).await.unwrap());
        }

        /// Tests the preconditions and results of the single-shot object operations.
        pub async fn object_lifecycle<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let bucket_id = random_bucket_id();
            let object_id = random_object_id();

            assert!(!storage.does_object_exist(&bucket_id, &object_id).await.unwrap());
            let bucket_not_found = StorageError::BucketNotFound(bucket_id.clone());
            assert_eq!(
                bucket_not_found,
                assert_object_exists(&storage, &bucket_id, &object_id).await.unwrap_err()
            );
            assert_eq!(
                bucket_not_found,
                storage
                    .get_object_download_url(&bucket_id, &object_id, DEFAULT_URL_EXPIRATION)
                    .await
                    .unwrap_err()
            );
            assert_eq!(
                bucket_not_found,
                storage.delete_object(&bucket_id, &object_id).await.unwrap_err()
            );

            storage.create_bucket(&bucket_id).await.unwrap();
            assert!(!storage.does_object_exist(&bucket_id, &object_id).await.unwrap());
            let not_found = StorageError::ObjectNotFound {
                bucket_id: bucket_id.clone(),
                object_id: object_id.clone(),
            };
            assert_eq!(
                not_found,
                storage
                    .get_object_download_url(&bucket_id, &object_id, DEFAULT_URL_EXPIRATION)
                    .await
                    .unwrap_err()
            );

            let request = storage
                .get_object_upload_url(&bucket_id, &object_id, DEFAULT_URL_EXPIRATION, None)
                .await
                .unwrap();
            assert!(request.url.contains(&object_id), "URL {} lacks object ID", request.url);

            storage.place_object(&bucket_id, &object_id, b"content").await;
            assert!(storage.does_object_exist(&bucket_id, &object_id).await.unwrap());
            assert_eq!(
                StorageError::ObjectAlreadyExists {
                    bucket_id: bucket_id.clone(),
                    object_id: object_id.clone(),
                },
                storage
                    .get_object_upload_url(&bucket_id, &object_id, DEFAULT_URL_EXPIRATION, None)
                    .await
                    .unwrap_err()
            );

            let url = storage
                .get_object_download_url(&bucket_id, &object_id, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(url.contains(&object_id), "URL {} lacks object ID", url);

            storage.delete_object(&bucket_id, &object_id).await.unwrap();
            assert!(!storage.does_object_exist(&bucket_id, &object_id).await.unwrap());
            assert_eq!(not_found, storage.delete_object(&bucket_id, &object_id).await.unwrap_err());

            storage.delete_bucket(&bucket_id, true).await.unwrap();
        }

        /// Tests copying objects across buckets.
        pub async fn copy_object<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let source_bucket_id = random_bucket_id();
            let dest_bucket_id = random_bucket_id();
            let object_id = random_object_id();
            storage.create_bucket(&source_bucket_id).await.unwrap();
            storage.create_bucket(&dest_bucket_id).await.unwrap();

            match storage
                .copy_object(&source_bucket_id, &object_id, &dest_bucket_id, &object_id)
                .await
                .unwrap_err()
            {
                StorageError::ObjectNotFound { .. } => (),
                e => panic!("Unexpected error {:?}", e),
            }

            storage.place_object(&source_bucket_id, &object_id, b"content").await;
            storage
                .copy_object(&source_bucket_id, &object_id, &dest_bucket_id, &object_id)
                .await
                .unwrap();
            assert!(storage.does_object_exist(&source_bucket_id, &object_id).await.unwrap());
            assert!(storage.does_object_exist(&dest_bucket_id, &object_id).await.unwrap());

            match storage
                .copy_object(&source_bucket_id, &object_id, &dest_bucket_id, &object_id)
                .await
                .unwrap_err()
            {
                StorageError::ObjectAlreadyExists { .. } => (),
                e => panic!("Unexpected error {:?}", e),
            }

            storage.delete_bucket(&source_bucket_id, true).await.unwrap();
            storage.delete_bucket(&dest_bucket_id, true).await.unwrap();
        }

        /// Tests that all operations reject malformed IDs.
        pub async fn invalid_ids<S: ObjectStorage + ObjectPlacer>(storage: S) {
            match storage.create_bucket("Invalid_Bucket").await.unwrap_err() {
                StorageError::InvalidBucketId { .. } => (),
                e => panic!("Unexpected error {:?}", e),
            }

            let bucket_id = random_bucket_id();
            storage.create_bucket(&bucket_id).await.unwrap();
            match storage
                .get_object_upload_url(&bucket_id, "-bad", DEFAULT_URL_EXPIRATION, None)
                .await
                .unwrap_err()
            {
                StorageError::InvalidObjectId { .. } => (),
                e => panic!("Unexpected error {:?}", e),
            }
            storage.delete_bucket(&bucket_id, true).await.unwrap();
        }

        /// Tests the preconditions of multipart uploads up to their completion.
        ///
        /// Part contents cannot be uploaded by the suite, so completion is only checked for
        /// its failure modes.
        pub async fn multipart_preconditions<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let bucket_id = random_bucket_id();
            let object_id = random_object_id();
            storage.create_bucket(&bucket_id).await.unwrap();

            let upload_id = storage.init_multipart_upload(&bucket_id, &object_id).await.unwrap();
            let request =
                storage.get_part_upload_url(&upload_id, &bucket_id, &object_id, 1).await.unwrap();
            assert!(request.url.contains(&object_id), "URL {} lacks object ID", request.url);

            storage.get_part_upload_url(&upload_id, &bucket_id, &object_id, 0).await.unwrap_err();
            storage
                .get_part_upload_url(&upload_id, &bucket_id, &object_id, MAX_FILE_PART_NUMBER + 1)
                .await
                .unwrap_err();

            match storage
                .get_part_upload_url("unknown-upload", &bucket_id, &object_id, 1)
                .await
                .unwrap_err()
            {
                StorageError::MultiPartUploadNotFound { .. } => (),
                e => panic!("Unexpected error {:?}", e),
            }

            match storage
                .complete_multipart_upload(&upload_id, &bucket_id, &object_id, Some(1), None)
                .await
                .unwrap_err()
            {
                StorageError::MultiPartUploadConfirm(_) => (),
                e => panic!("Unexpected error {:?}", e),
            }

            storage.delete_bucket(&bucket_id, true).await.unwrap();
        }

        /// Tests uploading a file that spans several parts and reading it back.
        pub async fn multipart_workflow<S: ObjectStorage + ObjectPlacer>(storage: S) {
            let bucket_id = random_bucket_id();
            let object_id = random_object_id();
            storage.create_bucket(&bucket_id).await.unwrap();

            let part_size = DEFAULT_PART_SIZE as usize;
            let content = big_content(part_size * 2 + 1024);
            let upload_id = storage.init_multipart_upload(&bucket_id, &object_id).await.unwrap();
            for (i, part) in content.chunks(part_size).enumerate() {
                let part_number = i as u32 + 1;
                storage
                    .get_part_upload_url(&upload_id, &bucket_id, &object_id, part_number)
                    .await
                    .unwrap();
                storage.place_part(&bucket_id, &object_id, &upload_id, part_number, part).await;
            }
            assert!(!storage.does_object_exist(&bucket_id, &object_id).await.unwrap());

            storage
                .complete_multipart_upload(
                    &upload_id,
                    &bucket_id,
                    &object_id,
                    Some(3),
                    Some(DEFAULT_PART_SIZE),
                )
                .await
                .unwrap();
            assert!(storage.does_object_exist(&bucket_id, &object_id).await.unwrap());
            assert!(content == storage.fetch_object(&bucket_id, &object_id).await);

            storage.delete_bucket(&bucket_id, true).await.unwrap();
        }
    }

    /// Instantiates the `suite::$name` test for the storage backend returned by `setup`.
    #[macro_export]
    macro_rules! generate_one_storage_test [
        ( $name:ident, $setup:expr $(, #[$extra:meta] )? ) => {
            $crate::storage::testutils::paste! {
                #[tokio::test]
                $(#[$extra])?
                async fn [< test_ $name >]() {
                    $crate::storage::testutils::suite::$name($setup).await;
                }
            }
        }
    ];

    pub use generate_one_storage_test;

    /// Instantiates the whole backend-independent test suite for the storage backend returned by
    /// `setup`, which is evaluated once per test.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_storage_tests [
        ( $setup:expr $(, #[$extra:meta] )? ) => {
            $crate::storage::testutils::generate_one_storage_test!(
                bucket_lifecycle, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                delete_bucket_with_content, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                object_lifecycle, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                copy_object, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                invalid_ids, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                multipart_preconditions, $setup $(, #[$extra])?);
            $crate::storage::testutils::generate_one_storage_test!(
                multipart_workflow, $setup $(, #[$extra])?);
        }
    ];

    pub use generate_storage_tests;
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;

    const VALID_BUCKET_ID: &str = "ghgas-12239992232323422";
    const VALID_OBJECT_ID: &str = "ghgaf-12239992232323422.test";

    #[test]
    fn test_validate_bucket_id_ok() {
        validate_bucket_id(VALID_BUCKET_ID).unwrap();
        validate_bucket_id("abc").unwrap();
        validate_bucket_id(&"a".repeat(63)).unwrap();
    }

    #[test]
    fn test_validate_bucket_id_errors() {
        for id in ["a1", &"a".repeat(64)] {
            match validate_bucket_id(id).unwrap_err() {
                StorageError::InvalidBucketId { reason, .. } => assert!(reason.contains("between")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
        for c in ["A", "_", ".", "/", "&", "+", ":"] {
            let id = format!("{}{}", VALID_BUCKET_ID, c);
            match validate_bucket_id(&id).unwrap_err() {
                StorageError::InvalidBucketId { reason, .. } => assert!(reason.contains("only")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
        for id in ["-aa", "aa-"] {
            match validate_bucket_id(id).unwrap_err() {
                StorageError::InvalidBucketId { reason, .. } => assert!(reason.contains("start")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_validate_object_id_ok() {
        validate_object_id(VALID_OBJECT_ID).unwrap();
        validate_object_id("A.b-C").unwrap();
    }

    #[test]
    fn test_validate_object_id_errors() {
        for id in ["a1", &"a".repeat(64)] {
            match validate_object_id(id).unwrap_err() {
                StorageError::InvalidObjectId { reason, .. } => assert!(reason.contains("between")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
        for c in ["_", "/", "&", "+", ":"] {
            let id = format!("{}{}", VALID_OBJECT_ID, c);
            match validate_object_id(&id).unwrap_err() {
                StorageError::InvalidObjectId { reason, .. } => assert!(reason.contains("only")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
        for id in ["-aa", "aa-", ".aa", "aa."] {
            match validate_object_id(id).unwrap_err() {
                StorageError::InvalidObjectId { reason, .. } => assert!(reason.contains("start")),
                e => panic!("Unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_validate_part_number() {
        validate_part_number(1).unwrap();
        validate_part_number(MAX_FILE_PART_NUMBER).unwrap();
        validate_part_number(0).unwrap_err();
        validate_part_number(MAX_FILE_PART_NUMBER + 1).unwrap_err();
    }

    #[test]
    fn test_check_uploaded_parts() {
        check_uploaded_parts(&[10, 10, 3], Some(3), Some(10)).unwrap();
        check_uploaded_parts(&[10, 10, 10], None, Some(10)).unwrap();
        check_uploaded_parts(&[7], Some(1), None).unwrap();

        check_uploaded_parts(&[], None, None).unwrap_err();
        assert_eq!(
            StorageError::MultiPartUploadConfirm("Expected 2 parts but found 3".to_owned()),
            check_uploaded_parts(&[10, 10, 3], Some(2), Some(10)).unwrap_err()
        );
        assert_eq!(
            StorageError::MultiPartUploadConfirm("Part 2 has size 9 but expected 10".to_owned()),
            check_uploaded_parts(&[10, 9, 3], None, Some(10)).unwrap_err()
        );
        let err = check_uploaded_parts(&[10, 11], None, Some(10)).unwrap_err();
        let message = "Last part has size 11 which exceeds 10".to_owned();
        assert_eq!(StorageError::MultiPartUploadConfirm(message), err);
    }

    #[tokio::test]
    async fn test_memory_multipart_complete() {
        let storage = MemoryObjectStorage::default();
        storage.create_bucket(VALID_BUCKET_ID).await.unwrap();

        let upload_id =
            storage.init_multipart_upload(VALID_BUCKET_ID, VALID_OBJECT_ID).await.unwrap();
        storage.upload_part(VALID_BUCKET_ID, &upload_id, 1, DEFAULT_PART_SIZE);
        storage.upload_part(VALID_BUCKET_ID, &upload_id, 2, 5);

        storage
            .complete_multipart_upload(&upload_id, VALID_BUCKET_ID, VALID_OBJECT_ID, Some(3), None)
            .await
            .unwrap_err();
        storage
            .complete_multipart_upload(
                &upload_id,
                VALID_BUCKET_ID,
                VALID_OBJECT_ID,
                Some(2),
                Some(DEFAULT_PART_SIZE),
            )
            .await
            .unwrap();

        let content = storage.get_object(VALID_BUCKET_ID, VALID_OBJECT_ID).unwrap();
        assert_eq!(DEFAULT_PART_SIZE + 5, content.len() as u64);
        match storage
            .complete_multipart_upload(&upload_id, VALID_BUCKET_ID, VALID_OBJECT_ID, None, None)
            .await
            .unwrap_err()
        {
            StorageError::MultiPartUploadNotFound { .. } => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_memory_copy_preserves_content() {
        let storage = MemoryObjectStorage::default();
        storage.create_bucket(VALID_BUCKET_ID).await.unwrap();
        storage.put_object(VALID_BUCKET_ID, VALID_OBJECT_ID, b"some data");
        storage
            .copy_object(VALID_BUCKET_ID, VALID_OBJECT_ID, VALID_BUCKET_ID, "copy.test")
            .await
            .unwrap();
        assert_eq!(Some(b"some data".to_vec()), storage.get_object(VALID_BUCKET_ID, "copy.test"));
    }

    generate_storage_tests!(MemoryObjectStorage::default());
}
