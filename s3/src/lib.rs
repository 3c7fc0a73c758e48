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

//! Implementation of the `ObjectStorage` abstraction on top of S3-compatible services.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::{PresignedRequest as AwsPresignedRequest, PresigningConfig};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chassis_core::config::{Field, Kind, Schema, Settings};
use chassis_core::storage::{
    ObjectStorage, PresignedRequest, StorageError, StorageResult, assert_bucket_exists,
    assert_bucket_not_exists, assert_object_exists, assert_object_not_exists,
    check_uploaded_parts, validate_bucket_id, validate_object_id, validate_part_number,
};
use derivative::Derivative;
use log::{debug, info, warn};
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

/// Name under which the static credentials are registered with the SDK.
const CREDENTIALS_PROVIDER: &str = "chassis-s3";

/// Settings to connect to an S3-compatible service.
#[derive(Clone, Deserialize, Derivative)]
#[derivative(Debug, PartialEq)]
pub struct S3Config {
    /// URL of the S3 endpoint.
    pub s3_endpoint_url: String,

    /// Access key ID of the credentials.
    pub s3_access_key_id: String,

    /// Secret access key of the credentials.
    #[derivative(Debug = "ignore")]
    pub s3_secret_access_key: String,

    /// Session token of temporary credentials.
    #[derivative(Debug = "ignore")]
    pub s3_session_token: Option<String>,

    /// Region to sign requests for.
    pub s3_region: String,
}

impl Settings for S3Config {
    fn schema() -> Schema {
        Schema::new()
            .field(
                Field::required("s3_endpoint_url", Kind::String)
                    .describe("URL of the S3-compatible endpoint"),
            )
            .field(Field::required("s3_access_key_id", Kind::String).describe("S3 access key ID"))
            .field(
                Field::required("s3_secret_access_key", Kind::String)
                    .describe("S3 secret access key"),
            )
            .field(
                Field::optional("s3_session_token", Kind::String)
                    .describe("Session token for temporary S3 credentials"),
            )
            .field(
                Field::with_default("s3_region", Kind::String, "us-east-1")
                    .describe("Region to sign S3 requests for"),
            )
    }
}

/// The resources an S3 request refers to, used to classify the errors it returns.
#[derive(Clone, Copy, Default)]
struct Target<'a> {
    /// Bucket the request refers to.
    bucket_id: &'a str,

    /// Object the request refers to, if any.
    object_id: &'a str,

    /// Multipart upload the request refers to, if any.
    upload_id: &'a str,
}

impl<'a> Target<'a> {
    /// Creates a target for a request on `bucket_id`.
    fn bucket(bucket_id: &'a str) -> Self {
        Self { bucket_id, ..Default::default() }
    }

    /// Creates a target for a request on `object_id` within `bucket_id`.
    fn object(bucket_id: &'a str, object_id: &'a str) -> Self {
        Self { bucket_id, object_id, ..Default::default() }
    }

    /// Creates a target for a request on the multipart upload `upload_id`.
    fn upload(bucket_id: &'a str, object_id: &'a str, upload_id: &'a str) -> Self {
        Self { bucket_id, object_id, upload_id }
    }
}

/// Translates the S3 error `code` returned by a request on `target` into a `StorageError`.
fn translate_error_code(code: &str, target: Target<'_>) -> StorageError {
    let bucket_id = target.bucket_id.to_owned();
    let object_id = target.object_id.to_owned();
    match code {
        "NoSuchBucket" => StorageError::BucketNotFound(bucket_id),
        "BucketAlreadyExists" | "BucketAlreadyOwnedByYou" => {
            StorageError::BucketAlreadyExists(bucket_id)
        }
        "BucketNotEmpty" => StorageError::BucketNotEmpty(bucket_id),
        "NoSuchKey" => StorageError::ObjectNotFound { bucket_id, object_id },
        "ObjectAlreadyInActiveTierError" => {
            StorageError::ObjectAlreadyExists { bucket_id, object_id }
        }
        "NoSuchUpload" => StorageError::MultiPartUploadNotFound {
            upload_id: target.upload_id.to_owned(),
            bucket_id,
            object_id,
        },
        code => {
            let message = format!("S3 error with code: '{}'", code);
            if code.contains("Bucket") {
                StorageError::Bucket(message)
            } else if code.contains("Object") || code.contains("Key") {
                StorageError::Object(message)
            } else {
                StorageError::Backend(message)
            }
        }
    }
}

/// Converts an error returned by the S3 SDK for a request on `target` into a `StorageError`.
fn map_sdk_error<E, R>(e: SdkError<E, R>, target: Target<'_>) -> StorageError
where
    E: ProvideErrorMetadata + Error + 'static,
    R: std::fmt::Debug,
{
    match e.code() {
        Some(code) => translate_error_code(code, target),
        None => StorageError::Backend(DisplayErrorContext(&e).to_string()),
    }
}

/// Validates the `size` that the service reported for part `part_number` of `target`.
fn part_size(
    part_number: Option<i32>,
    size: Option<i64>,
    target: Target<'_>,
) -> StorageResult<u64> {
    let part = part_number.map(|n| n.to_string()).unwrap_or_else(|| "?".to_owned());
    let size = size.ok_or_else(|| {
        StorageError::Backend(format!(
            "Part {} of upload {} for {}/{} has no size",
            part, target.upload_id, target.bucket_id, target.object_id
        ))
    })?;
    u64::try_from(size).map_err(|_| {
        StorageError::Backend(format!(
            "Part {} of upload {} for {}/{} has invalid size {}",
            part, target.upload_id, target.bucket_id, target.object_id, size
        ))
    })
}

/// Creates the presigning settings for URLs valid for `expires_after`.
fn presigning_config(expires_after: Duration) -> StorageResult<PresigningConfig> {
    PresigningConfig::expires_in(expires_after)
        .map_err(|e| StorageError::Backend(format!("Invalid URL expiration: {}", e)))
}

/// Converts a presigned request generated by the SDK into our own representation.
fn convert_presigned(request: AwsPresignedRequest) -> StorageResult<PresignedRequest> {
    let method = http::Method::from_bytes(request.method().as_bytes())
        .map_err(|e| StorageError::Backend(format!("Invalid presigned method: {}", e)))?;
    let headers =
        request.headers().map(|(k, v)| (k.to_owned(), v.to_owned())).collect::<Vec<_>>();
    Ok(PresignedRequest { method, url: request.uri().to_owned(), headers })
}

/// Object storage backed by an S3-compatible service.
#[derive(Clone)]
pub struct S3ObjectStorage {
    /// Client to issue requests with.
    client: Client,
}

impl S3ObjectStorage {
    /// Creates a new storage backend based on `config`.
    ///
    /// No requests are issued until the first operation.
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.s3_access_key_id,
            &config.s3_secret_access_key,
            config.s3_session_token.clone(),
            None,
            CREDENTIALS_PROVIDER,
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.s3_endpoint_url)
            .region(Region::new(config.s3_region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        info!("Configured S3 client for {}", config.s3_endpoint_url);
        Self { client: Client::from_conf(s3_config) }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Deletes all objects and aborts all pending multipart uploads in `bucket_id`.
    async fn empty_bucket(&self, bucket_id: &str) -> StorageResult<()> {
        let mut pages =
            self.client.list_objects_v2().bucket(bucket_id).into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error(e, Target::bucket(bucket_id)))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                debug!("Deleting object {}/{}", bucket_id, key);
                self.client
                    .delete_object()
                    .bucket(bucket_id)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, Target::object(bucket_id, key)))?;
            }
        }

        let mut key_marker = None;
        let mut upload_id_marker = None;
        loop {
            let page = self
                .client
                .list_multipart_uploads()
                .bucket(bucket_id)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, Target::bucket(bucket_id)))?;
            for upload in page.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                debug!("Aborting upload {} of {}/{}", upload_id, bucket_id, key);
                self.client
                    .abort_multipart_upload()
                    .bucket(bucket_id)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, Target::upload(bucket_id, key, upload_id)))?;
            }
            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_owned);
            upload_id_marker = page.next_upload_id_marker().map(str::to_owned);
            if key_marker.is_none() && upload_id_marker.is_none() {
                warn!("Truncated upload listing for {} carries no markers", bucket_id);
                break;
            }
        }

        Ok(())
    }

    /// Returns the sizes and entity tags of the parts uploaded so far to `upload_id`, sorted by
    /// part number.
    async fn list_uploaded_parts(
        &self,
        upload_id: &str,
        bucket_id: &str,
        object_id: &str,
    ) -> StorageResult<Vec<(u64, CompletedPart)>> {
        let target = Target::upload(bucket_id, object_id, upload_id);
        let mut parts = vec![];
        let mut pages = self
            .client
            .list_parts()
            .bucket(bucket_id)
            .key(object_id)
            .upload_id(upload_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error(e, target))?;
            for part in page.parts() {
                let size = part_size(part.part_number(), part.size(), target)?;
                let completed = CompletedPart::builder()
                    .set_part_number(part.part_number())
                    .set_e_tag(part.e_tag().map(str::to_owned))
                    .build();
                parts.push((size, completed));
            }
        }
        parts.sort_by_key(|(_, part)| part.part_number());
        Ok(parts)
    }

    /// Fails with `MultiPartUploadNotFound` unless `upload_id` is pending for `object_id`.
    async fn assert_upload_exists(
        &self,
        upload_id: &str,
        bucket_id: &str,
        object_id: &str,
    ) -> StorageResult<()> {
        self.client
            .list_parts()
            .bucket(bucket_id)
            .key(object_id)
            .upload_id(upload_id)
            .max_parts(1)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::upload(bucket_id, object_id, upload_id)))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn does_bucket_exist(&self, bucket_id: &str) -> StorageResult<bool> {
        validate_bucket_id(bucket_id)?;
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::bucket(bucket_id)))?;
        Ok(response.buckets().iter().any(|b| b.name() == Some(bucket_id)))
    }

    async fn create_bucket(&self, bucket_id: &str) -> StorageResult<()> {
        assert_bucket_not_exists(self, bucket_id).await?;
        self.client
            .create_bucket()
            .bucket(bucket_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::bucket(bucket_id)))?;
        info!("Created bucket {}", bucket_id);
        Ok(())
    }

    async fn delete_bucket(&self, bucket_id: &str, delete_content: bool) -> StorageResult<()> {
        assert_bucket_exists(self, bucket_id).await?;
        if delete_content {
            self.empty_bucket(bucket_id).await?;
        }
        self.client
            .delete_bucket()
            .bucket(bucket_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::bucket(bucket_id)))?;
        info!("Deleted bucket {}", bucket_id);
        Ok(())
    }

    async fn get_object_upload_url(
        &self,
        bucket_id: &str,
        object_id: &str,
        expires_after: Duration,
        max_upload_size: Option<u64>,
    ) -> StorageResult<PresignedRequest> {
        validate_object_id(object_id)?;
        assert_object_not_exists(self, bucket_id, object_id).await?;
        if let Some(size) = max_upload_size {
            warn!("Cannot enforce max upload size {} on presigned PUT for {}", size, object_id);
        }
        let request = self
            .client
            .put_object()
            .bucket(bucket_id)
            .key(object_id)
            .presigned(presigning_config(expires_after)?)
            .await
            .map_err(|e| map_sdk_error(e, Target::object(bucket_id, object_id)))?;
        convert_presigned(request)
    }

    async fn init_multipart_upload(
        &self,
        bucket_id: &str,
        object_id: &str,
    ) -> StorageResult<String> {
        validate_object_id(object_id)?;
        assert_object_not_exists(self, bucket_id, object_id).await?;
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket_id)
            .key(object_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::object(bucket_id, object_id)))?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| StorageError::Backend("S3 did not return an upload ID".to_owned()))?;
        debug!("Started upload {} of {}/{}", upload_id, bucket_id, object_id);
        Ok(upload_id.to_owned())
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
        self.assert_upload_exists(upload_id, bucket_id, object_id).await?;

        // Part numbers are at most MAX_FILE_PART_NUMBER so this conversion cannot fail.
        let part_number = i32::try_from(part_number)
            .map_err(|e| StorageError::Object(format!("Invalid part number: {}", e)))?;
        let request = self
            .client
            .upload_part()
            .bucket(bucket_id)
            .key(object_id)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning_config(Duration::from_secs(60 * 60))?)
            .await
            .map_err(|e| map_sdk_error(e, Target::upload(bucket_id, object_id, upload_id)))?;
        convert_presigned(request)
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
        let parts = self.list_uploaded_parts(upload_id, bucket_id, object_id).await?;
        let sizes = parts.iter().map(|(size, _)| *size).collect::<Vec<u64>>();
        check_uploaded_parts(&sizes, anticipated_part_quantity, anticipated_part_size)?;

        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts.into_iter().map(|(_, part)| part).collect()))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket_id)
            .key(object_id)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::upload(bucket_id, object_id, upload_id)))?;
        info!("Completed upload {} of {}/{}", upload_id, bucket_id, object_id);
        Ok(())
    }

    async fn get_object_download_url(
        &self,
        bucket_id: &str,
        object_id: &str,
        expires_after: Duration,
    ) -> StorageResult<String> {
        assert_object_exists(self, bucket_id, object_id).await?;
        let request = self
            .client
            .get_object()
            .bucket(bucket_id)
            .key(object_id)
            .presigned(presigning_config(expires_after)?)
            .await
            .map_err(|e| map_sdk_error(e, Target::object(bucket_id, object_id)))?;
        Ok(request.uri().to_owned())
    }

    async fn does_object_exist(&self, bucket_id: &str, object_id: &str) -> StorageResult<bool> {
        validate_bucket_id(bucket_id)?;
        validate_object_id(object_id)?;
        if !self.does_bucket_exist(bucket_id).await? {
            return Ok(false);
        }
        match self.client.head_object().bucket(bucket_id).key(object_id).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) => {
                debug!("Object {}/{} not found: {}", bucket_id, object_id, e.err());
                Ok(false)
            }
            Err(e) => Err(map_sdk_error(e, Target::object(bucket_id, object_id))),
        }
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
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", source_bucket_id, source_object_id))
            .bucket(dest_bucket_id)
            .key(dest_object_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::object(dest_bucket_id, dest_object_id)))?;
        Ok(())
    }

    async fn delete_object(&self, bucket_id: &str, object_id: &str) -> StorageResult<()> {
        assert_object_exists(self, bucket_id, object_id).await?;
        self.client
            .delete_object()
            .bucket(bucket_id)
            .key(object_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Target::object(bucket_id, object_id)))?;
        Ok(())
    }
}

/// Test utilities for the S3 backend.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;
    use aws_sdk_s3::primitives::ByteStream;
    use chassis_core::config::ConfigLoader;
    use chassis_core::storage::testutils::ObjectPlacer;

    /// Creates a new storage backend for testing, loading its settings from `S3_TEST_*`
    /// environment variables.
    ///
    /// Given that this is for testing purposes only, any errors will panic.
    pub fn setup() -> S3ObjectStorage {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        let config =
            ConfigLoader::new("S3_TEST").with_search_dirs(vec![]).load::<S3Config>().unwrap();
        S3ObjectStorage::new(&config)
    }

    #[async_trait]
    impl ObjectPlacer for S3ObjectStorage {
        async fn place_object(&self, bucket_id: &str, object_id: &str, content: &[u8]) {
            self.client
                .put_object()
                .bucket(bucket_id)
                .key(object_id)
                .body(ByteStream::from(content.to_vec()))
                .send()
                .await
                .unwrap();
        }

        async fn place_part(
            &self,
            bucket_id: &str,
            object_id: &str,
            upload_id: &str,
            part_number: u32,
            content: &[u8],
        ) {
            self.client
                .upload_part()
                .bucket(bucket_id)
                .key(object_id)
                .upload_id(upload_id)
                .part_number(i32::try_from(part_number).unwrap())
                .body(ByteStream::from(content.to_vec()))
                .send()
                .await
                .unwrap();
        }

        async fn fetch_object(&self, bucket_id: &str, object_id: &str) -> Vec<u8> {
            let output =
                self.client.get_object().bucket(bucket_id).key(object_id).send().await.unwrap();
            output.body.collect().await.unwrap().into_bytes().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;
    use chassis_core::config::ConfigLoader;
    use chassis_core::storage::testutils::generate_storage_tests;

    #[test]
    fn test_s3_config_defaults_and_debug() {
        let config = ConfigLoader::new("s3_unit")
            .with_search_dirs(vec![])
            .with_override("s3_endpoint_url", "http://localhost:9000")
            .with_override("s3_access_key_id", "the-key")
            .with_override("s3_secret_access_key", "the-secret")
            .load::<S3Config>()
            .unwrap();
        assert_eq!("us-east-1", config.s3_region);
        assert_eq!(None, config.s3_session_token);

        let debug = format!("{:?}", config);
        assert!(debug.contains("the-key"), "Debug output lacks the key ID: {}", debug);
        assert!(!debug.contains("the-secret"), "Debug output leaks the secret: {}", debug);
    }

    #[test]
    fn test_s3_config_from_env_reports_all_missing() {
        temp_env::with_vars([("S3_UNIT_ENV_S3_REGION", Some("eu-west-1"))], || {
            let err =
                ConfigLoader::new("s3_unit_env").with_search_dirs(vec![]).load::<S3Config>();
            let err = err.unwrap_err();
            let fields = err.field_errors().iter().map(|e| e.field()).collect::<Vec<&str>>();
            assert_eq!(vec!["s3_endpoint_url", "s3_access_key_id", "s3_secret_access_key"], fields);
        });
    }

    #[test]
    fn test_translate_error_code_known() {
        let target = Target::upload("b", "o", "u");
        assert_eq!(
            StorageError::BucketNotFound("b".to_owned()),
            translate_error_code("NoSuchBucket", target)
        );
        assert_eq!(
            StorageError::BucketAlreadyExists("b".to_owned()),
            translate_error_code("BucketAlreadyExists", target)
        );
        assert_eq!(
            StorageError::BucketAlreadyExists("b".to_owned()),
            translate_error_code("BucketAlreadyOwnedByYou", target)
        );
        assert_eq!(
            StorageError::BucketNotEmpty("b".to_owned()),
            translate_error_code("BucketNotEmpty", target)
        );
        assert_eq!(
            StorageError::ObjectNotFound { bucket_id: "b".to_owned(), object_id: "o".to_owned() },
            translate_error_code("NoSuchKey", target)
        );
        assert_eq!(
            StorageError::ObjectAlreadyExists {
                bucket_id: "b".to_owned(),
                object_id: "o".to_owned()
            },
            translate_error_code("ObjectAlreadyInActiveTierError", target)
        );
        assert_eq!(
            StorageError::MultiPartUploadNotFound {
                upload_id: "u".to_owned(),
                bucket_id: "b".to_owned(),
                object_id: "o".to_owned()
            },
            translate_error_code("NoSuchUpload", target)
        );
    }

    #[test]
    fn test_translate_error_code_fallbacks() {
        let target = Target::bucket("b");
        assert_eq!(
            StorageError::Bucket("S3 error with code: 'InvalidBucketState'".to_owned()),
            translate_error_code("InvalidBucketState", target)
        );
        assert_eq!(
            StorageError::Object("S3 error with code: 'InvalidObjectState'".to_owned()),
            translate_error_code("InvalidObjectState", target)
        );
        assert_eq!(
            StorageError::Object("S3 error with code: 'KeyTooLongError'".to_owned()),
            translate_error_code("KeyTooLongError", target)
        );
        assert_eq!(
            StorageError::Backend("S3 error with code: 'AccessDenied'".to_owned()),
            translate_error_code("AccessDenied", target)
        );
    }

    #[test]
    fn test_part_size() {
        let target = Target::upload("bucket", "object", "u1");
        assert_eq!(1024, part_size(Some(1), Some(1024), target).unwrap());
        assert_eq!(0, part_size(Some(2), Some(0), target).unwrap());
        assert_eq!(
            StorageError::Backend("Part 3 of upload u1 for bucket/object has no size".to_owned()),
            part_size(Some(3), None, target).unwrap_err()
        );
        assert_eq!(
            StorageError::Backend(
                "Part ? of upload u1 for bucket/object has invalid size -5".to_owned()
            ),
            part_size(None, Some(-5), target).unwrap_err()
        );
    }

    #[test]
    fn test_presigning_config_rejects_long_expiration() {
        presigning_config(Duration::from_secs(60)).unwrap();
        match presigning_config(Duration::from_secs(30 * 24 * 60 * 60)).unwrap_err() {
            StorageError::Backend(e) => assert!(e.contains("expiration"), "Got {}", e),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_invalid_ids_fail_before_any_request() {
        let storage = S3ObjectStorage::new(&S3Config {
            s3_endpoint_url: "http://localhost:1".to_owned(),
            s3_access_key_id: "key".to_owned(),
            s3_secret_access_key: "secret".to_owned(),
            s3_session_token: None,
            s3_region: "us-east-1".to_owned(),
        });

        match storage.does_bucket_exist("UPPER").await.unwrap_err() {
            StorageError::InvalidBucketId { bucket_id, .. } => assert_eq!("UPPER", bucket_id),
            e => panic!("Unexpected error {:?}", e),
        }
        match storage.does_object_exist("bucket", "-bad").await.unwrap_err() {
            StorageError::InvalidObjectId { object_id, .. } => assert_eq!("-bad", object_id),
            e => panic!("Unexpected error {:?}", e),
        }
        match storage.get_part_upload_url("u", "bucket", "object", 0).await.unwrap_err() {
            StorageError::Object(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    generate_storage_tests!(
        setup(),
        #[ignore = "Requires environment configuration and is expensive"]
    );
}
