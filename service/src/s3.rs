// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use nodewarden_core::carvers::CarveBackend;
use nodewarden_core::errors::CoreError;

use crate::configuration::ServiceOptions;
use crate::errors::AppError;

/// Uploads carve archives to an S3 bucket as `{key}.tar`.
pub struct S3Carver {
    client: Client,
    bucket: String,
}

impl S3Carver {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Builds the client from the default provider chain, overridden by the
    /// static keys and region in `options` when they are set.
    pub async fn from_options(options: &ServiceOptions) -> Result<Self, AppError> {
        let bucket = options
            .carver_s3_bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| AppError::ConfigError("s3 carver needs a bucket".to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &options.carver_s3_region {
            loader = loader.region(Region::new(region.clone()));
        }
        match (&options.carver_s3_key_id, &options.carver_s3_secret) {
            (Some(key_id), Some(secret)) => {
                let credentials =
                    Credentials::from_keys(key_id.clone(), secret.clone(), None);
                loader = loader.credentials_provider(credentials);
            }
            (None, None) => {}
            _ => {
                return Err(AppError::ConfigError(
                    "s3 key id and secret must be set together".to_string(),
                ));
            }
        }
        let config = loader.load().await;

        tracing::info!("[service] storing carves in s3://{}", bucket);
        Ok(Self::new(Client::new(&config), bucket))
    }

    fn object_key(key: &str) -> String {
        format!("{key}.tar")
    }
}

#[async_trait]
impl CarveBackend for S3Carver {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn store(&self, key: &str, archive: Vec<u8>) -> Result<String, CoreError> {
        let object_key = Self::object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type("application/x-tar")
            .body(ByteStream::from(archive))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("[service] s3 upload of {} failed: {:?}", object_key, e);
                CoreError::ReconstructionError(e.to_string())
            })?;
        Ok(format!("s3://{}/{}", self.bucket, object_key))
    }
}
