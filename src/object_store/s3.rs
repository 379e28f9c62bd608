use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

use super::{
    DeleteOutcome, KeyDeleteError, ListPage, ObjectStore, ObjectStoreConnector, ObjectStoreError,
    ObjectStoreResult, ObjectSummary,
};
use crate::{config::S3_MAX_KEYS_PER_REQUEST, retention::ObjectStoreCredentials};

/// R2 ignores the region but the SDK requires one.
const R2_REGION: &str = "auto";

/// S3-compatible bucket client (Cloudflare R2, AWS S3, MinIO).
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(credentials: &ObjectStoreCredentials) -> ObjectStoreResult<Self> {
        let (Some(access_key), Some(secret_key)) = (
            credentials.access_key_id.as_deref(),
            credentials.secret_access_key.as_deref(),
        ) else {
            return Err(ObjectStoreError::Config(
                "access key id and secret access key are required".into(),
            ));
        };
        let bucket = credentials
            .bucket_name
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ObjectStoreError::Config("bucket name is required".into()))?;
        let endpoint = credentials.resolve_endpoint().ok_or_else(|| {
            ObjectStoreError::Config("either endpoint or account id is required".into())
        })?;

        info!(bucket = %bucket, endpoint = %endpoint, "Initializing S3 object store client");

        let sdk_credentials = aws_credential_types::Credentials::new(
            access_key,
            secret_key,
            None, // session token
            None, // expiry
            "campus-cleanup",
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(R2_REGION))
            .credentials_provider(sdk_credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket,
        })
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, continuation_token), fields(bucket = %self.bucket))]
    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage> {
        let max_keys = max_keys.clamp(1, S3_MAX_KEYS_PER_REQUEST);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys as i32)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, prefix, "Failed to list objects");
                ObjectStoreError::Request(e.to_string())
            })?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    last_modified: object.last_modified().and_then(to_chrono),
                })
            })
            .collect::<Vec<_>>();

        let next_continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        debug!(prefix, count = objects.len(), more = next_continuation_token.is_some(), "Listed objects");
        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    #[instrument(skip(self, keys), fields(bucket = %self.bucket, batch = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> ObjectStoreResult<DeleteOutcome> {
        if keys.is_empty() {
            return Ok(DeleteOutcome::default());
        }
        if keys.len() > S3_MAX_KEYS_PER_REQUEST as usize {
            return Err(ObjectStoreError::Request(format!(
                "DeleteObjects accepts at most {S3_MAX_KEYS_PER_REQUEST} keys, got {}",
                keys.len()
            )));
        }

        let identifiers = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(false)
            .build()
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to delete objects");
                ObjectStoreError::Request(e.to_string())
            })?;

        let errors = output
            .errors()
            .iter()
            .map(|e| KeyDeleteError {
                key: e.key().unwrap_or_default().to_string(),
                code: e.code().unwrap_or("Unknown").to_string(),
                message: e.message().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(DeleteOutcome {
            deleted: output.deleted().len() as u64,
            errors,
        })
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Builds a fresh [`S3ObjectStore`] from the credentials read for each run.
pub struct S3Connector;

#[async_trait]
impl ObjectStoreConnector for S3Connector {
    async fn connect(
        &self,
        credentials: &ObjectStoreCredentials,
    ) -> ObjectStoreResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::new(credentials).await?))
    }
}
