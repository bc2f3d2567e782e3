use std::time::Duration;

use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use docbroker_core::{BrokerError, Result};
use tracing::warn;

/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;
/// Maximum retries for compare-and-swap loops.
pub(crate) const CAS_MAX_RETRIES: u32 = 10;

/// Object to write, with optional content type and user metadata.
#[derive(Debug, Default)]
pub(crate) struct PutOptions<'a> {
    pub content_type: Option<&'a str>,
    pub metadata: Option<(&'a str, &'a str)>,
}

/// One R2 bucket accessed through the S3-compatible API, with retry on transient errors and
/// ETag-based conditional writes.
#[derive(Clone)]
pub struct R2Bucket {
    s3_client: S3Client,
    bucket_name: String,
    base_delay: Duration,
}

impl R2Bucket {
    pub fn new(s3_client: S3Client, bucket_name: impl Into<String>) -> Self {
        Self {
            s3_client,
            bucket_name: bucket_name.into(),
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        }
    }

    /// Client for `https://{account_id}.r2.cloudflarestorage.com`.
    pub fn connect(
        account_id: &str,
        access_key_id: &str,
        secret_access_key: &str,
        bucket_name: impl Into<String>,
    ) -> Self {
        Self::at_endpoint(
            &format!("https://{}.r2.cloudflarestorage.com", account_id),
            access_key_id,
            secret_access_key,
            bucket_name,
        )
    }

    /// Client for any S3-compatible endpoint, addressed path-style.
    pub fn at_endpoint(
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        bucket_name: impl Into<String>,
    ) -> Self {
        let credentials =
            Credentials::new(access_key_id, secret_access_key, None, None, "r2");
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        Self::new(S3Client::from_conf(s3_config), bucket_name)
    }

    /// Base delay of the exponential backoff between retries.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Sleep with exponential backoff + jitter.
    pub(crate) async fn backoff_sleep(&self, attempt: u32) {
        let base = self.base_delay * 2u32.pow(attempt.min(6));
        let jitter = Duration::from_millis(rand_jitter(self.base_delay));
        tokio::time::sleep(base + jitter).await;
    }

    fn is_retryable(err: &aws_sdk_s3::error::SdkError<impl std::fmt::Debug>) -> bool {
        use aws_sdk_s3::error::SdkError;
        let retryable_status = |status: u16| status == 429 || (500..=504).contains(&status);
        match err {
            SdkError::ServiceError(e) => retryable_status(e.raw().status().as_u16()),
            SdkError::ResponseError(e) => retryable_status(e.raw().status().as_u16()),
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
            _ => false,
        }
    }

    fn is_precondition_failed(err: &aws_sdk_s3::error::SdkError<impl std::fmt::Debug>) -> bool {
        use aws_sdk_s3::error::SdkError;
        match err {
            SdkError::ServiceError(e) => e.raw().status().as_u16() == 412,
            SdkError::ResponseError(e) => e.raw().status().as_u16() == 412,
            _ => false,
        }
    }

    /// Get an object, `None` if it does not exist.
    pub(crate) async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_object_with_etag(key).await?.map(|(data, _)| data))
    }

    /// Get an object along with its ETag, `None` if it does not exist.
    pub(crate) async fn get_object_with_etag(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let mut attempt = 0;
        loop {
            let result = self
                .s3_client
                .get_object()
                .bucket(&self.bucket_name)
                .key(key)
                .send()
                .await;

            match result {
                Ok(output) => {
                    let etag = output.e_tag().unwrap_or("").to_string();
                    let bytes = output
                        .body
                        .collect()
                        .await
                        .map_err(|e| {
                            BrokerError::Transport(format!("Failed to read R2 object body: {}", e))
                        })?
                        .into_bytes();
                    return Ok(Some((bytes.to_vec(), etag)));
                }
                Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES => {
                    warn!(attempt, key, "R2 get_object retryable error, retrying");
                    self.backoff_sleep(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(BrokerError::Transport(format!(
                        "R2 get_object {} error: {}",
                        key, service_error
                    )));
                }
            }
        }
    }

    /// Unconditional put.
    pub(crate) async fn put_object(
        &self,
        key: &str,
        data: &[u8],
        options: PutOptions<'_>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(key)
                .body(ByteStream::from(data.to_vec()));
            if let Some(content_type) = options.content_type {
                request = request.content_type(content_type);
            }
            if let Some((name, value)) = options.metadata {
                request = request.metadata(name, value);
            }

            match request.send().await {
                Ok(_) => return Ok(()),
                Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES => {
                    warn!(attempt, key, "R2 put_object retryable error, retrying");
                    self.backoff_sleep(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BrokerError::Transport(format!(
                        "R2 put_object {} error: {}",
                        key, e
                    )))
                }
            }
        }
    }

    /// Conditionally put an object using ETag.
    ///
    /// - `Some(etag)`: `If-Match` (update the version that was read).
    /// - `None`: `If-None-Match: *` (create, fail if it exists).
    ///
    /// Returns the new ETag, or `Conflict` on 412.
    pub(crate) async fn put_object_conditional(
        &self,
        key: &str,
        data: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<String> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(key)
                .content_type("application/json")
                .body(ByteStream::from(data.to_vec()));
            request = match expected_etag {
                Some(etag) => request.if_match(etag),
                None => request.if_none_match("*"),
            };

            match request.send().await {
                Ok(output) => return Ok(output.e_tag().unwrap_or("").to_string()),
                Err(e) if Self::is_precondition_failed(&e) => {
                    return Err(BrokerError::Conflict(format!(
                        "{} was modified concurrently",
                        key
                    )));
                }
                Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES => {
                    warn!(attempt, key, "R2 put_object_conditional retryable error, retrying");
                    self.backoff_sleep(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BrokerError::Transport(format!(
                        "R2 put_object_conditional {} error: {}",
                        key, e
                    )))
                }
            }
        }
    }

    /// Delete an object. Deleting a missing key succeeds.
    pub(crate) async fn delete_object(&self, key: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = self
                .s3_client
                .delete_object()
                .bucket(&self.bucket_name)
                .key(key)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES => {
                    warn!(attempt, key, "R2 delete_object retryable error, retrying");
                    self.backoff_sleep(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BrokerError::Transport(format!(
                        "R2 delete_object {} error: {}",
                        key, e
                    )))
                }
            }
        }
    }

    /// Keys under a prefix in ascending order, following continuation tokens.
    /// Stops once `limit` keys were collected.
    pub(crate) async fn list_objects(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let mut attempt = 0;
            let output = loop {
                match request.clone().send().await {
                    Ok(output) => break output,
                    Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES => {
                        warn!(attempt, prefix, "R2 list_objects retryable error, retrying");
                        self.backoff_sleep(attempt).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        return Err(BrokerError::Transport(format!(
                            "R2 list_objects {} error: {}",
                            prefix, e
                        )))
                    }
                }
            };

            keys.extend(output.contents.unwrap_or_default().into_iter().filter_map(|o| o.key));
            if let Some(limit) = limit.filter(|&limit| keys.len() >= limit) {
                keys.truncate(limit);
                break;
            }
            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

/// Up to a quarter of the base delay, in milliseconds.
fn rand_jitter(base_delay: Duration) -> u64 {
    use std::time::SystemTime;
    let bound = (base_delay.as_millis() as u64 / 4).max(1);
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % bound)
        .unwrap_or(0)
}
