//! S3 binding of the [`ObjectStore`] capability

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier as S3ObjectIdentifier};
use aws_sdk_s3::{Client, Config};

use crate::error::StoreError;
use crate::{DeleteItemError, ObjectIdent, ObjectStore, PageMarker, VersionEntry, VersionListing};

/// S3 caps ListObjectVersions pages at 1000 keys
const LIST_PAGE_SIZE: i32 = 1000;

/// Service error codes that are worth retrying
const TRANSIENT_CODES: &[&str] = &[
	"InternalError",
	"ServiceUnavailable",
	"SlowDown",
	"RequestTimeout",
	"Throttling",
	"ThrottlingException",
	"RequestLimitExceeded",
];

/// A versioned S3 bucket endpoint, one client per region.
///
/// SDK-level retries are disabled: retry decisions belong to
/// [`RetryPolicy`](crate::retry::RetryPolicy) in the pipelines, which
/// classifies errors through [`StoreError`].
pub struct S3Store {
	client: Client,
}

impl S3Store {
	pub fn new(region: &str, access_key: &str, secret_key: &str) -> Self {
		let credentials = Credentials::new(
			access_key.to_string(),
			secret_key.to_string(),
			None,
			None,
			"backup-my-bucket",
		);
		let config = Config::builder()
			.behavior_version(BehaviorVersion::latest())
			.region(Region::new(region.to_string()))
			.credentials_provider(credentials)
			.retry_config(RetryConfig::disabled())
			.build();
		Self {
			client: Client::from_conf(config),
		}
	}
}

#[async_trait]
impl ObjectStore for S3Store {
	async fn list_object_versions(
		&self,
		bucket: &str,
		prefix: &str,
		delimiter: &str,
		marker: Option<PageMarker>,
	) -> Result<VersionListing, StoreError> {
		let mut req = self
			.client
			.list_object_versions()
			.bucket(bucket)
			.prefix(prefix)
			.delimiter(delimiter)
			.max_keys(LIST_PAGE_SIZE);
		if let Some(marker) = marker {
			req = req
				.set_key_marker(marker.key_marker)
				.set_version_id_marker(marker.version_id_marker);
		}
		let resp = req.send().await.map_err(classify)?;

		let common_prefixes = resp
			.common_prefixes()
			.iter()
			.filter_map(|cp| cp.prefix().map(str::to_string))
			.collect();

		let mut versions = Vec::with_capacity(resp.versions().len());
		for v in resp.versions() {
			let last_modified = match v.last_modified() {
				Some(d) => Utc
					.timestamp_opt(d.secs(), d.subsec_nanos())
					.single()
					.ok_or_else(|| {
						StoreError::Fatal(format!("invalid LastModified timestamp: {:?}", d))
					})?,
				None => {
					return Err(StoreError::Fatal(format!(
						"listing entry without LastModified: {:?}",
						v.key()
					)))
				}
			};
			versions.push(VersionEntry {
				key: v.key().unwrap_or_default().to_string(),
				version_id: v.version_id().unwrap_or_default().to_string(),
				last_modified,
				size: v.size().unwrap_or_default(),
				is_latest: v.is_latest().unwrap_or_default(),
			});
		}

		let next_marker = if resp.is_truncated().unwrap_or_default() {
			Some(PageMarker {
				key_marker: resp.next_key_marker().map(str::to_string),
				version_id_marker: resp.next_version_id_marker().map(str::to_string),
			})
		} else {
			None
		};

		Ok(VersionListing {
			common_prefixes,
			versions,
			next_marker,
		})
	}

	async fn get_object(
		&self,
		bucket: &str,
		key: &str,
		version_id: &str,
	) -> Result<Bytes, StoreError> {
		let resp = self
			.client
			.get_object()
			.bucket(bucket)
			.key(key)
			.version_id(version_id)
			.send()
			.await
			.map_err(classify)?;
		let body = resp
			.body
			.collect()
			.await
			.map_err(|e| StoreError::Transient(format!("reading body of {}: {}", key, e)))?;
		Ok(body.into_bytes())
	}

	async fn put_object(
		&self,
		bucket: &str,
		key: &str,
		body: Bytes,
	) -> Result<String, StoreError> {
		let resp = self
			.client
			.put_object()
			.bucket(bucket)
			.key(key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(classify)?;
		Ok(resp.version_id().unwrap_or_default().to_string())
	}

	async fn delete_objects(
		&self,
		bucket: &str,
		objects: &[ObjectIdent],
	) -> Result<Vec<DeleteItemError>, StoreError> {
		let mut idents = Vec::with_capacity(objects.len());
		for obj in objects {
			let ident = S3ObjectIdentifier::builder()
				.key(&obj.key)
				.version_id(&obj.version_id)
				.build()
				.map_err(|e| StoreError::Fatal(format!("building delete request: {}", e)))?;
			idents.push(ident);
		}
		let delete = Delete::builder()
			.set_objects(Some(idents))
			.quiet(true)
			.build()
			.map_err(|e| StoreError::Fatal(format!("building delete request: {}", e)))?;

		let resp = self
			.client
			.delete_objects()
			.bucket(bucket)
			.delete(delete)
			.send()
			.await
			.map_err(classify)?;

		Ok(resp
			.errors()
			.iter()
			.map(|e| DeleteItemError {
				key: e.key().unwrap_or_default().to_string(),
				version_id: e.version_id().unwrap_or_default().to_string(),
				code: e.code().unwrap_or_default().to_string(),
				message: e.message().unwrap_or_default().to_string(),
			})
			.collect())
	}
}

/// Map an SDK error onto the transient / no-such-version / fatal taxonomy
fn classify<E>(err: SdkError<E>) -> StoreError
where
	E: ProvideErrorMetadata + std::fmt::Debug,
{
	match &err {
		SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
			StoreError::Transient(format!("{:?}", err))
		}
		SdkError::ServiceError(ctx) => {
			let code = ctx.err().code().unwrap_or_default().to_string();
			let message = ctx.err().message().unwrap_or_default().to_string();
			if code == "NoSuchVersion" {
				StoreError::NoSuchVersion(message)
			} else if TRANSIENT_CODES.contains(&code.as_str()) {
				StoreError::Transient(format!("{}: {}", code, message))
			} else {
				StoreError::Fatal(format!("{}: {}", code, message))
			}
		}
		_ => StoreError::Fatal(format!("{:?}", err)),
	}
}
