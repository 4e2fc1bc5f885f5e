//! Minimal S3-compatible client: path-style bucket creation signed with SigV4

use crate::error::{HarnessError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Result of an idempotent bucket creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    Created,
    AlreadyExists,
}

/// Static credentials for request signing
#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct S3Client {
    /// `host:port`, no scheme
    authority: String,
    credentials: SigningCredentials,
    client: reqwest::Client,
}

impl S3Client {
    pub fn new(authority: &str, credentials: SigningCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            authority: authority.to_string(),
            credentials,
            client,
        })
    }

    /// `PUT /{bucket}`; a 409 means the bucket is already there
    pub async fn create_bucket(&self, bucket: &str) -> Result<BucketOutcome> {
        let path = format!("/{}", bucket);
        let headers = sign_request(
            "PUT",
            &path,
            &self.authority,
            &[],
            &self.credentials,
            Utc::now(),
        )?;

        let mut request = self
            .client
            .put(format!("http://{}{}", self.authority, path));
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;

        match response.status().as_u16() {
            200..=299 => Ok(BucketOutcome::Created),
            409 => Ok(BucketOutcome::AlreadyExists),
            status => Err(HarnessError::UnexpectedStatus {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Headers (`x-amz-date`, `x-amz-content-sha256`, `authorization`) for a
/// request without query string.
pub fn sign_request(
    method: &str,
    path: &str,
    host: &str,
    payload: &[u8],
    credentials: &SigningCredentials,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(payload));

    let canonical_request = format!(
        "{method}\n{path}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    );

    let scope = format!("{}/{}/s3/aws4_request", date_stamp, credentials.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_key, &date_stamp, &credentials.region, "s3")?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key, scope, SIGNED_HEADERS, signature
    );

    Ok(vec![
        ("x-amz-date".to_string(), amz_date),
        ("x-amz-content-sha256".to_string(), payload_hash),
        ("authorization".to_string(), authorization),
    ])
}

/// Derive the SigV4 signing key for one day, region and service
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| HarnessError::Config(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
