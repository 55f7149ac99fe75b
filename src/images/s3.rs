//! S3-compatible object store client (MinIO, AWS S3).
//!
//! Path-style requests signed with AWS Signature Version 4. One `ureq::Agent`
//! is shared by all workers; it pools connections and is safe to use from
//! several threads.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use super::object_store::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_BYTES: u64 = 64 * 1024 * 1024;
const MAX_ERROR_BODY_BYTES: u64 = 4 * 1024;

#[derive(Clone, Debug)]
pub struct S3Config {
    /// Service endpoint, e.g. `http://localhost:9000`.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Base for public object URLs; defaults to the endpoint.
    pub public_url: Option<String>,
    pub timeout: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            public_url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct S3ObjectStore {
    agent: ureq::Agent,
    base: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
    public_base: String,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("parse object store endpoint {}", config.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "object store endpoint must be http(s), got '{}'",
                endpoint.scheme()
            ));
        }
        let host_name = endpoint
            .host_str()
            .ok_or_else(|| anyhow!("object store endpoint has no host"))?;
        let host = match endpoint.port() {
            Some(port) => format!("{}:{}", host_name, port),
            None => host_name.to_string(),
        };
        let base = config.endpoint.trim_end_matches('/').to_string();
        let public_base = config
            .public_url
            .as_deref()
            .unwrap_or(&base)
            .trim_end_matches('/')
            .to_string();
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            agent,
            base,
            host,
            region: config.region,
            access_key: config.access_key,
            secret_key: config.secret_key,
            public_base,
        })
    }

    fn send(
        &self,
        method: &str,
        bucket: &str,
        key: Option<&str>,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ureq::Response> {
        let path = match key {
            Some(key) => format!("/{}/{}", bucket, uri_encode_path(key)),
            None => format!("/{}", bucket),
        };
        let signed = sign_request(
            &SigningParams {
                method,
                host: &self.host,
                path: &path,
                region: &self.region,
                access_key: &self.access_key,
                secret_key: &self.secret_key,
                content_type,
            },
            body,
            Utc::now(),
        )?;
        let mut request = self.agent.request(method, &format!("{}{}", self.base, path));
        for (name, value) in &signed.headers {
            if name != "host" {
                request = request.set(name, value);
            }
        }
        request = request.set("authorization", &signed.authorization);
        let response = if matches!(method, "GET" | "HEAD") {
            request.call()
        } else {
            request.send_bytes(body)
        };
        response.map_err(|e| anyhow::Error::new(RequestError::from(e)))
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.send("HEAD", bucket, None, &[], None) {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("check bucket {}", bucket)),
        }
    }

    fn make_bucket(&self, bucket: &str) -> Result<()> {
        match self.send("PUT", bucket, None, &[], None) {
            Ok(_) => Ok(()),
            // Another worker created it first.
            Err(e) if status_of(&e) == Some(409) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("create bucket {}", bucket)),
        }
    }

    fn put_object(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.send("PUT", bucket, Some(key), bytes, Some(content_type))
            .with_context(|| format!("upload {}/{}", bucket, key))?;
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .send("GET", bucket, Some(key), &[], None)
            .with_context(|| format!("download {}/{}", bucket, key))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_OBJECT_BYTES)
            .read_to_end(&mut bytes)
            .context("read object body")?;
        Ok(bytes)
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.public_base, bucket, uri_encode_path(key))
    }
}

/// Failed object store request. Keeps the HTTP status so callers can treat
/// some codes as success.
#[derive(Debug)]
struct RequestError {
    status: Option<u16>,
    message: String,
}

impl From<ureq::Error> for RequestError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::Status(code, response) => {
                let mut body = String::new();
                let _ = response
                    .into_reader()
                    .take(MAX_ERROR_BODY_BYTES)
                    .read_to_string(&mut body);
                Self {
                    status: Some(code),
                    message: format!("object store returned HTTP {}: {}", code, body.trim()),
                }
            }
            ureq::Error::Transport(transport) => Self {
                status: None,
                message: format!("object store unreachable: {}", transport),
            },
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RequestError {}

fn status_of(error: &anyhow::Error) -> Option<u16> {
    error
        .downcast_ref::<RequestError>()
        .and_then(|e| e.status)
}

struct SigningParams<'a> {
    method: &'a str,
    host: &'a str,
    /// Already URI-encoded.
    path: &'a str,
    region: &'a str,
    access_key: &'a str,
    secret_key: &'a str,
    content_type: Option<&'a str>,
}

#[derive(Debug)]
struct SignedRequest {
    /// Lowercase names, sorted; includes `host`.
    headers: Vec<(String, String)>,
    authorization: String,
}

fn sign_request(
    params: &SigningParams<'_>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(body));

    let mut headers = vec![
        ("host".to_string(), params.host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(content_type) = params.content_type {
        headers.push(("content-type".to_string(), content_type.to_string()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        params.method, params.path, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date, params.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{}", params.secret_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, params.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            params.access_key, scope, signed_headers, signature
        ),
        headers,
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| anyhow!("hmac key rejected: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode each path segment per SigV4 (unreserved characters kept).
fn uri_encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let mut out = String::with_capacity(segment.len());
            for byte in segment.bytes() {
                if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
                    out.push(byte as char);
                } else {
                    out.push_str(&format!("%{:02X}", byte));
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encodes_path_segments() {
        assert_eq!(
            uri_encode_path("violations/camera_1_20240101_120000_30.jpg"),
            "violations/camera_1_20240101_120000_30.jpg"
        );
        assert_eq!(uri_encode_path("a b/c+d"), "a%20b/c%2Bd");
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() -> Result<()> {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?")?;
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        Ok(())
    }

    #[test]
    fn signature_scope_and_headers() -> Result<()> {
        let now = Utc.with_ymd_and_hms(2013, 5, 24, 0, 0, 0).unwrap();
        let signed = sign_request(
            &SigningParams {
                method: "PUT",
                host: "localhost:9000",
                path: "/city-monitoring/violations/a.jpg",
                region: "us-east-1",
                access_key: "AKIDEXAMPLE",
                secret_key: "secret",
                content_type: Some("image/jpeg"),
            },
            b"jpeg",
            now,
        )?;
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20130524/us-east-1/s3/aws4_request, \
             SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let names: Vec<_> = signed.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["content-type", "host", "x-amz-content-sha256", "x-amz-date"]
        );
        assert!(signed
            .headers
            .contains(&("x-amz-date".to_string(), "20130524T000000Z".to_string())));
        Ok(())
    }

    #[test]
    fn public_url_uses_public_base() -> Result<()> {
        let store = S3ObjectStore::new(S3Config {
            public_url: Some("https://cdn.example.org/".to_string()),
            ..S3Config::default()
        })?;
        assert_eq!(
            store.public_url("city-monitoring", "violations/x.jpg"),
            "https://cdn.example.org/city-monitoring/violations/x.jpg"
        );
        Ok(())
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let config = S3Config {
            endpoint: "ftp://storage".to_string(),
            ..S3Config::default()
        };
        assert!(S3ObjectStore::new(config).is_err());
    }

    #[test]
    fn unreachable_endpoint_fails_fast() -> Result<()> {
        let store = S3ObjectStore::new(S3Config {
            // Port 9 (discard) on loopback is closed in test environments.
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(2),
            ..S3Config::default()
        })?;
        assert!(store.put_object("b", "k", b"x", "image/jpeg").is_err());
        Ok(())
    }
}
