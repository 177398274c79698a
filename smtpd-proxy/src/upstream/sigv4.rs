//! AWS Signature Version 4 request signing

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use ring::{digest, hmac};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Credentials and scope of one signature
#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Headers to add to the signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub authorization: String,
    /// Value of `x-amz-date`
    pub amz_date: String,
    /// Hex encoded SHA-256 of the payload
    pub payload_hash: String,
}

/// HTTP request parts covered by the signature
#[derive(Debug, Clone)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    /// Already URI-encoded path
    pub path: &'a str,
    /// Already encoded query string without the leading `?`
    pub query: &'a str,
    /// Header names are lowercased before signing; `host` must be present
    pub headers: &'a BTreeMap<String, String>,
    pub payload: &'a [u8],
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest::digest(&digest::SHA256, data).as_ref())
}

fn signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Sign a request; `x-amz-date` is added to the signed headers
pub fn sign(params: &SigningParams<'_>, request: &CanonicalRequest<'_>) -> Signature {
    let amz_date = params.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = params.timestamp.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(request.payload);

    let mut headers: BTreeMap<String, String> = request
        .headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .collect();
    headers.insert("x-amz-date".to_string(), amz_date.clone());

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let path = if request.path.is_empty() { "/" } else { request.path };
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method, path, request.query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, params.region, params.service
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(
        params.secret_access_key,
        &date_stamp,
        params.region,
        params.service,
    );
    let signature = HEXLOWER.encode(&hmac_sha256(&key, string_to_sign.as_bytes()));

    Signature {
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, params.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
        payload_hash,
    }
}
