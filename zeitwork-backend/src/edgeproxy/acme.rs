use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Req, X509ReqBuilder, X509};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME directory error: {0}")]
    Directory(String),

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("Challenge validation failed for {0}")]
    ChallengeFailed(String),

    #[error("Order did not become valid: {0}")]
    OrderFailed(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Tokens this edge must answer on port 80 at
/// `/.well-known/acme-challenge/{token}` while validations are in flight.
#[derive(Default)]
pub struct ChallengeStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    pub fn insert(&self, token: String, key_authorization: String) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token, key_authorization);
        }
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().ok()?.get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(token);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newAccount")]
    new_account: String,
    #[serde(rename = "newOrder")]
    new_order: String,
}

#[derive(Debug, Deserialize)]
struct Order {
    status: String,
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: String,
    challenges: Vec<Challenge>,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    #[serde(rename = "type")]
    challenge_type: String,
    url: String,
    token: String,
    status: String,
}

/// Minimal ACME (RFC 8555) client for HTTP-01 issuance.
///
/// Signs requests with an ES256 account key; the caller persists the key
/// so every edge shares one account.
pub struct AcmeClient {
    http: reqwest::Client,
    directory: Directory,
    contact_email: String,
    account_key: PKey<Private>,
    kid: Mutex<Option<String>>,
    nonce: Mutex<Option<String>>,
}

impl AcmeClient {
    pub async fn connect(
        directory_url: &str,
        contact_email: String,
        account_key_pem: &str,
    ) -> Result<Self, AcmeError> {
        let http = reqwest::Client::builder()
            .user_agent("zeitwork-edge")
            .timeout(Duration::from_secs(30))
            .build()?;

        let directory: Directory = http
            .get(directory_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AcmeError::Directory(e.to_string()))?
            .json()
            .await?;

        let ec_key = EcKey::private_key_from_pem(account_key_pem.as_bytes())?;
        let account_key = PKey::from_ec_key(ec_key)?;

        Ok(Self {
            http,
            directory,
            contact_email,
            account_key,
            kid: Mutex::new(None),
            nonce: Mutex::new(None),
        })
    }

    /// Generate a fresh P-256 account (or certificate) key as PEM
    pub fn generate_key_pem() -> Result<String, AcmeError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = EcKey::generate(&group)?;
        let pem = key.private_key_to_pem()?;
        Ok(String::from_utf8_lossy(&pem).to_string())
    }

    /// Run one full HTTP-01 issuance for a hostname.
    ///
    /// Returns `(certificate_chain_pem, private_key_pem)`.
    pub async fn obtain_certificate(
        &self,
        hostname: &str,
        challenges: &ChallengeStore,
    ) -> Result<(String, String), AcmeError> {
        self.ensure_account().await?;

        info!("Requesting certificate order for {}", hostname);
        let (order_url, order) = self.new_order(hostname).await?;

        for authz_url in &order.authorizations {
            self.satisfy_authorization(authz_url, hostname, challenges)
                .await?;
        }

        let cert_key_pem = Self::generate_key_pem()?;
        let csr = build_csr(hostname, &cert_key_pem)?;
        let csr_b64 = URL_SAFE_NO_PAD.encode(csr.to_der()?);

        self.signed_post(&order.finalize, Some(json!({ "csr": csr_b64 })))
            .await?;

        let certificate_url = self.poll_order(&order_url, hostname).await?;
        let chain_pem = self.download_certificate(&certificate_url).await?;

        Ok((chain_pem, cert_key_pem))
    }

    async fn ensure_account(&self) -> Result<(), AcmeError> {
        {
            let kid = self.kid.lock().unwrap_or_else(|e| e.into_inner());
            if kid.is_some() {
                return Ok(());
            }
        }

        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{}", self.contact_email)],
        });
        let response = self
            .raw_signed_post(&self.directory.new_account, Some(payload), false)
            .await?;

        let kid = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("newAccount returned no location".to_string()))?;

        debug!("ACME account registered: {}", kid);
        *self.kid.lock().unwrap_or_else(|e| e.into_inner()) = Some(kid);
        Ok(())
    }

    async fn new_order(&self, hostname: &str) -> Result<(String, Order), AcmeError> {
        let payload = json!({
            "identifiers": [{ "type": "dns", "value": hostname }],
        });
        let response = self
            .signed_post(&self.directory.new_order, Some(payload))
            .await?;

        let order_url = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("newOrder returned no location".to_string()))?;
        let order: Order = response.json().await?;
        Ok((order_url, order))
    }

    async fn satisfy_authorization(
        &self,
        authz_url: &str,
        hostname: &str,
        challenges: &ChallengeStore,
    ) -> Result<(), AcmeError> {
        let authz: Authorization = self.signed_post(authz_url, None).await?.json().await?;
        if authz.status == "valid" {
            return Ok(());
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.challenge_type == "http-01")
            .ok_or_else(|| {
                AcmeError::Protocol(format!("no http-01 challenge offered for {}", hostname))
            })?;

        let key_authorization = format!("{}.{}", challenge.token, self.thumbprint()?);
        challenges.insert(challenge.token.clone(), key_authorization);

        if challenge.status == "pending" {
            self.signed_post(&challenge.url, Some(json!({}))).await?;
        }

        // Poll until the CA validated the token we are now serving.
        let result = async {
            for _ in 0..30 {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let authz: Authorization = self.signed_post(authz_url, None).await?.json().await?;
                match authz.status.as_str() {
                    "valid" => return Ok(()),
                    "pending" => continue,
                    other => {
                        return Err(AcmeError::ChallengeFailed(format!(
                            "{} ({})",
                            hostname, other
                        )))
                    }
                }
            }
            Err(AcmeError::ChallengeFailed(format!("{} (timeout)", hostname)))
        }
        .await;

        challenges.remove(&challenge.token);
        result
    }

    async fn poll_order(&self, order_url: &str, hostname: &str) -> Result<String, AcmeError> {
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let order: Order = self.signed_post(order_url, None).await?.json().await?;
            match order.status.as_str() {
                "valid" => {
                    return order.certificate.ok_or_else(|| {
                        AcmeError::Protocol("valid order without certificate url".to_string())
                    })
                }
                "processing" | "ready" | "pending" => continue,
                other => {
                    return Err(AcmeError::OrderFailed(format!("{} ({})", hostname, other)))
                }
            }
        }
        Err(AcmeError::OrderFailed(format!("{} (timeout)", hostname)))
    }

    async fn download_certificate(&self, certificate_url: &str) -> Result<String, AcmeError> {
        let response = self.signed_post(certificate_url, None).await?;
        Ok(response.text().await?)
    }

    /// POST with a JWS body, kid-authenticated (the default after account
    /// registration). Retries once on a consumed nonce.
    async fn signed_post(
        &self,
        url: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, AcmeError> {
        self.raw_signed_post(url, payload, true).await
    }

    async fn raw_signed_post(
        &self,
        url: &str,
        payload: Option<serde_json::Value>,
        use_kid: bool,
    ) -> Result<reqwest::Response, AcmeError> {
        for attempt in 0..2 {
            let nonce = self.take_nonce().await?;
            let body = self.build_jws(url, payload.as_ref(), &nonce, use_kid)?;

            let response = self
                .http
                .post(url)
                .header("content-type", "application/jose+json")
                .body(body)
                .send()
                .await?;

            self.store_nonce(&response);

            if response.status() == reqwest::StatusCode::BAD_REQUEST && attempt == 0 {
                // Probably urn:ietf:params:acme:error:badNonce; retry once
                // with the fresh nonce we just stored.
                let text = response.text().await.unwrap_or_default();
                if text.contains("badNonce") {
                    debug!("Retrying ACME request after badNonce");
                    continue;
                }
                return Err(AcmeError::Protocol(text));
            }
            if response.status().is_client_error() || response.status().is_server_error() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(AcmeError::Protocol(format!("{}: {}", status, text)));
            }
            return Ok(response);
        }
        Err(AcmeError::Protocol("nonce negotiation failed".to_string()))
    }

    async fn take_nonce(&self) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonce.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Ok(nonce);
        }

        let response = self.http.head(&self.directory.new_nonce).send().await?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("no replay-nonce issued".to_string()))
    }

    fn store_nonce(&self, response: &reqwest::Response) {
        if let Some(nonce) = response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
        {
            *self.nonce.lock().unwrap_or_else(|e| e.into_inner()) = Some(nonce.to_string());
        }
    }

    /// Flattened ES256 JWS over the protected header and payload
    fn build_jws(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        nonce: &str,
        use_kid: bool,
    ) -> Result<String, AcmeError> {
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        if use_kid {
            let kid = self
                .kid
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| AcmeError::Protocol("no account registered".to_string()))?;
            protected["kid"] = json!(kid);
        } else {
            protected["jwk"] = self.jwk()?;
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
        // POST-as-GET uses an empty (not "{}") payload.
        let payload_b64 = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(value.to_string()),
            None => String::new(),
        };

        let signing_input = format!("{}.{}", protected_b64, payload_b64);
        let signature = self.sign_es256(signing_input.as_bytes())?;

        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        })
        .to_string())
    }

    /// ES256 wants a raw `r || s` signature; OpenSSL produces DER
    fn sign_es256(&self, data: &[u8]) -> Result<Vec<u8>, AcmeError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.account_key)?;
        let der = signer.sign_oneshot_to_vec(data)?;

        let sig = EcdsaSig::from_der(&der)?;
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&pad_to_32(&sig.r().to_vec()));
        raw.extend_from_slice(&pad_to_32(&sig.s().to_vec()));
        Ok(raw)
    }

    fn jwk(&self) -> Result<serde_json::Value, AcmeError> {
        let (x, y) = self.public_coordinates()?;
        Ok(json!({
            "crv": "P-256",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        }))
    }

    /// RFC 7638 JWK thumbprint binding challenges to the account key
    fn thumbprint(&self) -> Result<String, AcmeError> {
        let (x, y) = self.public_coordinates()?;
        // Lexicographic member order is part of the thumbprint definition.
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y),
        );
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }

    fn public_coordinates(&self) -> Result<(Vec<u8>, Vec<u8>), AcmeError> {
        let ec_key = self.account_key.ec_key()?;
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        ec_key
            .public_key()
            .affine_coordinates(&group, &mut x, &mut y, &mut ctx)?;
        Ok((pad_to_32(&x.to_vec()), pad_to_32(&y.to_vec())))
    }
}

fn pad_to_32(bytes: &[u8]) -> Vec<u8> {
    let mut padded = vec![0u8; 32_usize.saturating_sub(bytes.len())];
    padded.extend_from_slice(bytes);
    padded
}

/// CSR for a single hostname, signed with the certificate key
fn build_csr(hostname: &str, key_pem: &str) -> Result<X509Req, AcmeError> {
    let ec_key = EcKey::private_key_from_pem(key_pem.as_bytes())?;
    let pkey = PKey::from_ec_key(ec_key)?;

    let mut builder = X509ReqBuilder::new()?;
    builder.set_pubkey(&pkey)?;

    let san = SubjectAlternativeName::new()
        .dns(hostname)
        .build(&builder.x509v3_context(None))?;
    let mut extensions = openssl::stack::Stack::new()?;
    extensions.push(san)?;
    builder.add_extensions(&extensions)?;

    builder.sign(&pkey, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Whether a PEM certificate is inside its renewal window
pub fn needs_renewal(cert_pem: &str, window_days: u32) -> Result<bool, AcmeError> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let threshold = Asn1Time::days_from_now(window_days)?;
    // not_after earlier than (now + window) means we are inside the window.
    Ok(cert.not_after() < &*threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_cert(days: u32) -> String {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = EcKey::generate(&group).unwrap();
        let pkey = PKey::from_ec_key(key).unwrap();

        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_pubkey(&pkey).unwrap();
        let not_before = Asn1Time::days_from_now(0).unwrap();
        let not_after = Asn1Time::days_from_now(days).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();

        String::from_utf8_lossy(&builder.build().to_pem().unwrap()).to_string()
    }

    #[test]
    fn test_needs_renewal_inside_window() {
        let pem = self_signed_cert(10);
        assert!(needs_renewal(&pem, 30).unwrap());
    }

    #[test]
    fn test_no_renewal_outside_window() {
        let pem = self_signed_cert(90);
        assert!(!needs_renewal(&pem, 30).unwrap());
    }

    #[test]
    fn test_generated_key_round_trips_pem() {
        let pem = AcmeClient::generate_key_pem().unwrap();
        assert!(pem.contains("BEGIN EC PRIVATE KEY"));
        EcKey::private_key_from_pem(pem.as_bytes()).unwrap();
    }

    #[test]
    fn test_pad_to_32_left_pads_short_values() {
        assert_eq!(pad_to_32(&[1, 2]).len(), 32);
        assert_eq!(pad_to_32(&[0u8; 32]).len(), 32);
        let padded = pad_to_32(&[0xff]);
        assert_eq!(padded[31], 0xff);
        assert!(padded[..31].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_challenge_store_round_trip() {
        let store = ChallengeStore::default();
        store.insert("tok".to_string(), "tok.thumb".to_string());
        assert_eq!(store.get("tok").as_deref(), Some("tok.thumb"));
        store.remove("tok");
        assert!(store.get("tok").is_none());
    }

    #[test]
    fn test_csr_carries_hostname_san() {
        let key_pem = AcmeClient::generate_key_pem().unwrap();
        let csr = build_csr("app.example.com", &key_pem).unwrap();
        let der = csr.to_der().unwrap();
        assert!(!der.is_empty());
    }
}
