use anyhow::{Context, Result};
use openssl::ec::EcKey;
use openssl::pkey::PKey;
use openssl::x509::X509;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::routing::normalize_host;

/// SNI-keyed certificate resolver backed by the shared certificate table.
///
/// The refresh loop rebuilds the map from storage; resolution itself is a
/// lock-free-enough read per handshake.
pub struct SniResolver {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Swap in a freshly loaded certificate set
    pub fn replace(&self, certs: HashMap<String, Arc<CertifiedKey>>) {
        if let Ok(mut current) = self.certs.write() {
            *current = certs;
        }
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .read()
            .ok()?
            .get(&normalize_host(hostname))
            .cloned()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.certs
            .read()
            .map(|certs| certs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for SniResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.certs.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("SniResolver").field("certs", &count).finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        let certified = self.get(server_name);
        if certified.is_none() {
            debug!("No certificate for SNI {}", server_name);
        }
        certified
    }
}

/// Convert a PEM chain + PEM key from storage into a rustls CertifiedKey
pub fn certified_key_from_pem(chain_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let chain = X509::stack_from_pem(chain_pem.as_bytes())
        .context("Failed to parse certificate chain")?;
    if chain.is_empty() {
        anyhow::bail!("Certificate chain is empty");
    }

    let mut certs = Vec::with_capacity(chain.len());
    for cert in chain {
        certs.push(CertificateDer::from(
            cert.to_der().context("Failed to encode certificate")?,
        ));
    }

    let ec_key =
        EcKey::private_key_from_pem(key_pem.as_bytes()).context("Failed to parse private key")?;
    let pkey = PKey::from_ec_key(ec_key).context("Failed to wrap private key")?;
    let pkcs8 = pkey
        .private_key_to_pkcs8()
        .context("Failed to encode private key")?;
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8));

    let signing_key =
        any_supported_type(&key_der).context("Private key type not supported by rustls")?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::ec::EcGroup;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn self_signed(hostname: &str) -> (String, String) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec_key = EcKey::generate(&group).unwrap();
        let pkey = PKey::from_ec_key(ec_key.clone()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", hostname).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        let not_before = Asn1Time::days_from_now(0).unwrap();
        let not_after = Asn1Time::days_from_now(30).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();

        let cert_pem = String::from_utf8_lossy(&builder.build().to_pem().unwrap()).to_string();
        let key_pem = String::from_utf8_lossy(&ec_key.private_key_to_pem().unwrap()).to_string();
        (cert_pem, key_pem)
    }

    #[test]
    fn test_certified_key_from_pem_parses_self_signed() {
        let (cert_pem, key_pem) = self_signed("app.example.com");
        let certified = certified_key_from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_rejects_garbage() {
        assert!(certified_key_from_pem("not pem", "not pem").is_err());
    }

    #[test]
    fn test_resolver_lookup_is_case_insensitive() {
        let (cert_pem, key_pem) = self_signed("app.example.com");
        let certified = Arc::new(certified_key_from_pem(&cert_pem, &key_pem).unwrap());

        let resolver = SniResolver::new();
        let mut certs = HashMap::new();
        certs.insert("app.example.com".to_string(), certified);
        resolver.replace(certs);

        assert!(resolver.get("APP.example.COM").is_some());
        assert!(resolver.get("other.example.com").is_none());
    }

    #[test]
    fn test_replace_swaps_the_whole_set() {
        let (cert_pem, key_pem) = self_signed("a.example.com");
        let certified = Arc::new(certified_key_from_pem(&cert_pem, &key_pem).unwrap());

        let resolver = SniResolver::new();
        let mut certs = HashMap::new();
        certs.insert("a.example.com".to_string(), certified);
        resolver.replace(certs);
        assert_eq!(resolver.hostnames().len(), 1);

        resolver.replace(HashMap::new());
        assert!(resolver.get("a.example.com").is_none());
    }
}
