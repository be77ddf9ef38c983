pub mod acme;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod tls;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::db::{certs, domains as db_domains};
use crate::events;
use crate::settings::EdgeSettings;
use crate::state::ControllerState;

use acme::{AcmeClient, ChallengeStore};
use proxy::ProxyShared;
use routing::RoutingTable;
use tls::SniResolver;

/// Storage key for the shared ACME account key
const ACCOUNT_KEY: &str = "acme/account.key";

/// Renewal window in days before expiry
const RENEWAL_WINDOW_DAYS: u32 = 30;

/// TTL of a per-hostname issuance lock
const ISSUANCE_LOCK_TTL_SECS: i64 = 120;

/// The TLS-terminating reverse proxy at the edge of a region.
///
/// Stateless apart from in-memory snapshots: the routing table and the
/// certificate set are rebuilt from the database on a fixed cadence and on
/// change notifications.
pub struct EdgeProxy {
    state: Arc<ControllerState>,
    settings: EdgeSettings,
    database_url: String,
    shared: Arc<ProxyShared>,
    resolver: Arc<SniResolver>,
    challenges: Arc<ChallengeStore>,
}

impl EdgeProxy {
    pub fn new(
        state: Arc<ControllerState>,
        settings: EdgeSettings,
        database_url: String,
    ) -> Result<Self> {
        let shared = Arc::new(ProxyShared::new(
            Duration::from_secs(settings.upstream_timeout_secs),
            settings.rate_limit_rps,
        )?);

        Ok(Self {
            state,
            settings,
            database_url,
            shared,
            resolver: Arc::new(SniResolver::new()),
            challenges: Arc::new(ChallengeStore::default()),
        })
    }

    /// Serve until the process shuts down
    pub async fn run(self: Arc<Self>) -> Result<()> {
        rustls::crypto::ring::default_provider().install_default().ok();

        info!("Edge proxy {} starting", self.settings.id);

        // Initial snapshots before accepting traffic.
        if let Err(e) = self.refresh().await {
            warn!("Initial routing refresh failed: {:#}", e);
        }

        let refresher = self.clone();
        tokio::spawn(async move {
            refresher.refresh_loop().await;
        });

        let maintainer = self.clone();
        tokio::spawn(async move {
            maintainer.certificate_loop().await;
        });

        let challenge_server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = challenge_server.serve_http().await {
                error!("HTTP listener failed: {:#}", e);
            }
        });

        self.serve_https().await
    }

    /// Rebuild the routing snapshot and certificate set on a poll cadence,
    /// waking early on change notifications.
    async fn refresh_loop(&self) {
        let tick = Duration::from_secs(self.settings.refresh_secs);
        let mut wakeups = match events::subscribe(&self.database_url).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Event subscription unavailable, relying on polling: {}", e);
                None
            }
        };

        loop {
            match wakeups.as_mut() {
                Some(rx) => events::next_wakeup(rx, tick).await,
                None => tokio::time::sleep(tick).await,
            }
            if let Err(e) = self.refresh().await {
                warn!("Routing refresh failed: {:#}", e);
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        let rows = db_domains::list_routes(&self.state.db_pool).await?;
        let table = RoutingTable::from_rows(rows);
        debug!("Routing table refreshed: {} host(s)", table.len());

        let mut certificates = HashMap::new();
        for hostname in table.hostnames() {
            match self.load_certificate(hostname).await {
                Ok(Some(certified)) => {
                    certificates.insert(hostname.clone(), Arc::new(certified));
                }
                Ok(None) => debug!("No stored certificate for {}", hostname),
                Err(e) => warn!("Failed to load certificate for {}: {:#}", hostname, e),
            }
        }
        self.resolver.replace(certificates);

        self.shared.swap(table);
        Ok(())
    }

    async fn load_certificate(
        &self,
        hostname: &str,
    ) -> Result<Option<rustls::sign::CertifiedKey>> {
        let pool = &self.state.db_pool;
        let Some(chain) = certs::get(pool, &cert_storage_key(hostname)).await? else {
            return Ok(None);
        };
        let Some(key) = certs::get(pool, &key_storage_key(hostname)).await? else {
            return Ok(None);
        };

        let certified = tls::certified_key_from_pem(
            &String::from_utf8_lossy(&chain),
            &String::from_utf8_lossy(&key),
        )?;
        Ok(Some(certified))
    }

    /// Obtain missing certificates and renew expiring ones. Issuance is
    /// serialized per hostname across all edges by a TTL lock.
    async fn certificate_loop(&self) {
        if self.settings.acme_email.is_none() {
            info!("No ACME contact configured; certificate issuance disabled");
            return;
        }

        // Let the first routing refresh land, then check hourly.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut ticker = interval(Duration::from_secs(3600));

        loop {
            if let Err(e) = self.maintain_certificates().await {
                warn!("Certificate maintenance failed: {:#}", e);
            }
            ticker.tick().await;
        }
    }

    async fn maintain_certificates(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        let hostnames: Vec<String> = {
            let table = self.shared.snapshot();
            table.hostnames().cloned().collect()
        };
        if hostnames.is_empty() {
            return Ok(());
        }

        let client = self.acme_client().await?;

        for hostname in hostnames {
            let stored = certs::get(pool, &cert_storage_key(&hostname)).await?;
            let due = match &stored {
                None => true,
                Some(chain) => {
                    acme::needs_renewal(&String::from_utf8_lossy(chain), RENEWAL_WINDOW_DAYS)
                        .unwrap_or(true)
                }
            };
            if !due {
                continue;
            }

            let lock_key = format!("issue/{}", hostname);
            if !certs::lock_acquire(pool, &lock_key, &self.settings.id, ISSUANCE_LOCK_TTL_SECS)
                .await?
            {
                debug!("Another edge is issuing for {}", hostname);
                continue;
            }

            let outcome = client.obtain_certificate(&hostname, &self.challenges).await;
            match outcome {
                Ok((chain_pem, key_pem)) => {
                    certs::put(pool, &cert_storage_key(&hostname), chain_pem.as_bytes()).await?;
                    certs::put(pool, &key_storage_key(&hostname), key_pem.as_bytes()).await?;
                    info!("Issued certificate for {}", hostname);
                }
                Err(e) => warn!("Certificate issuance for {} failed: {:#}", hostname, e),
            }
            certs::lock_release(pool, &lock_key, &self.settings.id).await?;
        }

        // Serve anything newly issued (here or on another edge).
        self.refresh().await
    }

    /// Build the ACME client with the shared account key, creating and
    /// persisting the key on first use.
    async fn acme_client(&self) -> Result<AcmeClient> {
        let pool = &self.state.db_pool;
        let email = self
            .settings
            .acme_email
            .clone()
            .context("ACME email not configured")?;

        let account_key_pem = match certs::get(pool, ACCOUNT_KEY).await? {
            Some(pem) => String::from_utf8_lossy(&pem).to_string(),
            None => {
                let pem = AcmeClient::generate_key_pem()?;
                certs::put(pool, ACCOUNT_KEY, pem.as_bytes()).await?;
                info!("Generated shared ACME account key");
                pem
            }
        };

        let client =
            AcmeClient::connect(&self.settings.acme_directory, email, &account_key_pem).await?;
        Ok(client)
    }

    /// Port 80: ACME challenge responses, everything else redirected to
    /// HTTPS.
    async fn serve_http(&self) -> Result<()> {
        let app = Router::new()
            .route(
                "/.well-known/acme-challenge/{token}",
                get(serve_challenge),
            )
            .fallback(redirect_to_https)
            .with_state(self.challenges.clone());

        let addr = format!("[::]:{}", self.settings.http_port);
        info!("HTTP listener on {}", addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Port 443: TLS termination and proxying. Handshake failures drop the
    /// connection without a response.
    async fn serve_https(&self) -> Result<()> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let addr = format!("[::]:{}", self.settings.https_port);
        info!("HTTPS listener on {}", addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                };

                let service = hyper::service::service_fn(move |req| {
                    let shared = shared.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            proxy::handle_request(shared, peer.ip(), req).await,
                        )
                    }
                });

                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
                {
                    debug!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

fn cert_storage_key(hostname: &str) -> String {
    format!("certificates/{}/cert.pem", hostname)
}

fn key_storage_key(hostname: &str) -> String {
    format!("certificates/{}/key.pem", hostname)
}

async fn serve_challenge(
    State(challenges): State<Arc<ChallengeStore>>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    challenges.get(&token).ok_or(StatusCode::NOT_FOUND)
}

async fn redirect_to_https(headers: axum::http::HeaderMap, uri: Uri) -> Redirect {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(routing::normalize_host)
        .unwrap_or_default();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::permanent(&format!("https://{}{}", host, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys_are_per_hostname() {
        assert_eq!(
            cert_storage_key("app.example.com"),
            "certificates/app.example.com/cert.pem"
        );
        assert_eq!(
            key_storage_key("app.example.com"),
            "certificates/app.example.com/key.pem"
        );
    }
}
