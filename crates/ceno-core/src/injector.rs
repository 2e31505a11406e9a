//! Injector: an open proxy reachable as a hidden service.
//!
//! The client side issues one `proxy` request over a [`Connection`]. The
//! service side fetches from the origin on the client's behalf and publishes
//! cache-eligible responses through the local [`CacheManager`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache_manager::CacheManager;
use crate::cancel::CancellationToken;
use crate::hidden_service::{Connection, HiddenServiceMultiplexer, HiddenServiceName};
use crate::origin::OriginClient;
use crate::protocol::{expect_body, expect_message, read_message, write_message, write_proxy_response, Message};
use crate::resource::{validate_url, Resource};
use crate::{CenoError, Result};

/// Ask the injector on the other end of `conn` to fetch `url`.
pub async fn request_via(conn: &mut Connection, url: &str) -> Result<Resource> {
    write_message(conn, &Message::Proxy { url: url.to_string() }).await?;

    match expect_message(conn).await? {
        Message::ProxyResponse { status, headers } => {
            let body = expect_body(conn).await?;
            debug!("Injector {} returned {} for {}", conn.backend(), status, url);
            Ok(Resource::new(url, status, headers, body))
        }
        Message::ProxyError { reason, filtered: true } => Err(CenoError::NetworkFiltering {
            url: url.to_string(),
            reason: format!("injector origin filtered: {}", reason),
        }),
        Message::ProxyError { reason, .. } => Err(CenoError::Network {
            message: format!("injector could not fetch {}: {}", url, reason),
        }),
        other => Err(CenoError::protocol(format!(
            "unexpected reply to proxy request: {:?}",
            other
        ))),
    }
}

/// Server side of the injector.
pub struct InjectorService {
    name: HiddenServiceName,
    origin: Arc<dyn OriginClient>,
    cache: Option<CacheManager>,
}

impl InjectorService {
    pub fn new(name: HiddenServiceName, origin: Arc<dyn OriginClient>) -> Self {
        Self {
            name,
            origin,
            cache: None,
        }
    }

    /// Publish cache-eligible responses through `cache`.
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn name(&self) -> &HiddenServiceName {
        &self.name
    }

    /// Host the injector name and serve connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        hidden_services: &HiddenServiceMultiplexer,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut incoming = hidden_services.host(&self.name).await?;
        let mut handlers = JoinSet::new();
        info!("Injector serving {}", self.name);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = incoming.next() => {
                    let Some(conn) = next else { break };
                    let service = Arc::clone(&self);
                    handlers.spawn(async move {
                        if let Err(e) = service.handle_connection(conn).await {
                            warn!("Injector connection failed: {}", e);
                        }
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        handlers.shutdown().await;
        info!("Injector {} stopped", self.name);
        Ok(())
    }

    /// Answer proxy requests on one connection until the peer closes it.
    pub async fn handle_connection(&self, mut conn: Connection) -> Result<()> {
        while let Some(message) = read_message(&mut conn).await? {
            match message {
                Message::Proxy { url } => self.proxy(&mut conn, &url).await?,
                other => {
                    return Err(CenoError::protocol(format!(
                        "injector does not handle {:?}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    async fn proxy(&self, conn: &mut Connection, url: &str) -> Result<()> {
        if let Err(e) = validate_url(url) {
            warn!("Refusing to proxy {:?}: {}", url, e);
            let reply = Message::ProxyError {
                reason: e.to_string(),
                filtered: false,
            };
            return write_message(conn, &reply).await;
        }

        let resource = match self.origin.fetch(url).await {
            Ok(resource) => resource,
            Err(e) => {
                debug!("Injector origin fetch for {} failed: {}", url, e);
                let reply = Message::ProxyError {
                    reason: e.to_string(),
                    filtered: e.is_filtering(),
                };
                return write_message(conn, &reply).await;
            }
        };

        write_proxy_response(conn, &resource).await?;
        self.publish(resource);
        Ok(())
    }

    fn publish(&self, resource: Resource) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if !resource.is_cacheable() {
            debug!("Not publishing uncacheable {}", resource.url());
            return;
        }
        tokio::spawn(async move {
            let url = resource.url().to_string();
            match cache.admit(resource).await {
                Ok(outcome) if outcome.admitted() => info!("Injector published {}", url),
                Ok(_) => debug!("Injector did not publish {}: admission rejected", url),
                Err(e) => warn!("Injector failed to publish {}: {}", url, e),
            }
        });
    }
}
