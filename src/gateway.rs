//! Cross-region gateway.
//!
//! Every region runs a prober service exposed through an ingress. Regions
//! publish their seed list and readiness to their own prober and read peers'
//! state from the peers' probers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Method, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Seed and readiness exchange with cooperating regions.
#[async_trait]
pub trait CrossRegionGateway: Send + Sync {
    /// Publish this region's seed list.
    async fn publish_local_seeds(&self, seeds: &[String]) -> Result<()>;

    /// Seed list published by a peer region.
    async fn fetch_seeds(&self, region: &str) -> Result<Vec<String>>;

    /// Readiness published by a peer region.
    async fn is_region_ready(&self, region: &str) -> Result<bool>;

    /// Publish this region's readiness.
    async fn publish_local_readiness(&self, ready: bool) -> Result<()>;
}

/// Readiness of every region, queried concurrently. Any failure fails the
/// whole lookup with `RegionNotReady`.
pub async fn regions_readiness(
    gateway: &dyn CrossRegionGateway,
    regions: &[String],
) -> Result<BTreeMap<String, bool>> {
    let checks = regions.iter().map(|region| async move {
        match gateway.is_region_ready(region).await {
            Ok(ready) => Ok((region.clone(), ready)),
            Err(e) => {
                warn!(region = %region, error = %e, "Unable to get region readiness status from prober");
                Err(Error::RegionNotReady(region.clone()))
            }
        }
    });

    Ok(try_join_all(checks).await?.into_iter().collect())
}

/// Seeds of every region, queried concurrently, in the order of `regions`.
/// A region without seeds is not ready: new nodes could never join through it.
pub async fn regions_seeds(
    gateway: &dyn CrossRegionGateway,
    regions: &[String],
) -> Result<Vec<Vec<String>>> {
    let fetches = regions.iter().map(|region| async move {
        match gateway.fetch_seeds(region).await {
            Ok(seeds) if seeds.is_empty() => {
                warn!(region = %region, "Region has no seeds yet");
                Err(Error::RegionNotReady(region.clone()))
            }
            Ok(seeds) => Ok(seeds),
            Err(e) => {
                warn!(region = %region, error = %e, "Can't get seeds from region");
                Err(Error::RegionNotReady(region.clone()))
            }
        }
    });

    try_join_all(fetches).await
}

/// HTTP client of the prober service.
pub struct ProberClient {
    base_url: String,
    client: reqwest::Client,
    user: String,
    password: String,
}

impl ProberClient {
    pub fn new(base_url: String, user: String, password: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            user,
            password,
        })
    }

    fn local(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn remote(&self, host: &str, path: &str) -> RequestBuilder {
        self.client
            .get(format!("https://{}{}", host, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn send(&self, host: &str, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| Error::Gateway {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        if response.status() != StatusCode::OK {
            return Err(Error::Gateway {
                host: host.to_string(),
                reason: format!("response status {} is not 200 OK", response.status()),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CrossRegionGateway for ProberClient {
    async fn publish_local_seeds(&self, seeds: &[String]) -> Result<()> {
        let request = self.local(Method::PUT, "/seeds").json(seeds);
        self.send(&self.base_url, request).await?;
        debug!(seeds = seeds.len(), "Published local seeds");
        Ok(())
    }

    async fn fetch_seeds(&self, region: &str) -> Result<Vec<String>> {
        let response = self.send(region, self.remote(region, "/seeds")).await?;
        response.json().await.map_err(|e| Error::Gateway {
            host: region.to_string(),
            reason: format!("error unmarshalling response body: {}", e),
        })
    }

    async fn is_region_ready(&self, region: &str) -> Result<bool> {
        let response = self.send(region, self.remote(region, "/region-ready")).await?;
        let body = response.text().await?;
        parse_bool(region, &body)
    }

    async fn publish_local_readiness(&self, ready: bool) -> Result<()> {
        let request = self.local(Method::PUT, "/region-ready").body(ready.to_string());
        self.send(&self.base_url, request).await?;
        Ok(())
    }
}

fn parse_bool(host: &str, body: &str) -> Result<bool> {
    body.trim().parse().map_err(|_| Error::Gateway {
        host: host.to_string(),
        reason: format!("unexpected response {:?}, expect true or false", body.trim()),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory gateway for tests.
    #[derive(Default)]
    pub struct FakeGateway {
        pub seeds: HashMap<String, Vec<String>>,
        pub readiness: HashMap<String, bool>,
        pub published_seeds: Mutex<Vec<Vec<String>>>,
        pub published_readiness: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl CrossRegionGateway for FakeGateway {
        async fn publish_local_seeds(&self, seeds: &[String]) -> Result<()> {
            self.published_seeds.lock().unwrap().push(seeds.to_vec());
            Ok(())
        }

        async fn fetch_seeds(&self, region: &str) -> Result<Vec<String>> {
            self.seeds.get(region).cloned().ok_or_else(|| Error::Gateway {
                host: region.to_string(),
                reason: "unreachable".to_string(),
            })
        }

        async fn is_region_ready(&self, region: &str) -> Result<bool> {
            self.readiness.get(region).copied().ok_or_else(|| Error::Gateway {
                host: region.to_string(),
                reason: "unreachable".to_string(),
            })
        }

        async fn publish_local_readiness(&self, ready: bool) -> Result<()> {
            self.published_readiness.lock().unwrap().push(ready);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_regions_readiness_fails_closed() {
        let mut gateway = FakeGateway::default();
        gateway.readiness.insert("region2".to_string(), true);

        let regions = vec!["region2".to_string()];
        let readiness = regions_readiness(&gateway, &regions).await.unwrap();
        assert_eq!(readiness.get("region2"), Some(&true));

        let regions = vec!["region2".to_string(), "region3".to_string()];
        let err = regions_readiness(&gateway, &regions).await.unwrap_err();
        assert!(matches!(err, Error::RegionNotReady(r) if r == "region3"));
    }

    #[tokio::test]
    async fn test_regions_seeds_keep_order() {
        let mut gateway = FakeGateway::default();
        gateway.seeds.insert("b".to_string(), vec!["2.2.2.2".to_string()]);
        gateway.seeds.insert("a".to_string(), vec!["1.1.1.1".to_string()]);
        gateway.seeds.insert("empty".to_string(), vec![]);

        let seeds = regions_seeds(&gateway, &["b".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(seeds, vec![vec!["2.2.2.2".to_string()], vec!["1.1.1.1".to_string()]]);

        let err = regions_seeds(&gateway, &["empty".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::RegionNotReady(_)));
    }

    #[tokio::test]
    async fn test_prober_calls_honor_timeout() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let client = ProberClient::new(
            base_url,
            "prober".to_string(),
            "secret".to_string(),
            Duration::from_millis(200),
        )
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.publish_local_readiness(true))
            .await
            .expect("prober call outlived its timeout");
        assert!(matches!(result, Err(Error::Gateway { .. })));
        drop(listener);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("h", "true\n").unwrap());
        assert!(!parse_bool("h", " false").unwrap());
        assert!(parse_bool("h", "yes").is_err());
    }
}
