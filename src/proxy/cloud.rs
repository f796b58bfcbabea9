//! Cloud metadata and internal network exposure checks

use crate::config::Config;
use crate::proxy::client::Fetcher;
use crate::proxy::trace::{preview, DebugTrace};
use ipnetwork::IpNetwork;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A named SSRF target profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudProvider {
    pub name: String,
    pub metadata_ips: Vec<String>,
    pub metadata_urls: Vec<String>,
    pub metadata_headers: BTreeMap<String, String>,
    /// CIDR blocks sampled for internal access
    pub internal_ranges: Vec<String>,
    pub asns: Vec<String>,
    pub org_names: Vec<String>,
}

impl CloudProvider {
    /// Profiles for the major public clouds
    pub fn builtin() -> Vec<Self> {
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        vec![
            CloudProvider {
                name: "AWS".to_string(),
                metadata_ips: strings(&["169.254.169.254", "fd00:ec2::254"]),
                metadata_urls: strings(&[
                    "http://169.254.169.254/latest/meta-data/",
                    "http://169.254.169.254/latest/dynamic/instance-identity/document",
                ]),
                metadata_headers: BTreeMap::new(),
                internal_ranges: strings(&["172.31.0.0/16"]),
                asns: strings(&["AS16509", "AS14618"]),
                org_names: strings(&["AMAZON"]),
            },
            CloudProvider {
                name: "GCP".to_string(),
                metadata_ips: strings(&["169.254.169.254"]),
                metadata_urls: strings(&["http://metadata.google.internal/computeMetadata/v1/"]),
                metadata_headers: [("Metadata-Flavor".to_string(), "Google".to_string())].into(),
                internal_ranges: strings(&["10.128.0.0/9"]),
                asns: strings(&["AS15169", "AS396982"]),
                org_names: strings(&["GOOGLE"]),
            },
            CloudProvider {
                name: "Azure".to_string(),
                metadata_ips: strings(&["169.254.169.254"]),
                metadata_urls: strings(&[
                    "http://169.254.169.254/metadata/instance?api-version=2021-02-01",
                ]),
                metadata_headers: [("Metadata".to_string(), "true".to_string())].into(),
                internal_ranges: strings(&["10.0.0.0/16"]),
                asns: strings(&["AS8075"]),
                org_names: strings(&["MICROSOFT"]),
            },
            CloudProvider {
                name: "DigitalOcean".to_string(),
                metadata_ips: strings(&["169.254.169.254"]),
                metadata_urls: strings(&["http://169.254.169.254/metadata/v1/"]),
                metadata_headers: BTreeMap::new(),
                internal_ranges: strings(&["10.10.0.0/16"]),
                asns: strings(&["AS14061"]),
                org_names: strings(&["DIGITALOCEAN"]),
            },
        ]
    }

    /// Metadata IPs over http and https, then the explicit metadata URLs
    pub fn metadata_targets(&self) -> Vec<String> {
        let mut targets = Vec::new();
        for ip in &self.metadata_ips {
            let host = match ip.parse::<Ipv6Addr>() {
                Ok(_) => format!("[{}]", ip),
                Err(_) => ip.clone(),
            };
            targets.push(format!("http://{}/", host));
            targets.push(format!("https://{}/", host));
        }
        targets.extend(self.metadata_urls.iter().cloned());
        targets
    }

    /// Random host addresses spread over the internal ranges, round-robin
    pub fn sample_internal<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<IpAddr> {
        let networks: Vec<IpNetwork> = self
            .internal_ranges
            .iter()
            .filter_map(|range| range.parse().ok())
            .collect();
        if networks.is_empty() {
            return Vec::new();
        }

        (0..count)
            .map(|i| random_host(&networks[i % networks.len()], rng))
            .collect()
    }

    /// Whether an ASN or organisation of this provider appears in `text`
    pub fn matches_hosting(&self, text: &str) -> bool {
        let text = text.to_uppercase();
        self.asns
            .iter()
            .chain(self.org_names.iter())
            .any(|needle| !needle.is_empty() && text.contains(&needle.to_uppercase()))
    }
}

/// First provider whose ASN or organisation appears in `text`
pub fn detect_hosting<'a>(providers: &'a [CloudProvider], text: &str) -> Option<&'a CloudProvider> {
    providers.iter().find(|p| p.matches_hosting(text))
}

/// Pick a host address inside `network`, skipping network and broadcast
/// addresses when the block is large enough to have them.
fn random_host<R: Rng>(network: &IpNetwork, rng: &mut R) -> IpAddr {
    match network {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network()) as u64;
            let host_bits = 32 - net.prefix() as u32;
            let offset = match host_bits {
                0 => 0,
                1 => rng.gen_range(0..2),
                bits => rng.gen_range(1..(1u64 << bits) - 1),
            };
            IpAddr::V4(Ipv4Addr::from((base + offset) as u32))
        }
        IpNetwork::V6(net) => {
            let base = u128::from(net.network());
            let host_bits = 128 - net.prefix() as u32;
            let offset = match host_bits {
                0 => 0,
                1 => rng.gen_range(0..2),
                128 => rng.gen_range(1..u128::MAX),
                bits => rng.gen_range(1..(1u128 << bits)),
            };
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

/// What the prober found for the matched provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudFinding {
    pub provider: String,
    pub metadata_access: bool,
    pub internal_access: bool,
}

/// Tests whether a proxy can be used to reach cloud-internal resources
#[derive(Debug, Clone)]
pub struct CloudProber {
    samples: usize,
    fetcher: Fetcher,
}

impl CloudProber {
    pub fn new(samples: usize, fetcher: Fetcher) -> Self {
        Self { samples, fetcher }
    }

    pub fn from_config(config: &Config, fetcher: Fetcher) -> Self {
        Self::new(config.cloud.internal_samples, fetcher)
    }

    /// Probe providers in order; the first one with any exposure wins
    pub async fn probe(
        &self,
        client: &Client,
        providers: &[CloudProvider],
        trace: &mut DebugTrace,
    ) -> Option<CloudFinding> {
        for provider in providers {
            let metadata_access = self.probe_metadata(client, provider, trace).await;
            let internal_access = self.probe_internal(client, provider, trace).await;

            if metadata_access || internal_access {
                trace.note(format!(
                    "[CLOUD] {} exposed (metadata={}, internal={})",
                    provider.name, metadata_access, internal_access
                ));
                return Some(CloudFinding {
                    provider: provider.name.clone(),
                    metadata_access,
                    internal_access,
                });
            }
        }

        trace.note("[CLOUD] no provider exposed");
        None
    }

    async fn probe_metadata(&self, client: &Client, provider: &CloudProvider, trace: &mut DebugTrace) -> bool {
        for target in provider.metadata_targets() {
            let mut request = client.get(&target);
            for (name, value) in &provider.metadata_headers {
                request = request.header(name.as_str(), value.as_str());
            }

            match self.fetcher.fetch(request).await {
                Ok(response) if response.status.is_success() => {
                    trace.note(format!(
                        "[CLOUD] {} metadata reachable at {}: {}",
                        provider.name,
                        target,
                        preview(&response.body)
                    ));
                    return true;
                }
                Ok(response) => trace.note(format!(
                    "[CLOUD] {} -> {}",
                    target,
                    response.status.as_u16()
                )),
                Err(e) => trace.note(format!("[CLOUD] {} failed: {}", target, e)),
            }
        }
        false
    }

    async fn probe_internal(&self, client: &Client, provider: &CloudProvider, trace: &mut DebugTrace) -> bool {
        let addresses = provider.sample_internal(self.samples, &mut rand::thread_rng());
        for address in addresses {
            let target = match address {
                IpAddr::V4(ip) => format!("http://{}/", ip),
                IpAddr::V6(ip) => format!("http://[{}]/", ip),
            };

            match self.fetcher.fetch(client.get(&target)).await {
                Ok(response) if response.status.is_success() => {
                    trace.note(format!(
                        "[CLOUD] {} internal address reachable at {}: {}",
                        provider.name,
                        target,
                        preview(&response.body)
                    ));
                    return true;
                }
                Ok(response) => trace.note(format!(
                    "[CLOUD] {} -> {}",
                    target,
                    response.status.as_u16()
                )),
                Err(e) => trace.note(format!("[CLOUD] {} failed: {}", target, e)),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::client::{ClientFactory, RedirectMode};
    use crate::proxy::models::Proxy;
    use crate::testutil::{MockResponse, MockServer};
    use ipnetwork::Ipv4Network;
    use std::time::Duration;

    fn provider(name: &str) -> CloudProvider {
        CloudProvider {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_builtin_ranges_parse() {
        for provider in CloudProvider::builtin() {
            for range in &provider.internal_ranges {
                assert!(range.parse::<IpNetwork>().is_ok(), "{}", range);
            }
            assert!(!provider.metadata_targets().is_empty());
        }
    }

    #[test]
    fn test_metadata_targets_order() {
        let mut aws = provider("AWS");
        aws.metadata_ips = vec!["169.254.169.254".to_string(), "fd00:ec2::254".to_string()];
        aws.metadata_urls = vec!["http://169.254.169.254/latest/meta-data/".to_string()];

        assert_eq!(
            aws.metadata_targets(),
            vec![
                "http://169.254.169.254/",
                "https://169.254.169.254/",
                "http://[fd00:ec2::254]/",
                "https://[fd00:ec2::254]/",
                "http://169.254.169.254/latest/meta-data/",
            ]
        );
    }

    #[test]
    fn test_sample_stays_inside_range() {
        let mut p = provider("test");
        p.internal_ranges = vec!["10.20.30.0/24".to_string(), "192.168.7.9/32".to_string()];
        let net: Ipv4Network = "10.20.30.0/24".parse().unwrap();

        let samples = p.sample_internal(20, &mut rand::thread_rng());
        assert_eq!(samples.len(), 20);
        for (i, ip) in samples.iter().enumerate() {
            match ip {
                IpAddr::V4(v4) if i % 2 == 0 => {
                    assert!(net.contains(*v4));
                    assert_ne!(*v4, net.network());
                    assert_ne!(*v4, net.broadcast());
                }
                IpAddr::V4(v4) => assert_eq!(*v4, Ipv4Addr::new(192, 168, 7, 9)),
                other => panic!("unexpected {}", other),
            }
        }
    }

    #[test]
    fn test_sample_without_ranges() {
        assert!(provider("empty").sample_internal(5, &mut rand::thread_rng()).is_empty());
    }

    #[test]
    fn test_hosting_detection() {
        let providers = CloudProvider::builtin();
        let body = r#"{"ip":"3.5.1.1","org":"AS16509 Amazon.com, Inc."}"#;
        assert_eq!(detect_hosting(&providers, body).unwrap().name, "AWS");
        assert_eq!(
            detect_hosting(&providers, "Google LLC").unwrap().name,
            "GCP"
        );
        assert!(detect_hosting(&providers, r#"{"ip":"203.0.113.5"}"#).is_none());
    }

    async fn probe_through(server: &MockServer, providers: &[CloudProvider]) -> Option<CloudFinding> {
        let config = Config::new().with_timeout(Duration::from_secs(3));
        let proxy: Proxy = server.url().parse().unwrap();
        let client = ClientFactory::from_config(&config)
            .unwrap()
            .build(&proxy, RedirectMode::Manual)
            .unwrap();
        CloudProber::new(3, Fetcher::from_config(&config))
            .probe(&client, providers, &mut DebugTrace::new(true))
            .await
    }

    #[tokio::test]
    async fn test_metadata_hit_names_provider() {
        let server = MockServer::start(|req| {
            if req.target == "http://169.254.169.254/latest/meta-data/"
                && req.header("X-Token").is_some()
            {
                MockResponse::ok("ami-id\nhostname\n")
            } else {
                MockResponse::new(404, "not found")
            }
        })
        .await;

        let mut gcp = provider("GCP");
        gcp.metadata_urls = vec!["http://metadata.google.internal/computeMetadata/v1/".to_string()];
        let mut aws = provider("AWS");
        aws.metadata_urls = vec!["http://169.254.169.254/latest/meta-data/".to_string()];
        aws.metadata_headers.insert("X-Token".to_string(), "1".to_string());

        let finding = probe_through(&server, &[gcp, aws]).await.unwrap();
        assert_eq!(finding.provider, "AWS");
        assert!(finding.metadata_access);
        assert!(!finding.internal_access);
    }

    #[tokio::test]
    async fn test_internal_hit() {
        let server = MockServer::start(|req| {
            if req.target.starts_with("http://10.20.30.") {
                MockResponse::ok("internal dashboard")
            } else {
                MockResponse::new(404, "not found")
            }
        })
        .await;

        let mut p = provider("Private");
        p.internal_ranges = vec!["10.20.30.0/24".to_string()];

        let finding = probe_through(&server, &[p]).await.unwrap();
        assert_eq!(finding.provider, "Private");
        assert!(finding.internal_access);
        assert!(!finding.metadata_access);
    }

    #[tokio::test]
    async fn test_nothing_reachable() {
        let server = MockServer::start(|_| MockResponse::new(403, "denied")).await;

        let mut aws = provider("AWS");
        aws.metadata_ips = vec!["169.254.169.254".to_string()];
        aws.internal_ranges = vec!["172.31.0.0/16".to_string()];

        assert!(probe_through(&server, &[aws]).await.is_none());
    }
}
