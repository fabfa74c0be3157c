//! Object storage URL resolution with a local fallback.
//!
//! The pipeline never downloads media. It only decides which base URL to put
//! in front of a storage key: the object storage endpoint when it answers a
//! TCP connect within the probe timeout, or the local fallback prefix.

use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

/// Where media URLs point for one resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaBase {
    Remote(Url),
    Fallback(String),
}

impl MediaBase {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    /// Public URL for a storage key.
    pub fn url_for(&self, storage_key: &str) -> String {
        let segments = storage_key.split('/').filter(|s| !s.is_empty());
        match self {
            Self::Remote(base) => {
                let mut url = base.clone();
                if let Ok(mut path) = url.path_segments_mut() {
                    path.pop_if_empty().extend(segments);
                }
                url.to_string()
            }
            Self::Fallback(prefix) => {
                let mut out = prefix.trim_end_matches('/').to_string();
                for segment in segments {
                    out.push('/');
                    out.push_str(segment);
                }
                out
            }
        }
    }
}

/// Object storage endpoint plus the fallback used when it is unreachable.
#[derive(Debug, Clone)]
pub struct MediaStorage {
    base_url: Option<Url>,
    fallback_prefix: String,
    probe_timeout: Duration,
}

impl MediaStorage {
    pub fn new(base_url: Option<Url>, fallback_prefix: String, probe_timeout: Duration) -> Self {
        Self {
            base_url,
            fallback_prefix,
            probe_timeout,
        }
    }

    /// Storage that always resolves to the fallback prefix.
    pub fn fallback_only(fallback_prefix: impl Into<String>) -> Self {
        Self::new(None, fallback_prefix.into(), Duration::from_millis(0))
    }

    /// Probes object storage and returns the base to use for this resolve.
    pub async fn probe(&self) -> MediaBase {
        let fallback = MediaBase::Fallback(self.fallback_prefix.clone());

        let Some(base) = &self.base_url else {
            return fallback;
        };
        let (Some(host), Some(port)) = (base.host_str(), base.port_or_known_default()) else {
            tracing::warn!(base = %base, "Media base URL has no host; using fallback prefix");
            return fallback;
        };

        match tokio::time::timeout(self.probe_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => MediaBase::Remote(base.clone()),
            Ok(Err(e)) => {
                tracing::warn!(host, port, error = %e, "Object storage unreachable; using fallback prefix");
                fallback
            }
            Err(_) => {
                tracing::warn!(
                    host,
                    port,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Object storage probe timed out; using fallback prefix"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_remote_url_for_encodes_segments() {
        let base = MediaBase::Remote(Url::parse("https://cdn.example.test/media/").unwrap());
        assert_eq!(
            base.url_for("sites/3/harbour view.jpg"),
            "https://cdn.example.test/media/sites/3/harbour%20view.jpg"
        );
    }

    #[test]
    fn test_fallback_url_for() {
        let base = MediaBase::Fallback("/media/".to_string());
        assert_eq!(base.url_for("/sites/3/a.jpg"), "/media/sites/3/a.jpg");
        assert!(base.is_fallback());
    }

    #[tokio::test]
    async fn test_probe_without_base_uses_fallback() {
        let storage = MediaStorage::fallback_only("/media");
        assert_eq!(storage.probe().await, MediaBase::Fallback("/media".to_string()));
    }

    #[tokio::test]
    async fn test_probe_reachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let base = Url::parse(&format!("http://127.0.0.1:{port}/bucket/")).unwrap();
        let storage = MediaStorage::new(
            Some(base.clone()),
            "/media".to_string(),
            Duration::from_secs(2),
        );

        assert_eq!(storage.probe().await, MediaBase::Remote(base));
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint_falls_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let base = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let storage = MediaStorage::new(Some(base), "/media".to_string(), Duration::from_secs(2));

        assert!(storage.probe().await.is_fallback());
    }
}
