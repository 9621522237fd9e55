use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use std::time::Duration;

/// Client for the schema registry configured alongside a kafka cluster.
#[derive(Debug, Clone)]
pub struct SchemaRegistryClient {
    base_url: reqwest::Url,
    http: reqwest::Client,
}

impl SchemaRegistryClient {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self> {
        let mut base_url = reqwest::Url::parse(url)
            .with_context(|| format!("Invalid schema registry url {url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Schema registry url {url} must use the http or https scheme"
            ));
        }
        // keep any base path when joining endpoint paths onto it
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create schema registry http client")?;
        Ok(SchemaRegistryClient { base_url, http })
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn schema_url(&self, global_id: i64) -> Result<reqwest::Url> {
        self.base_url
            .join(&format!("apis/ccompat/v7/schemas/ids/{global_id}"))
            .context("Failed to build schema url")
    }

    /// Fetches the raw schema document registered under `global_id`.
    pub async fn fetch_schema(&self, global_id: i64) -> Result<Bytes> {
        let url = self.schema_url(global_id)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to request schema from {url}"))?
            .error_for_status()
            .with_context(|| format!("Schema registry rejected request for {url}"))?;
        response
            .bytes()
            .await
            .with_context(|| format!("Failed to read schema from {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_schema_url_keeps_base_path() {
        let client =
            SchemaRegistryClient::new("http://registry:8080/registry", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.schema_url(42).unwrap().as_str(),
            "http://registry:8080/registry/apis/ccompat/v7/schemas/ids/42"
        );
    }

    #[test]
    fn test_invalid_urls() {
        assert!(SchemaRegistryClient::new("not a url", Duration::from_secs(5)).is_err());
        assert!(SchemaRegistryClient::new("ftp://registry", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_schema() {
        let app = axum::Router::new().route(
            "/registry/apis/ccompat/v7/schemas/ids/7",
            axum::routing::get(|| async { r#"{"schema":"\"string\""}"# }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = SchemaRegistryClient::new(
            &format!("http://{address}/registry"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.fetch_schema(7).await.unwrap(),
            Bytes::from_static(br#"{"schema":"\"string\""}"#)
        );
        assert!(client.fetch_schema(8).await.is_err());
    }
}
