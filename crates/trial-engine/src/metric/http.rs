use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{MetricBackend, QueryValue, ScrapeTarget};
use crate::error::CaptureError;

/// [`MetricBackend`] speaking HTTP
#[derive(Debug, Clone)]
pub struct HttpMetricBackend {
    client: Client,
}

impl HttpMetricBackend {
    /// Create a backend whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Fails when the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, CaptureError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Prometheus API envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, CaptureError> {
        if self.status != "success" {
            return Err(CaptureError::Backend(
                self.error.unwrap_or_else(|| format!("status {}", self.status)),
            ));
        }
        self.data
            .ok_or_else(|| CaptureError::Backend("response has no data".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetsData {
    #[serde(default)]
    active_targets: Vec<ActiveTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveTarget {
    health: String,
    last_scrape: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Value,
}

fn endpoint(address: &str, path: &str) -> String {
    format!("{}/{path}", address.trim_end_matches('/'))
}

/// Unix time with millisecond precision, as the query API accepts it
fn query_time(time: DateTime<Utc>) -> String {
    format!("{}.{:03}", time.timestamp(), time.timestamp_subsec_millis())
}

fn parse_targets(body: Envelope<TargetsData>) -> Result<Vec<ScrapeTarget>, CaptureError> {
    Ok(body
        .into_data()?
        .active_targets
        .into_iter()
        .map(|t| ScrapeTarget {
            health: t.health,
            last_scrape: t.last_scrape,
        })
        .collect())
}

/// A scalar result is `[<unix time>, "<value>"]`
fn parse_query(body: Envelope<QueryData>) -> Result<QueryValue, CaptureError> {
    let data = body.into_data()?;
    if data.result_type != "scalar" {
        return Ok(QueryValue::Other(data.result_type));
    }
    let sample = data
        .result
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| CaptureError::Backend(format!("malformed scalar result: {}", data.result)))?;
    sample
        .parse()
        .map(QueryValue::Scalar)
        .map_err(|_| CaptureError::Backend(format!("malformed scalar sample '{sample}'")))
}

#[async_trait]
impl MetricBackend for HttpMetricBackend {
    async fn prometheus_targets(&self, address: &str) -> Result<Vec<ScrapeTarget>, CaptureError> {
        let body = self
            .client
            .get(endpoint(address, "api/v1/targets"))
            .query(&[("state", "active")])
            .send()
            .await?
            .json()
            .await?;
        parse_targets(body)
    }

    async fn prometheus_query(
        &self,
        address: &str,
        query: &str,
        time: DateTime<Utc>,
    ) -> Result<QueryValue, CaptureError> {
        let time = query_time(time);
        let body = self
            .client
            .get(endpoint(address, "api/v1/query"))
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await?
            .json()
            .await?;
        parse_query(body)
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, CaptureError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(CaptureError::NoValueYet(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_joins_paths() {
        assert_eq!(endpoint("http://10.0.0.9:9090/", "api/v1/query"), "http://10.0.0.9:9090/api/v1/query");
        assert_eq!(endpoint("http://prom", "api/v1/targets"), "http://prom/api/v1/targets");
    }

    #[test]
    fn query_time_keeps_milliseconds() {
        let completion = Utc.timestamp_millis_opt(1_700_000_012_345).unwrap();
        assert_eq!(query_time(completion), "1700000012.345");
        assert_eq!(query_time(Utc.timestamp_opt(1_700_000_000, 0).unwrap()), "1700000000.000");
    }

    #[test]
    fn success_without_data() {
        let body: Envelope<TargetsData> = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        let err = parse_targets(body).unwrap_err();
        assert_eq!(err.to_string(), "metrics backend error: response has no data");
    }

    #[test]
    fn targets_response() {
        let body = serde_json::from_str(
            r#"{"status":"success","data":{"activeTargets":[
                {"health":"up","lastScrape":"2023-11-14T22:13:20Z","labels":{"job":"node"}},
                {"health":"down","lastScrape":"0001-01-01T00:00:00Z"}
            ],"droppedTargets":[]}}"#,
        )
        .unwrap();
        let targets = parse_targets(body).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].health, "up");
        assert_eq!(targets[0].last_scrape, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn scalar_response() {
        let body = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"scalar","result":[1700000000.0,"0.125"]}}"#,
        )
        .unwrap();
        assert_eq!(parse_query(body).unwrap(), QueryValue::Scalar(0.125));
    }

    #[test]
    fn scalar_nan_response() {
        let body = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"scalar","result":[1700000000.0,"NaN"]}}"#,
        )
        .unwrap();
        assert!(matches!(parse_query(body).unwrap(), QueryValue::Scalar(v) if v.is_nan()));
    }

    #[test]
    fn vector_response() {
        let body = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#,
        )
        .unwrap();
        assert_eq!(parse_query(body).unwrap(), QueryValue::Other("vector".into()));
    }

    #[test]
    fn error_response() {
        let body: Envelope<QueryData> = serde_json::from_str(
            r#"{"status":"error","errorType":"bad_data","error":"parse error at char 4"}"#,
        )
        .unwrap();
        let err = parse_query(body).unwrap_err();
        assert_eq!(err.to_string(), "metrics backend error: parse error at char 4");
    }
}
