use chrono::{DateTime, Utc};
use tracing::info;

use super::{Capture, MetricBackend, Query, QueryValue, ScrapeTarget};
use crate::error::CaptureError;

/// Query a Prometheus server once it has scraped past the completion time
pub(super) async fn capture(
    backend: &dyn MetricBackend,
    address: &str,
    q: &Query<'_>,
) -> Result<Capture, CaptureError> {
    let targets = backend.prometheus_targets(address).await?;
    let Some(query_time) = query_time(&targets, q.completion_time) else {
        return Ok(Capture::RetryAfter(q.retry_after));
    };
    if query_time != q.completion_time {
        info!(metric = %q.name, %query_time, "Adjusted completion time for Prometheus query");
    }

    let value = scalar(backend.prometheus_query(address, q.query, query_time).await?)?;
    if value.is_nan() {
        return Err(CaptureError::not_available(q.query));
    }

    let error = match q.error_query {
        Some(error_query) => scalar(backend.prometheus_query(address, error_query, query_time).await?)?,
        None => 0.0,
    };

    Ok(Capture::Value {
        value,
        error: if error.is_nan() { 0.0 } else { error },
    })
}

/// Latest scrape time, or `None` while a healthy target has not scraped past `completion`
fn query_time(targets: &[ScrapeTarget], completion: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut latest = completion;
    for target in targets.iter().filter(|t| t.health == "up") {
        if target.last_scrape < completion {
            return None;
        }
        latest = latest.max(target.last_scrape);
    }
    Some(latest)
}

fn scalar(value: QueryValue) -> Result<f64, CaptureError> {
    match value {
        QueryValue::Scalar(v) => Ok(v),
        QueryValue::Other(kind) => Err(CaptureError::NotScalar(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricType, MockMetricBackend};
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn target(health: &str, secs: i64) -> ScrapeTarget {
        ScrapeTarget {
            health: health.to_owned(),
            last_scrape: at(secs),
        }
    }

    fn query<'a>(q: &'a str, error_query: Option<&'a str>) -> Query<'a> {
        Query {
            name: "throughput",
            metric_type: MetricType::Prometheus,
            query: q,
            error_query,
            completion_time: at(0),
            retry_after: Duration::from_secs(5),
        }
    }

    #[test]
    fn unhealthy_targets_are_ignored() {
        let targets = vec![target("down", -60), target("up", 12), target("up", 3)];
        assert_eq!(query_time(&targets, at(0)), Some(at(12)));
    }

    #[test]
    fn stale_target_delays() {
        let targets = vec![target("up", 30), target("up", -1)];
        assert_eq!(query_time(&targets, at(0)), None);
    }

    #[tokio::test]
    async fn not_scraped_asks_for_delay() {
        let mut backend = MockMetricBackend::new();
        backend
            .expect_prometheus_targets()
            .returning(|_| Ok(vec![target("up", -10)]));
        backend.expect_prometheus_query().never();

        let got = capture(&backend, "http://prom:9090", &query("up", None)).await.unwrap();
        assert_eq!(got, Capture::RetryAfter(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn scalar_nan_is_an_error() {
        let mut backend = MockMetricBackend::new();
        backend.expect_prometheus_targets().returning(|_| Ok(vec![target("up", 1)]));
        backend
            .expect_prometheus_query()
            .returning(|_, _, _| Ok(QueryValue::Scalar(f64::NAN)));

        let err = capture(&backend, "http://prom:9090", &query("scalar(rate(x[1m]))", None))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("metric data not available (the scalar function"));
    }

    #[tokio::test]
    async fn vector_result_is_rejected() {
        let mut backend = MockMetricBackend::new();
        backend.expect_prometheus_targets().returning(|_| Ok(vec![]));
        backend
            .expect_prometheus_query()
            .returning(|_, _, _| Ok(QueryValue::Other("vector".into())));

        let err = capture(&backend, "http://prom:9090", &query("up", None)).await.unwrap_err();
        assert_eq!(err.to_string(), "expected scalar query result, got vector");
    }

    #[tokio::test]
    async fn error_query_nan_counts_as_zero() {
        let mut backend = MockMetricBackend::new();
        backend.expect_prometheus_targets().returning(|_| Ok(vec![target("up", 2)]));
        backend
            .expect_prometheus_query()
            .withf(|_, q, t| q == "scalar(p95)" && *t == at(2))
            .returning(|_, _, _| Ok(QueryValue::Scalar(0.25)));
        backend
            .expect_prometheus_query()
            .withf(|_, q, _| q == "scalar(stddev)")
            .returning(|_, _, _| Ok(QueryValue::Scalar(f64::NAN)));

        let got = capture(&backend, "http://prom:9090", &query("scalar(p95)", Some("scalar(stddev)")))
            .await
            .unwrap();
        assert_eq!(got, Capture::Value { value: 0.25, error: 0.0 });
    }
}
