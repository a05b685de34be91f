use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;
use trial_api::Metric;

use crate::cluster::Cluster;
use crate::error::{CaptureError, ReconcileError};

/// Endpoints to query for a remote metric
///
/// An explicit `url` is used verbatim. Otherwise every service in `namespace` matching
/// the metric selector contributes `scheme://clusterIP:port/path`.
///
/// The outer error is a cluster failure that aborts the pass; the inner error is a
/// capture failure charged to the metric.
///
/// # Errors
///
/// Fails when the services cannot be listed.
pub async fn resolve_urls(
    cluster: &dyn Cluster,
    namespace: &str,
    metric: &Metric,
) -> Result<Result<Vec<String>, CaptureError>, ReconcileError> {
    if let Some(url) = metric.url.as_deref().filter(|u| !u.is_empty()) {
        return Ok(Ok(vec![url.to_owned()]));
    }

    let scheme = match metric.scheme.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("" | "http") => "http",
        Some("https") => "https",
        Some(other) => {
            return Ok(Err(CaptureError::Scheme {
                name: metric.name.clone(),
                scheme: other.to_owned(),
            }))
        }
    };
    let path = format!("/{}", metric.path.as_deref().unwrap_or_default().trim_start_matches('/'));

    let selector = metric.selector.clone().unwrap_or_else(LabelSelector::default);
    let services = cluster.list_services(namespace, &selector).await?;

    let mut urls = Vec::with_capacity(services.len());
    for service in &services {
        let Some(ip) = cluster_ip(service) else {
            debug!(service = %service.name_any(), "Skipping service without a cluster IP");
            continue;
        };
        let Some(port) = service_port(service, metric.port.as_ref()) else {
            return Ok(Err(CaptureError::UnresolvablePort(metric.name.clone())));
        };
        urls.push(format!("{scheme}://{ip}:{port}{path}"));
    }

    if urls.is_empty() {
        return Ok(Err(CaptureError::NoTargets(metric.name.clone())));
    }
    Ok(Ok(urls))
}

fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

/// Port by number, by name, or the only declared port
fn service_port(service: &Service, wanted: Option<&IntOrString>) -> Option<i32> {
    let ports = service.spec.as_ref()?.ports.as_deref().unwrap_or_default();
    let matched = ports.iter().find(|p| match wanted {
        Some(IntOrString::Int(n)) => p.port == *n,
        Some(IntOrString::String(name)) => p.name.as_deref() == Some(name.as_str()),
        None => false,
    });
    match (matched, ports) {
        (Some(p), _) | (None, [p]) => Some(p.port),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use pretty_assertions::assert_eq;

    fn service(name: &str, ip: &str, ports: &[(&str, i32)]) -> Service {
        let mut s = Service::default();
        s.metadata.name = Some(name.to_owned());
        s.spec = Some(ServiceSpec {
            cluster_ip: Some(ip.to_owned()),
            ports: Some(
                ports
                    .iter()
                    .map(|(n, p)| ServicePort {
                        name: Some((*n).to_owned()),
                        port: *p,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        s
    }

    fn metric() -> Metric {
        Metric {
            name: "latency".into(),
            query: "{.p95}".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn explicit_url_skips_discovery() {
        let mut cluster = MockCluster::new();
        cluster.expect_list_services().never();
        let m = Metric {
            url: Some("http://stats.example:8080/summary".into()),
            ..metric()
        };
        let urls = resolve_urls(&cluster, "perf", &m).await.unwrap().unwrap();
        assert_eq!(urls, vec!["http://stats.example:8080/summary".to_owned()]);
    }

    #[tokio::test]
    async fn port_by_name() {
        let mut cluster = MockCluster::new();
        cluster.expect_list_services().returning(|_, _| {
            Ok(vec![service("app", "10.0.0.7", &[("http", 80), ("metrics", 9102)])])
        });
        let m = Metric {
            port: Some(IntOrString::String("metrics".into())),
            path: Some("/stats".into()),
            ..metric()
        };
        let urls = resolve_urls(&cluster, "perf", &m).await.unwrap().unwrap();
        assert_eq!(urls, vec!["http://10.0.0.7:9102/stats".to_owned()]);
    }

    #[tokio::test]
    async fn single_port_is_implied() {
        let mut cluster = MockCluster::new();
        cluster
            .expect_list_services()
            .returning(|_, _| Ok(vec![service("prom", "10.0.0.9", &[("web", 9090)])]));
        let m = Metric {
            scheme: Some("HTTPS".into()),
            ..metric()
        };
        let urls = resolve_urls(&cluster, "perf", &m).await.unwrap().unwrap();
        assert_eq!(urls, vec!["https://10.0.0.9:9090/".to_owned()]);
    }

    #[tokio::test]
    async fn ambiguous_port_fails() {
        let mut cluster = MockCluster::new();
        cluster.expect_list_services().returning(|_, _| {
            Ok(vec![service("app", "10.0.0.7", &[("http", 80), ("metrics", 9102)])])
        });
        let err = resolve_urls(&cluster, "perf", &metric()).await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "metric 'latency' has unresolvable port");
    }

    #[tokio::test]
    async fn no_services() {
        let mut cluster = MockCluster::new();
        cluster.expect_list_services().returning(|_, _| Ok(vec![]));
        let err = resolve_urls(&cluster, "perf", &metric()).await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "unable to find metric targets for 'latency'");
    }

    #[tokio::test]
    async fn bad_scheme() {
        let cluster = MockCluster::new();
        let m = Metric {
            scheme: Some("ftp".into()),
            ..metric()
        };
        let err = resolve_urls(&cluster, "perf", &m).await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Scheme { .. }));
    }
}
