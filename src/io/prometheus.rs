//! Prometheus metrics HTTP endpoint
//!
//! Exposes rollup metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::tally_tracker::TallyTracker;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, tracked_devices: usize, site_id: &str) -> String {
    let summary = metrics.report(tracked_devices);
    let mut output = String::with_capacity(4096);

    write_digest_metrics(&mut output, site_id, &summary);
    write_event_metrics(&mut output, site_id, &summary);
    write_rollup_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);

    output
}

fn write_digest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "rollup_digests_total",
        "Digests applied",
        MetricType::Counter,
        site,
        summary.digests_total,
    );
    let _ = writeln!(output, "# HELP rollup_digests_per_sec Digests applied per second");
    let _ = writeln!(output, "# TYPE rollup_digests_per_sec gauge");
    let _ = writeln!(output, "rollup_digests_per_sec{{site=\"{site}\"}} {:.2}", summary.digests_per_sec);
    write_metric(
        output,
        "rollup_digests_failed_total",
        "Digests given up on after retries",
        MetricType::Counter,
        site,
        summary.digests_failed,
    );
    write_metric(
        output,
        "rollup_queue_depth",
        "Digests waiting in worker queues",
        MetricType::Gauge,
        site,
        summary.queue_depth,
    );
    write_metric(
        output,
        "rollup_tracked_devices",
        "Devices with a live tally",
        MetricType::Gauge,
        site,
        summary.tracked_devices as u64,
    );
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "rollup_events_accepted_total",
        "Events accepted by the normalizer",
        MetricType::Counter,
        site,
        summary.events_accepted,
    );
    write_metric(
        output,
        "rollup_events_rejected_total",
        "Events rejected by validation or a sealed hour",
        MetricType::Counter,
        site,
        summary.events_rejected,
    );
    write_metric(
        output,
        "rollup_events_unregistered_total",
        "Events from unregistered devices or triggers",
        MetricType::Counter,
        site,
        summary.events_unregistered,
    );
    write_metric(
        output,
        "rollup_sealed_hour_events_total",
        "Events that arrived after their hour was sealed",
        MetricType::Counter,
        site,
        summary.sealed_hour_events,
    );
}

fn write_rollup_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "rollup_written_total",
        "Hour rollups written",
        MetricType::Counter,
        site,
        summary.rollups_written,
    );
    write_metric(
        output,
        "rollup_unchanged_total",
        "Hour rebuilds identical to the stored rollup",
        MetricType::Counter,
        site,
        summary.rollups_unchanged,
    );
    write_metric(
        output,
        "rollup_finalized_total",
        "Hour rollups sealed",
        MetricType::Counter,
        site,
        summary.rollups_finalized,
    );
    write_metric(
        output,
        "rollup_store_conflicts_total",
        "Version conflicts on rollup writes",
        MetricType::Counter,
        site,
        summary.store_conflicts,
    );
    write_metric(
        output,
        "rollup_retries_exhausted_total",
        "Hour writes that ran out of retries",
        MetricType::Counter,
        site,
        summary.retries_exhausted,
    );
    write_metric(
        output,
        "rollup_structural_failures_total",
        "Hours halted by a configuration mismatch",
        MetricType::Counter,
        site,
        summary.structural_failures,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "rollup_ingest_latency_us",
        "Digest apply latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_ingest_latency_us,
    );
    write_metric(
        output,
        "rollup_ingest_latency_p50_us",
        "50th percentile digest apply latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_us,
    );
    write_metric(
        output,
        "rollup_ingest_latency_p95_us",
        "95th percentile digest apply latency",
        MetricType::Gauge,
        site,
        summary.lat_p95_us,
    );
    write_metric(
        output,
        "rollup_ingest_latency_p99_us",
        "99th percentile digest apply latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "rollup_ingest_latency_max_us",
        "Maximum digest apply latency",
        MetricType::Gauge,
        site,
        summary.max_ingest_latency_us,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    tally: Arc<TallyTracker>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, tally.device_count(), &site_id);
            text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    tally: Arc<TallyTracker>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let tally = tally.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let tally = tally.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, tally, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
