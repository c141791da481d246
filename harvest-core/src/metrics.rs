use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::Error;
use crate::scheduler::SchedulerState;
use crate::tracker::InFlightCounter;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "harvest";

const OUTCOME_LABEL: &str = "outcome";

// poll cycle metrics
const CYCLES_TOTAL: &str = "poll_cycles";
const CYCLE_DURATION: &str = "poll_cycle_duration_seconds";
const PAGES_TOTAL: &str = "pages_fetched";
const EVENTS_SUBMITTED: &str = "events_submitted";
const EVENTS_DROPPED: &str = "events_dropped";
const EVENTS_DEFERRED: &str = "events_deferred";
const CURSOR_WATERMARK: &str = "cursor_watermark_seconds";
const CHECKPOINT_FAILURES: &str = "checkpoint_save_failures";

// sink metrics
const EVENTS_ACKED: &str = "events_acknowledged";
const EVENTS_ABANDONED: &str = "events_abandoned";
const EVENTS_IN_FLIGHT: &str = "events_in_flight";

/// The global register of all metrics.
struct GlobalRegistry {
    // registration happens once at startup, a plain mutex is enough
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

/// global_registry is a helper function to get the GLOBAL_REGISTRY object
fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the harvesting engine.
pub(crate) struct HarvestMetrics {
    pub(crate) cycles: Family<Vec<(String, String)>, Counter>,
    pub(crate) cycle_duration: Histogram,
    pub(crate) pages: Counter,
    pub(crate) submitted: Counter,
    pub(crate) dropped: Counter,
    pub(crate) deferred: Counter,
    pub(crate) watermark: Gauge,
    pub(crate) checkpoint_failures: Counter,
    pub(crate) acked: Counter,
    pub(crate) abandoned: Counter,
    pub(crate) in_flight: Gauge,
}

/// 0.1s to ~27min, the range between an idle cycle and a large backlog.
fn exponential_buckets(start: f64, factor: f64, length: u16) -> impl Iterator<Item = f64> {
    iter::successors(Some(start), move |bucket| Some(bucket * factor)).take(length.into())
}

impl HarvestMetrics {
    fn new() -> Self {
        let metrics = Self {
            cycles: Family::<Vec<(String, String)>, Counter>::default(),
            cycle_duration: Histogram::new(exponential_buckets(0.1, 4.0, 8)),
            pages: Counter::default(),
            submitted: Counter::default(),
            dropped: Counter::default(),
            deferred: Counter::default(),
            watermark: Gauge::default(),
            checkpoint_failures: Counter::default(),
            acked: Counter::default(),
            abandoned: Counter::default(),
            in_flight: Gauge::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            CYCLES_TOTAL,
            "Total number of poll cycles by outcome",
            metrics.cycles.clone(),
        );
        registry.register(
            CYCLE_DURATION,
            "Time taken by a poll cycle, in seconds",
            metrics.cycle_duration.clone(),
        );
        registry.register(
            PAGES_TOTAL,
            "Total number of pages fetched from the audit-log API",
            metrics.pages.clone(),
        );
        registry.register(
            EVENTS_SUBMITTED,
            "Total number of events submitted to the sink",
            metrics.submitted.clone(),
        );
        registry.register(
            EVENTS_DROPPED,
            "Total number of events dropped because they could not be translated",
            metrics.dropped.clone(),
        );
        registry.register(
            EVENTS_DEFERRED,
            "Total number of events published after the window end, left for the next window",
            metrics.deferred.clone(),
        );
        registry.register(
            CURSOR_WATERMARK,
            "Cursor watermark as a unix timestamp",
            metrics.watermark.clone(),
        );
        registry.register(
            CHECKPOINT_FAILURES,
            "Total number of failed checkpoint saves",
            metrics.checkpoint_failures.clone(),
        );

        let sink_registry = registry.sub_registry_with_prefix("sink");
        sink_registry.register(
            EVENTS_ACKED,
            "Total number of events delivered by the sink",
            metrics.acked.clone(),
        );
        sink_registry.register(
            EVENTS_ABANDONED,
            "Total number of events abandoned after the sink exhausted its retries",
            metrics.abandoned.clone(),
        );
        sink_registry.register(
            EVENTS_IN_FLIGHT,
            "Number of events submitted but not yet acknowledged",
            metrics.in_flight.clone(),
        );

        metrics
    }
}

static HARVEST_METRICS: OnceLock<HarvestMetrics> = OnceLock::new();

pub(crate) fn harvest_metrics() -> &'static HarvestMetrics {
    HARVEST_METRICS.get_or_init(HarvestMetrics::new)
}

pub(crate) fn cycle_labels(outcome: &str) -> Vec<(String, String)> {
    vec![(OUTCOME_LABEL.to_string(), outcome.to_string())]
}

/// What the health endpoints look at.
#[derive(Clone)]
pub(crate) struct MetricsState {
    pub(crate) scheduler: watch::Receiver<SchedulerState>,
    pub(crate) in_flight: InFlightCounter,
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    harvest_metrics()
        .in_flight
        .set(i64::try_from(state.in_flight.pending()).unwrap_or(i64::MAX));

    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry) {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) async fn start_metrics_https_server(
    addr: SocketAddr,
    metrics_state: MetricsState,
) -> crate::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Generate a self-signed certificate
    let CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| Error::Metrics(format!("Generating self-signed certificate: {}", e)))?;

    let tls_config = RustlsConfig::from_pem(cert.pem().into(), signing_key.serialize_pem().into())
        .await
        .map_err(|e| Error::Metrics(format!("Creating tlsConfig from pem: {}", e)))?;

    let metrics_app = metrics_router(metrics_state);

    axum_server::bind_rustls(addr, tls_config)
        .serve(metrics_app.into_make_service())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {}", e)))?;

    Ok(())
}

/// router for metrics and k8s health endpoints
fn metrics_router(metrics_state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(metrics_state)
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(state): State<MetricsState>) -> impl IntoResponse {
    if *state.scheduler.borrow() == SchedulerState::Stopped {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}
