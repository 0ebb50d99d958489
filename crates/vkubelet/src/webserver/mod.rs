//! Server is an HTTP(S) server for answering kubelet callbacks.
//!
//! Logs and exec calls are served on the TLS pod listener. Stats are served on
//! the plain HTTP metrics listener. Both answer health checks. Every endpoint
//! dispatches straight to the matching provider capability and answers
//! `501 Not Implemented` when the provider lacks it.

use std::convert::Infallible;
use std::net::SocketAddr;

use http::status::StatusCode;
use http::Response;
use hyper::Body;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::error::{classify, ErrorKind};
use crate::log::{Options, Sender};
use crate::provider::{Capabilities, ExecRequest, ProviderError};

const PING: &str = "this is the virtual kubelet HTTP server";

fn health() -> impl Filter<Extract = (&'static str,), Error = Rejection> + Clone {
    let health = warp::get().and(warp::path("healthz")).map(|| PING);
    let ping = warp::get().and(warp::path::end()).map(|| PING);
    ping.or(health).unify()
}

/// Routes of the pod listener: health, container logs and exec.
pub fn pod_routes(
    capabilities: Capabilities,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let logs_caps = capabilities.clone();
    let logs = warp::get()
        .and(warp::path!("containerLogs" / String / String / String))
        .and(warp::query::<Options>())
        .and_then(move |namespace, pod, container, opts| {
            let capabilities = logs_caps.clone();
            get_container_logs(capabilities, namespace, pod, container, opts)
        });

    let exec_caps = capabilities;
    let exec = warp::post()
        .and(warp::path!("exec" / String / String / String))
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::body::bytes())
        .and_then(move |namespace, pod, container, query: String, body| {
            let capabilities = exec_caps.clone();
            let request = exec_request(&query, body);
            post_exec(capabilities, namespace, pod, container, request)
        });

    health().or(logs).or(exec)
}

/// Routes of the metrics listener: health and the stats summary.
pub fn metrics_routes(
    capabilities: Capabilities,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let stats = warp::get()
        .and(warp::path!("stats" / "summary"))
        .and_then(move || get_stats_summary(capabilities.clone()));

    health().or(stats)
}

/// Start the HTTP servers and serve until `token` is cancelled.
///
/// The metrics listener always runs. The pod listener needs TLS and is only
/// started when both a certificate and a key are configured.
pub async fn start(
    config: &ServerConfig,
    capabilities: Capabilities,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let metrics_token = token.clone();
    let (metrics_addr, metrics) = warp::serve(metrics_routes(capabilities.clone()))
        .try_bind_with_graceful_shutdown(config.metrics_addr, async move {
            metrics_token.cancelled().await
        })?;
    info!(addr = %metrics_addr, "metrics server listening");

    let pods = match config.tls_files() {
        Some((cert, key)) => {
            tokio::fs::metadata(cert).await?;
            tokio::fs::metadata(key).await?;
            let addr = SocketAddr::new(config.addr, config.port);
            let pods_token = token.clone();
            let (addr, server) = warp::serve(pod_routes(capabilities))
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, async move { pods_token.cancelled().await });
            info!(%addr, "pod server listening");
            Some(server)
        }
        None => {
            warn!("TLS certificate or key not configured, pod server (logs and exec) disabled");
            None
        }
    };

    match pods {
        Some(pods) => {
            futures::future::join(metrics, pods).await;
        }
        None => metrics.await,
    }
    debug!("HTTP servers stopped");
    Ok(())
}

/// Get the logs from the running container.
///
/// Implements the kubelet path /containerLogs/{namespace}/{pod}/{container}
#[instrument(level = "info", skip(capabilities))]
async fn get_container_logs(
    capabilities: Capabilities,
    namespace: String,
    pod: String,
    container: String,
    opts: Options,
) -> Result<Response<Body>, Infallible> {
    debug!("Got container log request");
    let logs = match capabilities.logs() {
        Some(logs) => logs.clone(),
        None => return Ok(not_supported("logs")),
    };
    let (sender, log_body) = Body::channel();
    let log_sender = Sender::new(sender, opts);

    match logs
        .get_container_logs(&namespace, &pod, &container, log_sender)
        .await
    {
        Ok(()) => Ok(Response::new(log_body)),
        Err(e) => {
            error!(error = %e, "Error fetching logs");
            Ok(error_response(&e))
        }
    }
}

/// Run a pod exec command and get the output
///
/// Implements the kubelet path /exec/{namespace}/{pod}/{container}
#[instrument(level = "info", skip(capabilities, request), fields(command = ?request.command))]
async fn post_exec(
    capabilities: Capabilities,
    namespace: String,
    pod: String,
    container: String,
    request: ExecRequest,
) -> Result<Response<Body>, Infallible> {
    debug!("Got exec request");
    let exec = match capabilities.exec() {
        Some(exec) => exec.clone(),
        None => return Ok(not_supported("exec")),
    };
    if request.command.is_empty() {
        return Ok(return_with_code(
            StatusCode::BAD_REQUEST,
            "No command given.".to_owned(),
        ));
    }

    match exec
        .run_in_container(&namespace, &pod, &container, request)
        .await
    {
        Ok(output) => {
            let mut body = output.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            Ok(Response::new(body.into()))
        }
        Err(e) => {
            error!(error = %e, "Error running command");
            Ok(error_response(&e))
        }
    }
}

/// Get the resource usage summary.
///
/// Implements the kubelet path /stats/summary
#[instrument(level = "debug", skip(capabilities))]
async fn get_stats_summary(capabilities: Capabilities) -> Result<Response<Body>, Infallible> {
    let stats = match capabilities.stats() {
        Some(stats) => stats.clone(),
        None => return Ok(not_supported("stats")),
    };
    match stats.get_stats_summary().await {
        Ok(summary) => Ok(warp::reply::json(&summary).into_response()),
        Err(e) => {
            error!(error = %e, "Error fetching stats summary");
            Ok(error_response(&e))
        }
    }
}

fn exec_request(query: &str, body: hyper::body::Bytes) -> ExecRequest {
    let mut request = ExecRequest::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "command" => request.command.push(value.into_owned()),
            "tty" => request.tty = value == "true" || value == "1",
            _ => {}
        }
    }
    if !body.is_empty() {
        request.stdin = Some(body.to_vec());
    }
    request
}

fn error_response(e: &anyhow::Error) -> Response<Body> {
    let code = match e.downcast_ref::<ProviderError>() {
        Some(ProviderError::PodNotFound { .. }) | Some(ProviderError::ContainerNotFound { .. }) => {
            StatusCode::NOT_FOUND
        }
        Some(ProviderError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        _ => match classify(e) {
            ErrorKind::CapabilityUnsupported => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    if code == StatusCode::NOT_IMPLEMENTED {
        return return_with_code(code, "Not implemented in provider.".to_owned());
    }
    return_with_code(code, format!("Server error: {}", e))
}

fn not_supported(what: &str) -> Response<Body> {
    return_with_code(
        StatusCode::NOT_IMPLEMENTED,
        format!("{} not supported by provider.", what),
    )
}

fn return_with_code(code: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = code;
    response
}
