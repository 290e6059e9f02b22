//! The proxy handlers: token gate, quota debit, dispatch, status mapping,
//! and post-flight accounting.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query};
use axum::response::Response;
use axum::Extension;
use axum_client_ip::InsecureClientIp;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::{error, info, warn};

use crate::app::Web3Gateway;
use crate::errors::{GatewayError, GatewayResult, QueryStatus};
use crate::quota::App;
use crate::reqctx::RequestContext;
use crate::rpcs::endpoint::Endpoint;
use crate::stats::{
    now_millis, AuditRecord, OptionsProfile, QueryProfile, REQUEST_DURATIONS, TOTAL_REQUESTS,
};

pub async fn proxy_chain(
    Extension(gateway): Extension<Arc<Web3Gateway>>,
    InsecureClientIp(ip): InsecureClientIp,
    OriginalUri(uri): OriginalUri,
    Path(chain): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(gateway, ip.to_string(), uri.to_string(), chain, None, headers, query, body).await
}

pub async fn proxy_keyed(
    Extension(gateway): Extension<Arc<Web3Gateway>>,
    InsecureClientIp(ip): InsecureClientIp,
    OriginalUri(uri): OriginalUri,
    Path((apikey, chain)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(
        gateway,
        ip.to_string(),
        uri.to_string(),
        chain,
        Some(apikey),
        headers,
        query,
        body,
    )
    .await
}

pub async fn proxy_rpc(
    Extension(gateway): Extension<Arc<Web3Gateway>>,
    InsecureClientIp(ip): InsecureClientIp,
    OriginalUri(uri): OriginalUri,
    Path(chain): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(gateway, ip.to_string(), uri.to_string(), chain, None, headers, query, body).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_call(
    gateway: Arc<Web3Gateway>,
    peer_ip: String,
    href: String,
    chain_segment: String,
    apikey: Option<String>,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let rc = RequestContext::new(&gateway.config, &chain_segment, apikey, &headers, &query, body);

    let mut profile = QueryProfile {
        id: rc.req_id.clone(),
        method: "POST".to_string(),
        href,
        ip: client_ip(&headers, peer_ip),
        ip_country: headers
            .get("cf-ipcountry")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        chain_id: rc.chain.id,
        start_time: now_millis(),
        options: OptionsProfile::from(&rc.options),
        ..Default::default()
    };

    let mut tenant: Option<Arc<App>> = None;

    let endpoints = gateway.registry.get_all(rc.chain.id).await;
    let supported = endpoints.as_deref().map(|e| !e.is_empty()).unwrap_or(false);

    let (status_code, body) = if !supported {
        warn!(chain = %chain_segment, "unsupported chain");
        let err = GatewayError::NotFound("Unsupported".into());
        profile.status = err.query_status();
        error_response(err)
    } else {
        let endpoints = endpoints.expect("checked above");
        match call(&gateway, &rc, &endpoints, &mut profile, &mut tenant).await {
            Ok(data) => (StatusCode::OK, data),
            Err(err) => {
                profile.status = err.query_status();
                error_response(err)
            }
        }
    };

    profile.end_time = now_millis();

    // quota compensation: upstream failures still bill, everything refused
    // or broken in-gateway does not
    if let (Some(quota), Some(tenant)) = (&gateway.quota, &tenant) {
        match profile.status {
            QueryStatus::Success | QueryStatus::Fail => quota.affected(tenant),
            _ => quota.unaffected(tenant),
        }
    }

    let chain_code = if supported {
        rc.chain.code.clone()
    } else {
        "unknown".to_string()
    };
    let app_name = tenant
        .as_ref()
        .map(|t| t.info.name.clone())
        .unwrap_or_else(|| "unknown".to_string());

    if gateway.audit.is_some() && rc.chain.id != 0 {
        let record = AuditRecord {
            chain: rc.chain.clone(),
            app_id: profile.app_id,
            app_name: app_name.clone(),
            profile: profile.clone(),
        };
        if let Some(audit) = &gateway.audit {
            audit.publish(record);
        }
    }

    let status_label = profile.status.to_string();
    TOTAL_REQUESTS
        .with_label_values(&[chain_code.as_str(), app_name.as_str(), status_label.as_str()])
        .inc();
    REQUEST_DURATIONS
        .with_label_values(&[chain_code.as_str(), app_name.as_str()])
        .observe((profile.end_time - profile.start_time) as f64 / 1000.0);

    info!(
        status = %profile.status,
        ms = profile.end_time - profile.start_time,
        "POST {} {}",
        profile.href,
        status_code.as_u16()
    );

    respond(&gateway, status_code, body)
}

/// Resolve the tenant (when quotas are on) and run the proxy under the
/// caller's deadline.
async fn call(
    gateway: &Arc<Web3Gateway>,
    rc: &RequestContext,
    endpoints: &[Arc<Endpoint>],
    profile: &mut QueryProfile,
    tenant: &mut Option<Arc<App>>,
) -> GatewayResult<Vec<u8>> {
    let work = async {
        let mut app_name = "unknown".to_string();

        if let Some(quota) = &gateway.quota {
            let token = rc
                .token
                .as_deref()
                .ok_or(GatewayError::Forbidden("Token is empty".into()))?;

            let app = match quota.access(token, &rc.bucket).await {
                Ok(app) => app,
                Err(err @ GatewayError::Timeout(_)) => return Err(err),
                Err(err @ GatewayError::Forbidden(_)) => return Err(err),
                Err(err) => {
                    error!(%err, "get app error");
                    return Err(GatewayError::Forbidden("Token is invalid".into()));
                }
            };

            if app.balance() <= -1 {
                warn!(
                    "proxy overage. ⏳ {}/{} | ♻️ {}/s",
                    app.balance(),
                    app.info.capacity,
                    app.info.rate
                );
                return Err(GatewayError::TooManyRequests("Token is overage".into()));
            }

            profile.app_id = app.info.id;
            app_name = app.info.name.clone();
            *tenant = Some(app);
        }

        gateway.proxy(rc, endpoints, &app_name, profile).await
    };

    match tokio::time::timeout(rc.options.timeout, work).await {
        Ok(out) => out,
        Err(elapsed) => Err(GatewayError::Timeout(Some(elapsed))),
    }
}

fn client_ip(headers: &HeaderMap, peer_ip: String) -> String {
    for name in ["cf-connecting-ip", "true-client-ip"] {
        if let Some(ip) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    peer_ip
}

fn error_response(err: GatewayError) -> (StatusCode, Vec<u8>) {
    let (status, body) = err.as_response_parts();

    (status, serde_json::to_vec(&body).unwrap_or_default())
}

fn respond(gateway: &Web3Gateway, status: StatusCode, body: Vec<u8>) -> Response {
    let mut response = Response::builder()
        .status(status)
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "*")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Expose-Headers", "*")
        .header("Referrer-Policy", "same-origin")
        .header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

    if let Ok(server) = HeaderValue::from_str(&gateway.config.app.name) {
        response = response.header(http::header::SERVER, server);
    }

    response
        .body(axum::body::boxed(axum::body::Full::from(body)))
        .expect("static response builds")
}
