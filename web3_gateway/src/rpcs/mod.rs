//! Upstream side of the gateway: endpoint state, selection, dispatch, and
//! the two transport clients.

pub mod catalog;
pub mod client_factory;
pub mod dispatcher;
pub mod endpoint;
pub mod http_client;
pub mod registry;
pub mod selector;
pub mod ws_client;

use serde_json::Value;
use tracing::warn;

use crate::errors::{GatewayError, GatewayResult};
use crate::jsonrpc::{SealedRequest, UpstreamResponse};
use crate::jsonrpc_schema::JsonRpcSchema;
use crate::rpcs::endpoint::Endpoint;
use crate::stats::ResponseProfile;

/// Copy a JSON-RPC error object's code/message into the response profile.
/// The batch is still handed back; the dispatcher decides whether to retry.
pub(crate) fn record_error_result(profile: &mut ResponseProfile, result: &UpstreamResponse) {
    match result.error() {
        Some(Value::Object(err)) => {
            profile.code = err.get("code").map(render_scalar);
            profile.message = err.get("message").map(render_scalar);
        }
        other => {
            profile.code = Some("unknown_error".to_string());
            profile.message = other.map(render_scalar);
        }
    }
}

fn render_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        v => v.to_string(),
    }
}

/// Validate each response against the configured schema. A violation is an
/// upstream error so the dispatcher can retry another endpoint.
pub(crate) fn validate_results(
    schema: &JsonRpcSchema,
    profile: &mut ResponseProfile,
    data: &[SealedRequest],
    results: &mut [UpstreamResponse],
) -> GatewayResult<()> {
    for (request, result) in data.iter().zip(results.iter_mut()) {
        if let Err(err) = schema.validate_response(&request.method, result.raw_mut()) {
            warn!(
                method = %request.method,
                response = %serde_json::to_string(result.raw()).unwrap_or_default(),
                "failed to validate response"
            );
            profile.code = Some("schema_validation_failed".to_string());
            profile.message = serde_json::to_string(result.raw()).ok();
            profile.error = Some(err);

            return Err(GatewayError::Upstream("Validating response failed".into()));
        }
    }

    Ok(())
}

/// Track block heights opportunistically: any successful `eth_blockNumber`
/// flowing through an endpoint updates its known height.
pub(crate) fn note_block_numbers(
    endpoint: &Endpoint,
    data: &[SealedRequest],
    results: &[UpstreamResponse],
) {
    for result in results {
        if result.is_error() {
            continue;
        }

        let id = result.correlation_id();
        let matches_block_number = data
            .iter()
            .any(|request| request.id == id && request.method == "eth_blockNumber");
        if !matches_block_number {
            continue;
        }

        if let Some(block_number) = result
            .result()
            .and_then(Value::as_str)
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        {
            endpoint.observe_block_number(block_number);
        }
    }
}
