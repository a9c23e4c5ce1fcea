//! The `/sub` endpoint: admission, identity, aggregation, delivery.

use crate::error::RequestError;
use crate::fetch::fingerprint;
use crate::gateway::challenge_pages::{js_challenge_page, pow_challenge_page};
use crate::gateway::{client_context, AppState, ClientContext, SidSelector};
use crate::metrics;
use crate::sanitize;
use crate::shield::{AdmitContext, ChallengeKind, Decision};
use axum::extract::{ConnectInfo, OriginalUri, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, info, warn};

/// Subscription payloads are per-client and must never be cached by
/// intermediaries.
const NO_STORE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// GET /sub — the aggregation endpoint.
pub async fn subscribe_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ctx = client_context(&headers, peer, &uri, state.challenges.cookie_name());

    match state
        .gate
        .admit(&AdmitContext {
            ip: ctx.ip,
            token: ctx.token.as_deref(),
            corpus: &ctx.corpus,
        })
        .await
    {
        Decision::Allow => {}
        Decision::Challenge(kind) => {
            metrics::record_request("challenged");
            return challenge_response(&state, kind, &ctx).await;
        }
        Decision::Reject { status, reason } => {
            metrics::record_request("rejected");
            info!(ip = %ctx.ip, reason = reason.as_str(), "Request rejected");
            return plain(
                StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN),
                "request refused",
            );
        }
    }
    metrics::record_request("allowed");

    match serve(&state, &ctx, &params).await {
        Ok(response) => response,
        Err(failure) => failure,
    }
}

/// The post-admission flow, with the error side already rendered.
async fn serve(
    state: &AppState,
    ctx: &ClientContext,
    params: &HashMap<String, String>,
) -> Result<Response, Response> {
    let uuid = params
        .get("uuid")
        .map(String::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| request_error(&RequestError::Validation("missing uuid".to_string())))?;
    let target = params.get("target").cloned().unwrap_or_default();
    let selector =
        SidSelector::parse(params.get("sid").map(String::as_str)).map_err(|e| request_error(&e))?;

    let user = state
        .db
        .find_user_by_uuid(uuid)
        .await
        .map_err(internal)?
        .ok_or_else(|| request_error(&RequestError::UnknownClient))?;
    if user.is_blocked {
        return Err(request_error(&RequestError::BlockedClient));
    }

    let ids: Vec<i64> = match &selector {
        SidSelector::All => state.db.all_subscription_ids().await.map_err(internal)?,
        SidSelector::One(id) => {
            let sub = state
                .db
                .single_subscription(*id)
                .await
                .map_err(internal)?
                .ok_or_else(|| request_error(&RequestError::NoSubscriptions))?;
            // A single subscription with no conversion requested is
            // proxied as-is.
            if target.is_empty() {
                let result = state
                    .fetcher
                    .fetch_raw(&sub.link, ctx.user_agent.as_deref())
                    .await
                    .map_err(|e| upstream_error(&e))?;
                record_usage(state, user.id, &[sub.id], ctx);
                return Ok(content(result.body.to_vec(), &result.content_type));
            }
            vec![sub.id]
        }
        SidSelector::Many(ids) => ids.clone(),
    };
    if ids.is_empty() {
        return Err(request_error(&RequestError::NoSubscriptions));
    }

    let key = fingerprint(&ids, &target);
    if let Some(entry) = state.cache.get(&key).await {
        record_usage(state, user.id, &ids, ctx);
        return Ok(content(entry.content, &entry.content_type));
    }

    let links = state.db.subscription_links(&ids).await.map_err(internal)?;
    if links.is_empty() {
        return Err(request_error(&RequestError::NoSubscriptions));
    }
    let result = state
        .fetcher
        .resolve(&links, &target, ctx.user_agent.as_deref())
        .await
        .map_err(|e| upstream_error(&e))?;
    let body = sanitize::postprocess(&target, &result.body);
    state
        .cache
        .put(&key, body.clone(), result.content_type.clone())
        .await;
    record_usage(state, user.id, &ids, ctx);
    Ok(content(body, &result.content_type))
}

/// POST /sub — proof-of-work submission.
pub async fn pow_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Form(form): Form<PowForm>,
) -> Response {
    let ctx = client_context(&headers, peer, &uri, state.challenges.cookie_name());

    // Submissions still burn ban and rate budget; only the challenge
    // escalation itself is skipped here.
    if let Decision::Reject { status, reason } = state.gate.precheck(ctx.ip).await {
        metrics::record_request("rejected");
        info!(ip = %ctx.ip, reason = reason.as_str(), "Solution submission rejected");
        return plain(
            StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN),
            "request refused",
        );
    }

    let Some(token) = ctx.token.as_deref() else {
        return plain(StatusCode::FORBIDDEN, "missing challenge token");
    };
    let Some(solution) = form.pow_solution.as_deref() else {
        return plain(StatusCode::BAD_REQUEST, "missing solution");
    };
    match state.challenges.verify_pow(token, solution).await {
        Ok(true) => {
            info!(ip = %ctx.ip, "Proof-of-work accepted");
            if ctx.is_api {
                return (
                    StatusCode::OK,
                    [(header::CACHE_CONTROL, NO_STORE)],
                    serde_json::json!({ "status": "ok" }).to_string(),
                )
                    .into_response();
            }
            // Re-issue the original request as a GET now that the
            // token is verified.
            (
                StatusCode::SEE_OTHER,
                [
                    (header::LOCATION, uri.to_string()),
                    (header::CACHE_CONTROL, NO_STORE.to_string()),
                ],
            )
                .into_response()
        }
        Ok(false) => {
            info!(ip = %ctx.ip, "Proof-of-work rejected");
            plain(StatusCode::FORBIDDEN, "invalid solution")
        }
        Err(e) => {
            error!(error = %e, "Failed to verify proof-of-work");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PowForm {
    pub pow_solution: Option<String>,
}

async fn challenge_response(state: &AppState, kind: ChallengeKind, ctx: &ClientContext) -> Response {
    let engine = &state.challenges;
    let token = crate::shield::ChallengeEngine::new_token();
    let lifetime = engine.cookie_lifetime().as_secs();

    if kind == ChallengeKind::JsMath {
        if let Err(e) = engine.issue_js(&token).await {
            warn!(error = %e, "Failed to record challenge issuance");
        }
    }

    let (content_type, body) = if ctx.is_api {
        let body = serde_json::json!({
            "status": "challenge",
            "type": match kind {
                ChallengeKind::JsMath => "js",
                ChallengeKind::ProofOfWork => "pow",
            },
            "token": token,
            "difficulty": engine.pow_difficulty(),
        });
        ("application/json", body.to_string())
    } else {
        let page = match kind {
            ChallengeKind::JsMath => js_challenge_page(engine.cookie_name(), &token, lifetime),
            ChallengeKind::ProofOfWork => {
                pow_challenge_page(engine.cookie_name(), &token, engine.pow_difficulty(), lifetime)
            }
        };
        ("text/html; charset=utf-8", page)
    };

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, NO_STORE.to_string()),
        ],
        body,
    )
        .into_response();
    // Only the proof-of-work tier hands the token over in a header;
    // the arithmetic tier requires the page script to write the cookie
    if kind == ChallengeKind::ProofOfWork {
        match HeaderValue::from_str(&cookie(engine.cookie_name(), &token, lifetime)) {
            Ok(value) => {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Challenge cookie is not a valid header value"),
        }
    }
    response
}

/// Usage accounting runs detached so the transaction never delays
/// response bytes; failures only log.
fn record_usage(state: &AppState, user_id: i64, ids: &[i64], ctx: &ClientContext) {
    let db = state.db.clone();
    let ids = ids.to_vec();
    let ip = ctx.ip;
    tokio::spawn(async move {
        if let Err(e) = db.record_usage(user_id, &ids, ip).await {
            error!(error = %e, user_id = user_id, "Failed to record subscription usage");
        }
    });
}

fn cookie(name: &str, token: &str, lifetime: u64) -> String {
    format!("{name}={token}; Path=/; Max-Age={lifetime}")
}

fn plain(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(header::CACHE_CONTROL, NO_STORE)],
        message.to_string(),
    )
        .into_response()
}

fn content(body: Vec<u8>, content_type: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, NO_STORE.to_string()),
        ],
        body,
    )
        .into_response()
}

fn request_error(e: &RequestError) -> Response {
    plain(
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST),
        e.public_message(),
    )
}

fn upstream_error(e: &crate::error::UpstreamError) -> Response {
    warn!(error = %e, "Upstream fetch failed");
    plain(
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_GATEWAY),
        e.public_message(),
    )
}

fn internal(e: crate::error::DbError) -> Response {
    error!(error = %e, "Database failure");
    plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
