//! Webhook endpoints for Git providers.
//!
//! Signatures are verified against the configured secret (401 on
//! mismatch), replays are deduplicated by the provider's delivery id,
//! and every event — accepted or rejected — lands in `webhook_events`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use chengis_core::build::{TriggerDescriptor, TriggerKind};
use chengis_core::pipeline::Trigger;
use chengis_core::policy::branch_matches;
use chengis_db::{JobRecord, NewWebhookEvent};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/github", post(github_webhook))
        .route("/gitlab", post(gitlab_webhook))
}

/// A provider-neutral view of a push event.
#[derive(Debug, Clone)]
struct PushEvent {
    repo_url: Option<String>,
    branch: Option<String>,
    commit_sha: Option<String>,
    actor: Option<String>,
}

async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event_type = header(&headers, "X-GitHub-Event").unwrap_or_else(|| "unknown".into());
    let delivery_id = header(&headers, "X-GitHub-Delivery");
    let signature = header(&headers, "X-Hub-Signature-256");

    let signature_valid = match state.config.webhook_secret.as_deref() {
        Some(secret) => verify_github_signature(secret, &body, signature.as_deref()),
        None => {
            warn!("no webhook secret configured; accepting unsigned github event");
            false
        }
    };
    if state.config.webhook_secret.is_some() && !signature_valid {
        record_event(
            &state,
            "github",
            &event_type,
            delivery_id,
            None,
            false,
            "rejected",
            0,
            0,
            body.len(),
            0,
        )
        .await;
        return Err(ApiError::Unauthorized("invalid webhook signature".into()));
    }

    let push = if event_type == "push" {
        parse_github_push(&body)
    } else {
        None
    };
    process_webhook(
        state,
        "github",
        &event_type,
        delivery_id,
        body,
        signature_valid,
        push,
    )
    .await
}

async fn gitlab_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event_type = header(&headers, "X-Gitlab-Event").unwrap_or_else(|| "unknown".into());
    let delivery_id = header(&headers, "X-Gitlab-Event-UUID");
    let token = header(&headers, "X-Gitlab-Token");

    let signature_valid = match state.config.webhook_secret.as_deref() {
        Some(secret) => token.as_deref() == Some(secret),
        None => {
            warn!("no webhook secret configured; accepting unsigned gitlab event");
            false
        }
    };
    if state.config.webhook_secret.is_some() && !signature_valid {
        record_event(
            &state,
            "gitlab",
            &event_type,
            delivery_id,
            None,
            false,
            "rejected",
            0,
            0,
            body.len(),
            0,
        )
        .await;
        return Err(ApiError::Unauthorized("invalid webhook token".into()));
    }

    let push = parse_gitlab_push(&body);
    process_webhook(
        state,
        "gitlab",
        &event_type,
        delivery_id,
        body,
        signature_valid,
        push,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn process_webhook(
    state: AppState,
    provider: &str,
    event_type: &str,
    delivery_id: Option<String>,
    body: Bytes,
    signature_valid: bool,
    push: Option<PushEvent>,
) -> Result<StatusCode, ApiError> {
    let started = Instant::now();

    // Idempotency: the same delivery must not trigger builds twice.
    // When the provider sends no delivery id, a payload digest stands
    // in for it.
    let delivery_id = delivery_id.or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(event_type.as_bytes());
        hasher.update(&body);
        Some(hex::encode(hasher.finalize()))
    });
    if let Some(id) = delivery_id.as_deref() {
        if state.webhook_events.seen(provider, id).await? {
            info!(provider, delivery = id, "duplicate webhook delivery ignored");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&[provider, "duplicate"])
                .inc();
            return Ok(StatusCode::OK);
        }
    }

    let Some(push) = push else {
        info!(provider, event = event_type, "ignoring non-push event");
        record_event(
            &state,
            provider,
            event_type,
            delivery_id,
            None,
            signature_valid,
            "ignored",
            0,
            0,
            body.len(),
            started.elapsed().as_millis() as i64,
        )
        .await;
        return Ok(StatusCode::OK);
    };

    info!(
        provider,
        repo = ?push.repo_url,
        branch = ?push.branch,
        sha = ?push.commit_sha,
        "processing push event"
    );

    let candidates = state.jobs.with_source().await?;
    let matched: Vec<&JobRecord> = candidates
        .iter()
        .filter(|job| job_matches(job, &push))
        .collect();

    let mut triggered = 0;
    for job in &matched {
        let mut parameters = HashMap::new();
        if let Some(sha) = &push.commit_sha {
            parameters.insert("commit_sha".to_string(), sha.clone());
        }
        let trigger = TriggerDescriptor {
            kind: TriggerKind::Webhook,
            parameters,
            branch: push.branch.clone(),
            parent_build_id: None,
            actor: push.actor.clone(),
        };
        match state.runner.trigger(job, trigger).await {
            Ok(build) => {
                triggered += 1;
                info!(job = %job.name, build = build.build_number, "webhook triggered build");
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "failed to trigger build from webhook");
            }
        }
    }
    if triggered > 0 {
        state.dispatcher.wake();
    }

    state
        .metrics
        .webhook_events_total
        .with_label_values(&[provider, "accepted"])
        .inc();
    record_event(
        &state,
        provider,
        event_type,
        delivery_id,
        Some(&push),
        signature_valid,
        "accepted",
        matched.len() as i32,
        triggered,
        body.len(),
        started.elapsed().as_millis() as i64,
    )
    .await;

    Ok(StatusCode::OK)
}

#[allow(clippy::too_many_arguments)]
async fn record_event(
    state: &AppState,
    provider: &str,
    event_type: &str,
    delivery_id: Option<String>,
    push: Option<&PushEvent>,
    signature_valid: bool,
    status: &str,
    matched_jobs: i32,
    triggered_builds: i32,
    payload_size: usize,
    processing_ms: i64,
) {
    let event = NewWebhookEvent {
        provider: provider.to_string(),
        event_type: event_type.to_string(),
        delivery_id,
        repo_url: push.and_then(|p| p.repo_url.clone()),
        branch: push.and_then(|p| p.branch.clone()),
        commit_sha: push.and_then(|p| p.commit_sha.clone()),
        signature_valid,
        status: status.to_string(),
        matched_jobs,
        triggered_builds,
        payload_size: payload_size as i32,
        processing_ms,
        org_id: None,
    };
    if let Err(e) = state.webhook_events.record(&event).await {
        warn!(provider, error = %e, "failed to record webhook event");
    }
    if status != "accepted" {
        state
            .metrics
            .webhook_events_total
            .with_label_values(&[provider, status])
            .inc();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn parse_github_push(body: &[u8]) -> Option<PushEvent> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    let branch = payload
        .get("ref")
        .and_then(|r| r.as_str())
        .and_then(|r| r.strip_prefix("refs/heads/"))
        .map(String::from);
    Some(PushEvent {
        repo_url: payload
            .pointer("/repository/clone_url")
            .or_else(|| payload.pointer("/repository/html_url"))
            .and_then(|u| u.as_str())
            .map(String::from),
        branch,
        commit_sha: payload.get("after").and_then(|s| s.as_str()).map(String::from),
        actor: payload
            .pointer("/pusher/name")
            .and_then(|n| n.as_str())
            .map(String::from),
    })
}

fn parse_gitlab_push(body: &[u8]) -> Option<PushEvent> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    if payload.get("object_kind").and_then(|k| k.as_str()) != Some("push") {
        return None;
    }
    let branch = payload
        .get("ref")
        .and_then(|r| r.as_str())
        .and_then(|r| r.strip_prefix("refs/heads/"))
        .map(String::from);
    Some(PushEvent {
        repo_url: payload
            .pointer("/project/git_http_url")
            .or_else(|| payload.pointer("/project/web_url"))
            .and_then(|u| u.as_str())
            .map(String::from),
        branch,
        commit_sha: payload
            .get("checkout_sha")
            .or_else(|| payload.get("after"))
            .and_then(|s| s.as_str())
            .map(String::from),
        actor: payload
            .get("user_username")
            .and_then(|n| n.as_str())
            .map(String::from),
    })
}

/// Does a job's declared source accept this push?
fn job_matches(job: &JobRecord, push: &PushEvent) -> bool {
    let Ok(pipeline) = job.pipeline() else {
        return false;
    };
    let Some(source) = &pipeline.source else {
        return false;
    };
    let Some(push_url) = &push.repo_url else {
        return false;
    };
    if normalize_repo_url(&source.url) != normalize_repo_url(push_url) {
        return false;
    }

    // Push triggers with branch filters take precedence; otherwise the
    // declared source branch decides; otherwise every branch matches.
    let push_triggers: Vec<&Vec<String>> = pipeline
        .triggers
        .iter()
        .filter_map(|t| match t {
            Trigger::Push { branches } => Some(branches),
            _ => None,
        })
        .collect();
    match (&push.branch, push_triggers.is_empty()) {
        (Some(branch), false) => push_triggers
            .iter()
            .any(|branches| branches.is_empty() || branch_matches(branch, branches)),
        (Some(branch), true) => match &source.branch {
            Some(declared) => declared == branch,
            None => true,
        },
        (None, _) => false,
    }
}

/// Host-normalised repository URL: scheme, credentials, a trailing
/// `.git` and case differences in the host never prevent a match.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim();
    // scp-like syntax: git@host:owner/repo.git
    if let Some(rest) = url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            return format!(
                "{}/{}",
                host.to_lowercase(),
                path.trim_end_matches(".git").trim_matches('/')
            );
        }
    }
    match url::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let path = parsed.path().trim_end_matches(".git").trim_matches('/');
            format!("{host}/{path}")
        }
        Err(_) => url.trim_end_matches(".git").trim_matches('/').to_lowercase(),
    }
}

/// Verify a GitHub `X-Hub-Signature-256` header.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take any size key");
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_equivalent_urls() {
        let expected = "github.com/acme/widget";
        for url in [
            "https://github.com/acme/widget.git",
            "https://github.com/acme/widget",
            "git@github.com:acme/widget.git",
            "https://GITHUB.COM/acme/widget",
        ] {
            assert_eq!(normalize_repo_url(url), expected, "for {url}");
        }
    }

    #[test]
    fn different_repos_stay_distinct() {
        assert_ne!(
            normalize_repo_url("https://github.com/acme/widget"),
            normalize_repo_url("https://github.com/acme/gadget")
        );
    }

    #[test]
    fn github_signature_verification() {
        let secret = "s3cret";
        let body = b"{\"zen\":\"ok\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_github_signature(secret, body, Some(&sig)));
        assert!(!verify_github_signature(secret, body, Some("sha256=00")));
        assert!(!verify_github_signature(secret, body, None));
        assert!(!verify_github_signature("other", body, Some(&sig)));
    }

    #[test]
    fn parses_github_push_payload() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": { "clone_url": "https://github.com/acme/widget.git" },
            "pusher": { "name": "alice" },
        });
        let push = parse_github_push(body.to_string().as_bytes()).unwrap();
        assert_eq!(push.branch.as_deref(), Some("main"));
        assert_eq!(push.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(push.actor.as_deref(), Some("alice"));
    }

    #[test]
    fn parses_gitlab_push_payload_and_rejects_other_kinds() {
        let push_body = serde_json::json!({
            "object_kind": "push",
            "ref": "refs/heads/dev",
            "checkout_sha": "def456",
            "project": { "git_http_url": "https://gitlab.com/acme/widget.git" },
            "user_username": "bob",
        });
        let push = parse_gitlab_push(push_body.to_string().as_bytes()).unwrap();
        assert_eq!(push.branch.as_deref(), Some("dev"));

        let mr_body = serde_json::json!({ "object_kind": "merge_request" });
        assert!(parse_gitlab_push(mr_body.to_string().as_bytes()).is_none());
    }
}
