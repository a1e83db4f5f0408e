//! Git-forge webhook contract: signature verification and event planning.
//!
//! The daemon acknowledges webhook deliveries before any work starts; the
//! scan itself is fire-and-forget. Signatures are HMAC-SHA256 over the raw
//! request body, compared with the same timing-safe equality the bearer
//! token uses.

use hmac::Mac;
use serde_json::Value;
use sha2::Sha256;

use crate::auth::constant_time_eq;

const SIGNATURE_PREFIX: &str = "sha256=";

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(key)
        .expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a `sha256=<hex>` signature header against the raw body.
pub fn verify_signature(secret: &[u8], raw_body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(presented) = hex::decode(hex_digest) else {
        return false;
    };
    let expected = hmac_sha256(secret, raw_body);
    constant_time_eq(&presented, &expected)
}

/// What a webhook delivery asks of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    DiffScan {
        base_ref: String,
        head_ref: String,
    },
    Ignore,
}

/// Plan the scan for a delivery: pull requests diff base..head on open and
/// synchronize; pushes to the default branch diff before..after.
pub fn plan_delivery(event: &str, payload: &Value) -> WebhookAction {
    match event {
        "pull_request" => {
            let action = payload["action"].as_str().unwrap_or_default();
            if action != "opened" && action != "synchronize" {
                return WebhookAction::Ignore;
            }
            let base = payload["pull_request"]["base"]["ref"].as_str();
            let head = payload["pull_request"]["head"]["ref"].as_str();
            match (base, head) {
                (Some(base), Some(head)) => WebhookAction::DiffScan {
                    base_ref: base.to_string(),
                    head_ref: head.to_string(),
                },
                _ => WebhookAction::Ignore,
            }
        }
        "push" => {
            let default_branch = payload["repository"]["default_branch"]
                .as_str()
                .unwrap_or("main");
            let pushed_ref = payload["ref"].as_str().unwrap_or_default();
            if pushed_ref != format!("refs/heads/{default_branch}") {
                return WebhookAction::Ignore;
            }
            let before = payload["before"].as_str();
            let after = payload["after"].as_str();
            match (before, after) {
                (Some(before), Some(after)) => WebhookAction::DiffScan {
                    base_ref: before.to_string(),
                    head_ref: after.to_string(),
                },
                _ => WebhookAction::Ignore,
            }
        }
        _ => WebhookAction::Ignore,
    }
}
