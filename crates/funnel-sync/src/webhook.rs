//! # Lead Webhooks
//!
//! Parses Kommo lead webhook deliveries into the ids they name.
//!
//! Kommo posts `application/x-www-form-urlencoded` bodies such as:
//! ```text
//! leads[add][0][id]=101&leads[add][0][status_id]=5
//! &leads[status][0][id]=102&leads[status][0][old_status_id]=4
//! &leads[delete][0][id]=103
//! account[id]=42&account[subdomain]=acme
//! ```
//! Only the ids matter: the payload is never trusted as lead data. Ids from
//! `add`, `update` and `status` are re-fetched from the CRM; `delete` ids are
//! soft-deleted locally.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Lead ids named by one webhook delivery, grouped by event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadWebhook {
    #[serde(default)]
    pub add: Vec<i64>,
    #[serde(default)]
    pub update: Vec<i64>,
    #[serde(default)]
    pub status: Vec<i64>,
    #[serde(default)]
    pub delete: Vec<i64>,
}

impl LeadWebhook {
    /// Parses a form-encoded delivery.
    ///
    /// Keys outside `leads[...]` are ignored; a `leads[...][id]` value that
    /// is not a positive integer fails the whole delivery.
    pub fn from_form(body: &str) -> SyncResult<Self> {
        let mut webhook = LeadWebhook::default();

        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            let Some((event, field)) = parse_key(&key) else {
                continue;
            };
            if field != "id" {
                continue;
            }

            let id: i64 = value
                .trim()
                .parse()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| {
                    SyncError::InvalidWebhook(format!("{key} is not a lead id: '{value}'"))
                })?;

            match event {
                "add" => webhook.add.push(id),
                "update" => webhook.update.push(id),
                "status" => webhook.status.push(id),
                "delete" => webhook.delete.push(id),
                other => debug!(event = other, "Ignoring unknown webhook event"),
            }
        }

        Ok(webhook)
    }

    /// Ids to re-fetch and upsert, ascending, excluding deleted ones.
    pub fn upsert_ids(&self) -> Vec<i64> {
        let deleted: BTreeSet<i64> = self.delete.iter().copied().collect();
        self.add
            .iter()
            .chain(&self.update)
            .chain(&self.status)
            .copied()
            .filter(|id| !deleted.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Ids to soft-delete, ascending.
    pub fn delete_ids(&self) -> Vec<i64> {
        self.delete
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.update.is_empty()
            && self.status.is_empty()
            && self.delete.is_empty()
    }
}

/// Splits `leads[event][index][field]` into (`event`, `field`).
fn parse_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("leads[")?;
    let (event, rest) = rest.split_once("][")?;
    let (_index, rest) = rest.split_once("][")?;
    let field = rest.strip_suffix(']')?;
    Some((event, field))
}

/// What applying a webhook changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    /// Leads re-fetched and written.
    pub upserted: u64,
    /// Leads soft-deleted, including ones gone upstream.
    pub soft_deleted: u64,
    /// Leads that could not be fetched.
    pub errors: u64,
}
