//! Tracking service contract: per-recipient tokens, open/click counters,
//! and HTML instrumentation.

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use drip_core::{DripError, DripResult};

use crate::types::{EngagementCounts, TrackingOptions};

pub trait TrackingService: Send + Sync {
    fn get_or_create_token(&self, campaign_id: &str, email: &str) -> DripResult<String>;

    /// The token for the recipient, if one was ever issued.
    fn find_token(&self, campaign_id: &str, email: &str) -> Option<String>;

    fn engagement(&self, token: &str) -> DripResult<EngagementCounts>;

    fn inject_tracking(
        &self,
        html: &str,
        token: &str,
        base_url: &str,
        options: TrackingOptions,
    ) -> String;
}

/// Synthetic campaign id under which a sequence's tracking tokens are issued.
pub fn campaign_key(sequence_id: Uuid) -> String {
    format!("sequence-{sequence_id}")
}

/// In-process tracking service. Opens and clicks are fed in by whatever
/// receives the pixel and redirect hits.
#[derive(Default)]
pub struct InMemoryTracking {
    tokens: DashMap<(String, String), String>,
    counts: DashMap<String, EngagementCounts>,
}

impl InMemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&self, token: &str) -> DripResult<()> {
        let mut counts = self
            .counts
            .get_mut(token)
            .ok_or_else(|| DripError::Tracking(format!("unknown token {token}")))?;
        counts.opens += 1;
        Ok(())
    }

    pub fn record_click(&self, token: &str) -> DripResult<()> {
        let mut counts = self
            .counts
            .get_mut(token)
            .ok_or_else(|| DripError::Tracking(format!("unknown token {token}")))?;
        counts.clicks += 1;
        Ok(())
    }
}

impl TrackingService for InMemoryTracking {
    fn get_or_create_token(&self, campaign_id: &str, email: &str) -> DripResult<String> {
        let token = self
            .tokens
            .entry((campaign_id.to_string(), email.to_lowercase()))
            .or_insert_with(|| {
                let token = Uuid::new_v4().simple().to_string();
                debug!(campaign_id = %campaign_id, "Issued tracking token");
                token
            })
            .clone();
        self.counts.entry(token.clone()).or_default();
        Ok(token)
    }

    fn find_token(&self, campaign_id: &str, email: &str) -> Option<String> {
        self.tokens
            .get(&(campaign_id.to_string(), email.to_lowercase()))
            .map(|r| r.value().clone())
    }

    fn engagement(&self, token: &str) -> DripResult<EngagementCounts> {
        Ok(self.counts.get(token).map(|c| *c).unwrap_or_default())
    }

    fn inject_tracking(
        &self,
        html: &str,
        token: &str,
        base_url: &str,
        options: TrackingOptions,
    ) -> String {
        let base = base_url.trim_end_matches('/');
        let mut out = if options.click_tracking {
            rewrite_links(html, token, base)
        } else {
            html.to_string()
        };

        if options.open_tracking {
            let pixel = format!(
                "<img src=\"{base}/t/open/{token}.gif\" width=\"1\" height=\"1\" alt=\"\" />"
            );
            match out.rfind("</body>") {
                Some(idx) => out.insert_str(idx, &pixel),
                None => out.push_str(&pixel),
            }
        }
        out
    }
}

/// Routes every absolute http(s) link through the click redirect.
fn rewrite_links(html: &str, token: &str, base: &str) -> String {
    const HREF: &str = "href=\"";
    let redirect_prefix = format!("{base}/t/");
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find(HREF) {
        let value_start = start + HREF.len();
        out.push_str(&rest[..value_start]);
        let Some(len) = rest[value_start..].find('"') else {
            rest = &rest[value_start..];
            break;
        };
        let target = &rest[value_start..value_start + len];
        let trackable = (target.starts_with("http://") || target.starts_with("https://"))
            && !target.starts_with(&redirect_prefix);
        if trackable {
            let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
            out.push_str(&format!("{base}/t/click/{token}?url={encoded}"));
        } else {
            out.push_str(target);
        }
        rest = &rest[value_start + len..];
    }
    out.push_str(rest);
    out
}
