//! Ordered, conditional request/response filter chain (C3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, ResponseModification};
use crate::Result;

/// What a filter does when applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FilterAction {
    AddHeader { name: String, value: String },
    ModifyHeader { name: String, value: String },
    RemoveHeader { name: String },
    ValidateHeader { name: String, required: bool },
    SetStatus { status: u16 },
    RewriteBody { transform: Transform },
}

/// Body/response transforms available to `RewriteBody` and post-filter
/// response modification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    JsonPretty,
    JsonMinify,
    XmlFormat,
    CaseFold,
    CustomReplace { from: String, to: String },
}

impl Transform {
    pub fn apply(&self, body: &[u8]) -> Vec<u8> {
        match self {
            Transform::JsonPretty => serde_json::from_slice::<Value>(body)
                .and_then(|v| serde_json::to_vec_pretty(&v))
                .unwrap_or_else(|_| body.to_vec()),
            Transform::JsonMinify => serde_json::from_slice::<Value>(body)
                .and_then(|v| serde_json::to_vec(&v))
                .unwrap_or_else(|_| body.to_vec()),
            Transform::XmlFormat => body.to_vec(), // placeholder, per §4.3's transform set
            Transform::CaseFold => String::from_utf8_lossy(body).to_lowercase().into_bytes(),
            Transform::CustomReplace { from, to } => {
                let s = String::from_utf8_lossy(body);
                s.replace(from.as_str(), to.as_str()).into_bytes()
            }
        }
    }
}

/// Matches a subset of the request: used to gate whether a filter applies.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Condition {
    pub methods: Option<Vec<String>>,
    pub path_contains: Option<String>,
    pub header_equals: Option<(String, String)>,
    pub query_equals: Option<(String, String)>,
}

impl Condition {
    pub fn matches(&self, ctx: &Context) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(ctx.method.as_str())) {
                return false;
            }
        }
        if let Some(substr) = &self.path_contains {
            if !ctx.path.contains(substr.as_str()) {
                return false;
            }
        }
        if let Some((name, value)) = &self.header_equals {
            match ctx.headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                Some(v) if v == value => {}
                _ => return false,
            }
        }
        if let Some((key, value)) = &self.query_equals {
            let found = ctx
                .query
                .split('&')
                .filter_map(|kv| kv.split_once('='))
                .any(|(k, v)| k == key && v == value);
            if !found {
                return false;
            }
        }
        true
    }
}

/// What happens when a filter's own logic fails (distinct from its
/// condition simply not matching, which silently skips it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Abort,
    WarnContinue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub kind: FilterKind,
    pub order: i32,
    pub enabled: bool,
    pub action: FilterAction,
    pub condition: Option<Condition>,
    pub on_error: OnError,
    /// Groups this filter under a named chain a route can select via
    /// its own `filter_chain_id`. `None` marks a filter as ungrouped,
    /// applied to routes that don't reference any chain.
    #[serde(default)]
    pub chain_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    pub pre: Vec<Filter>,
    pub post: Vec<Filter>,
}

impl FilterChain {
    pub fn new(mut filters: Vec<Filter>) -> Self {
        filters.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        let (pre, post) = filters.into_iter().partition(|f| f.kind == FilterKind::Request);
        FilterChain { pre, post }
    }

    /// Builds a chain from the filters belonging to `chain_id` (or, when
    /// `chain_id` is `None`, the ungrouped filters with no `chain_id` of
    /// their own), so a route's `filter_chain_id` selects a distinct
    /// ordered subset instead of the whole configured filter set.
    pub fn for_chain(filters: &[Filter], chain_id: Option<&str>) -> Self {
        let selected = filters
            .iter()
            .filter(|f| f.chain_id.as_deref() == chain_id)
            .cloned()
            .collect();
        Self::new(selected)
    }

    /// Applies pre-filters; returns `Err` on the first `Abort`-error filter,
    /// `Ok(())` otherwise (including after `warn-continue` failures).
    pub fn apply_pre(&self, ctx: &mut Context) -> Result<()> {
        for f in &self.pre {
            if !f.enabled {
                continue;
            }
            if let Some(cond) = &f.condition {
                if !cond.matches(ctx) {
                    continue;
                }
            }
            if let Err(e) = apply_request_action(ctx, f) {
                match f.on_error {
                    OnError::Abort => return Err(e),
                    OnError::WarnContinue => {
                        tracing::warn!(filter_id = %f.id, error = %e, "filter failed, continuing");
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies post-filters' recorded response modifications in order.
    pub fn apply_post(&self, ctx: &mut Context) {
        for f in &self.post {
            if !f.enabled {
                continue;
            }
            if let Some(cond) = &f.condition {
                if !cond.matches(ctx) {
                    continue;
                }
            }
            record_response_modification(ctx, f);
        }
    }
}

fn apply_request_action(ctx: &mut Context, f: &Filter) -> Result<()> {
    match &f.action {
        FilterAction::AddHeader { name, value } => {
            let name = http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| crate::Error::client_malformed(e.to_string()))?;
            let value = http::HeaderValue::from_str(value).map_err(|e| crate::Error::client_malformed(e.to_string()))?;
            ctx.headers.insert(name, value);
            Ok(())
        }
        FilterAction::ModifyHeader { name, value } => {
            let name = http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| crate::Error::client_malformed(e.to_string()))?;
            let value = http::HeaderValue::from_str(value).map_err(|e| crate::Error::client_malformed(e.to_string()))?;
            ctx.headers.insert(name, value);
            Ok(())
        }
        FilterAction::RemoveHeader { name } => {
            ctx.headers.remove(name.as_str());
            Ok(())
        }
        FilterAction::ValidateHeader { name, required } => {
            if *required && !ctx.headers.contains_key(name.as_str()) {
                return Err(crate::Error::client_malformed(format!("missing required header {name}")));
            }
            Ok(())
        }
        FilterAction::SetStatus { .. } | FilterAction::RewriteBody { .. } => {
            // These are response-side actions; a request-kind filter using them is a config error.
            Err(crate::Error::config_invalid("response-only action on request filter"))
        }
    }
}

fn record_response_modification(ctx: &mut Context, f: &Filter) {
    let mut modification = ResponseModification {
        set_status: None,
        add_headers: Vec::new(),
        remove_headers: Vec::new(),
        body_transform: None,
    };
    match &f.action {
        FilterAction::AddHeader { name, value } | FilterAction::ModifyHeader { name, value } => {
            modification.add_headers.push((name.clone(), value.clone()));
        }
        FilterAction::RemoveHeader { name } => modification.remove_headers.push(name.clone()),
        FilterAction::SetStatus { status } => {
            modification.set_status = http::StatusCode::from_u16(*status).ok();
        }
        FilterAction::RewriteBody { transform } => modification.body_transform = Some(transform.clone()),
        FilterAction::ValidateHeader { .. } => {}
    }
    ctx.response_modifications.push(modification);
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};

    fn ctx() -> Context {
        Context::new(
            "127.0.0.1:1".parse().unwrap(),
            Method::GET,
            "a.io".into(),
            "/x".into(),
            String::new(),
            HeaderMap::new(),
        )
    }

    fn filter(id: &str, order: i32, action: FilterAction, kind: FilterKind) -> Filter {
        Filter {
            id: id.into(),
            kind,
            order,
            enabled: true,
            action,
            condition: None,
            on_error: OnError::Abort,
            chain_id: None,
        }
    }

    #[test]
    fn for_chain_selects_only_matching_chain_id() {
        let filters = vec![
            filter("a", 1, FilterAction::AddHeader { name: "x-a".into(), value: "1".into() }, FilterKind::Request),
            {
                let mut f = filter("b", 2, FilterAction::AddHeader { name: "x-b".into(), value: "1".into() }, FilterKind::Request);
                f.chain_id = Some("premium".into());
                f
            },
        ];
        let ungrouped = FilterChain::for_chain(&filters, None);
        assert_eq!(ungrouped.pre.len(), 1);
        assert_eq!(ungrouped.pre[0].id, "a");

        let premium = FilterChain::for_chain(&filters, Some("premium"));
        assert_eq!(premium.pre.len(), 1);
        assert_eq!(premium.pre[0].id, "b");
    }

    #[test]
    fn filters_apply_in_order_ascending() {
        let chain = FilterChain::new(vec![
            filter(
                "second",
                2,
                FilterAction::AddHeader { name: "x-second".into(), value: "2".into() },
                FilterKind::Request,
            ),
            filter(
                "first",
                1,
                FilterAction::AddHeader { name: "x-first".into(), value: "1".into() },
                FilterKind::Request,
            ),
        ]);
        let mut c = ctx();
        chain.apply_pre(&mut c).unwrap();
        assert_eq!(c.headers.get("x-first").unwrap(), "1");
        assert_eq!(c.headers.get("x-second").unwrap(), "2");
    }

    #[test]
    fn disabled_filter_skipped() {
        let mut f = filter(
            "f1",
            1,
            FilterAction::AddHeader { name: "x-skip".into(), value: "1".into() },
            FilterKind::Request,
        );
        f.enabled = false;
        let chain = FilterChain::new(vec![f]);
        let mut c = ctx();
        chain.apply_pre(&mut c).unwrap();
        assert!(!c.headers.contains_key("x-skip"));
    }

    #[test]
    fn condition_mismatch_skips_silently() {
        let mut f = filter(
            "f1",
            1,
            FilterAction::AddHeader { name: "x-post-only".into(), value: "1".into() },
            FilterKind::Request,
        );
        f.condition = Some(Condition { methods: Some(vec!["POST".into()]), ..Default::default() });
        let chain = FilterChain::new(vec![f]);
        let mut c = ctx(); // GET
        chain.apply_pre(&mut c).unwrap();
        assert!(!c.headers.contains_key("x-post-only"));
    }

    #[test]
    fn abort_on_error_propagates() {
        let f = filter("f1", 1, FilterAction::ValidateHeader { name: "x-required".into(), required: true }, FilterKind::Request);
        let chain = FilterChain::new(vec![f]);
        let mut c = ctx();
        assert!(chain.apply_pre(&mut c).is_err());
    }

    #[test]
    fn warn_continue_swallows_error() {
        let mut f = filter("f1", 1, FilterAction::ValidateHeader { name: "x-required".into(), required: true }, FilterKind::Request);
        f.on_error = OnError::WarnContinue;
        let chain = FilterChain::new(vec![f]);
        let mut c = ctx();
        assert!(chain.apply_pre(&mut c).is_ok());
    }

    #[test]
    fn idempotent_application() {
        let chain = FilterChain::new(vec![filter(
            "f1",
            1,
            FilterAction::AddHeader { name: "x-tag".into(), value: "v".into() },
            FilterKind::Request,
        )]);
        let mut c1 = ctx();
        let mut c2 = ctx();
        chain.apply_pre(&mut c1).unwrap();
        chain.apply_pre(&mut c2).unwrap();
        assert_eq!(c1.headers.get("x-tag"), c2.headers.get("x-tag"));
    }
}
