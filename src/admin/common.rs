//! Envelope, pagination, and message-code conventions shared by every
//! `hub00XX` resource family (§6).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Conventional response envelope. `bizData` carries a single resource,
/// `pageQueryData` a paginated list — handlers populate exactly one.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub state: &'static str,
    #[serde(rename = "oK")]
    pub ok: bool,
    #[serde(rename = "bizData", skip_serializing_if = "Option::is_none")]
    pub biz_data: Option<Value>,
    #[serde(rename = "pageQueryData", skip_serializing_if = "Option::is_none")]
    pub page_query_data: Option<PageQueryData>,
    #[serde(rename = "errMsg", skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
    #[serde(rename = "popMsg", skip_serializing_if = "Option::is_none")]
    pub pop_msg: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageQueryData {
    pub total: usize,
    #[serde(rename = "pageIndex")]
    pub page_index: usize,
    #[serde(rename = "pageSize")]
    pub page_size: usize,
    #[serde(rename = "mainKey")]
    pub main_key: &'static str,
}

impl Envelope {
    pub fn ok_one(data: Value, message_id: impl Into<String>) -> Self {
        Envelope {
            state: "SUCCESS",
            ok: true,
            biz_data: Some(data),
            page_query_data: None,
            err_msg: None,
            pop_msg: None,
            message_id: message_id.into(),
        }
    }

    pub fn ok_page(data: Value, page: PageQueryData, message_id: impl Into<String>) -> Self {
        Envelope {
            state: "SUCCESS",
            ok: true,
            biz_data: Some(data),
            page_query_data: Some(page),
            err_msg: None,
            pop_msg: None,
            message_id: message_id.into(),
        }
    }

    pub fn ok_empty(message_id: impl Into<String>) -> Self {
        Envelope {
            state: "SUCCESS",
            ok: true,
            biz_data: None,
            page_query_data: None,
            err_msg: None,
            pop_msg: None,
            message_id: message_id.into(),
        }
    }

    pub fn err(e: &Error) -> (StatusCode, Json<Envelope>) {
        let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = Envelope {
            state: "ERROR",
            ok: false,
            biz_data: None,
            page_query_data: None,
            err_msg: Some(e.to_string()),
            pop_msg: Some(e.to_string()),
            message_id: e.message_code().to_string(),
        };
        (status, Json(envelope))
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

pub type AdminResult<T> = Result<T, (StatusCode, Json<Envelope>)>;

pub fn to_admin_err(e: Error) -> (StatusCode, Json<Envelope>) {
    Envelope::err(&e)
}

/// `pageIndex`/`pageSize` query parameters, clamped per §6.
#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page_index")]
    pub page_index: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_index() -> usize {
    1
}

fn default_page_size() -> usize {
    30
}

impl PageParams {
    pub fn clamped(&self) -> (usize, usize) {
        let index = self.page_index.max(1);
        let size = self.page_size.clamp(1, 100);
        (index, size)
    }

    pub fn slice<'a, T>(&self, items: &'a [T]) -> (&'a [T], PageQueryData) {
        let (index, size) = self.clamped();
        let total = items.len();
        let start = (index - 1).saturating_mul(size).min(total);
        let end = (start + size).min(total);
        (
            &items[start..end],
            PageQueryData { total, page_index: index, page_size: size, main_key: "id" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_params_clamp_out_of_range_size() {
        let params = PageParams { page_index: 0, page_size: 500 };
        let (index, size) = params.clamped();
        assert_eq!(index, 1);
        assert_eq!(size, 100);
    }

    #[test]
    fn slice_returns_requested_window() {
        let items: Vec<i32> = (0..10).collect();
        let params = PageParams { page_index: 2, page_size: 3 };
        let (window, page) = params.slice(&items);
        assert_eq!(window, &[3, 4, 5]);
        assert_eq!(page.total, 10);
    }
}
