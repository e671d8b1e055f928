//! Elasticsearch HTTP 客户端
//!
//! 查询使用 search_after 游标翻页，更新使用 `_bulk` 的 update 操作

use std::collections::HashMap;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{BulkResponse, FlowStore, Hit, ItemFailure, PageRequest, UpdateOp};
use crate::common::{format_timestamp, truncate_for_log};
use crate::error::{AnalyzerError, Result};

/// 错误响应体在日志中的最大长度
const MAX_ERROR_BODY: usize = 512;

pub struct EsClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_source", default)]
    source: Value,
    #[serde(default)]
    sort: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl EsClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// 构建增量查询请求体
    pub(crate) fn search_body(req: &PageRequest<'_>) -> Value {
        let mut body = json!({
            "query": {
                "range": {
                    req.field: { "gt": format_timestamp(&req.after) }
                }
            },
            "sort": [
                { req.field: "asc" },
                "_doc"
            ],
            "size": req.size
        });
        if let Some(cursor) = req.cursor {
            body["search_after"] = Value::Array(cursor.to_vec());
        }
        body
    }

    /// 构建 `_bulk` 请求体（NDJSON，每个操作两行）
    pub(crate) fn bulk_body(ops: &[UpdateOp]) -> String {
        let mut body = String::with_capacity(ops.len() * 256);
        for op in ops {
            let action = json!({ "update": { "_index": op.partition, "_id": op.id } });
            let doc = json!({ "doc": op.doc });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        body
    }

    /// 将非 2xx 响应映射为错误：服务端错误/限流可重试，其余视为数据错误
    async fn status_error(op: &str, resp: reqwest::Response) -> AnalyzerError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = format!("{} 失败: HTTP {} {}", op, status, truncate_for_log(&body, MAX_ERROR_BODY));
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            AnalyzerError::Connectivity(message)
        } else {
            AnalyzerError::Data(message)
        }
    }
}

impl FlowStore for EsClient {
    async fn ping(&self) -> Result<()> {
        let resp = self.request(Method::GET, "/").send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error("连接检查", resp).await)
        }
    }

    async fn search_page(&self, req: PageRequest<'_>) -> Result<Vec<Hit>> {
        let path = format!("/{}/_search?ignore_unavailable=true", req.partition);
        let resp = self
            .request(Method::POST, &path)
            .json(&Self::search_body(&req))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            // 当天分区尚未创建
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::status_error("查询", resp).await);
        }

        let parsed: SearchResponse = resp.json().await?;
        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|h| Hit {
                id: h.id,
                partition: h.index,
                source: h.source,
                sort: h.sort,
            })
            .collect())
    }

    async fn bulk_update(&self, ops: &[UpdateOp]) -> Result<BulkResponse> {
        if ops.is_empty() {
            return Ok(BulkResponse::default());
        }

        let resp = self
            .request(Method::POST, "/_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(Self::bulk_body(ops))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::status_error("批量更新", resp).await);
        }

        let parsed: RawBulkResponse = resp.json().await?;
        Ok(summarize_bulk(parsed, ops.len()))
    }
}

fn summarize_bulk(parsed: RawBulkResponse, submitted: usize) -> BulkResponse {
    if !parsed.errors {
        return BulkResponse {
            updated: submitted,
            failures: Vec::new(),
        };
    }

    let mut out = BulkResponse::default();
    for item in parsed.items.into_iter().flat_map(|m| m.into_values()) {
        match item.error {
            Some(err) if item.status >= 300 || item.status == 0 => out.failures.push(ItemFailure {
                id: item.id,
                reason: err
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            }),
            _ => out.updated += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    #[test]
    fn test_search_body_without_cursor() {
        let after = chrono::Utc.with_ymd_and_hms(2024, 11, 17, 10, 0, 0).unwrap();
        let req = PageRequest {
            partition: "sflow-2024.11.17",
            field: "@timestamp",
            after,
            cursor: None,
            size: 10_000,
        };
        let body = EsClient::search_body(&req);

        assert_eq!(body["query"]["range"]["@timestamp"]["gt"], "2024-11-17T10:00:00.000Z");
        assert_eq!(body["sort"][0]["@timestamp"], "asc");
        assert_eq!(body["sort"][1], "_doc");
        assert_eq!(body["size"], 10_000);
        assert!(body.get("search_after").is_none());
    }

    #[test]
    fn test_search_body_with_cursor() {
        let cursor = vec![json!(1731837600000i64), json!(42)];
        let req = PageRequest {
            partition: "sflow-2024.11.17",
            field: "@timestamp",
            after: chrono::Utc::now(),
            cursor: Some(&cursor),
            size: 2,
        };
        let body = EsClient::search_body(&req);
        assert_eq!(body["search_after"], json!([1731837600000i64, 42]));
    }

    #[test]
    fn test_bulk_body_is_ndjson_update_pairs() {
        let mut doc = Map::new();
        doc.insert("node".into(), json!("武汉"));
        let ops = vec![
            UpdateOp { partition: "sflow-2024.11.17".into(), id: "a".into(), doc: doc.clone() },
            UpdateOp { partition: "sflow-2024.11.17".into(), id: "b".into(), doc },
        ];

        let body = EsClient::bulk_body(&ops);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["update"]["_id"], "a");
        assert_eq!(action["update"]["_index"], "sflow-2024.11.17");
        let partial: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(partial["doc"]["node"], "武汉");
    }

    #[test]
    fn test_summarize_bulk_counts_item_failures() {
        let raw: RawBulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"update": {"_id": "a", "status": 200}},
                {"update": {"_id": "b", "status": 404, "error": {"type": "document_missing_exception", "reason": "document missing"}}},
                {"update": {"_id": "c", "status": 200}}
            ]
        }))
        .unwrap();

        let out = summarize_bulk(raw, 3);
        assert_eq!(out.updated, 2);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].id, "b");
        assert_eq!(out.failures[0].reason, "document missing");
    }

    #[test]
    fn test_summarize_bulk_without_errors() {
        let raw: RawBulkResponse = serde_json::from_value(json!({"errors": false, "items": []})).unwrap();
        assert_eq!(summarize_bulk(raw, 5).updated, 5);
    }
}
