//! 公共工具模块

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// 截断过长的字符串用于日志输出（按字符边界截断，附加省略号）
pub fn truncate_for_log(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut end = max_bytes.saturating_sub(3);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &s[..end])
}

/// 按点分路径读取嵌套字段
///
/// 先尝试整段作为键（`"host.ip"` 可能以扁平形式存储），再逐级下钻
pub fn lookup_path<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = source.get(path) {
        return Some(v);
    }
    path.split('.')
        .try_fold(source, |node, segment| node.get(segment))
}

/// 将 JSON 标量转为用于拼接查找键的字符串
///
/// 接口号在上游可能是数字也可能是字符串，两者需要得到同一个键
pub fn scalar_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 读取字符串字段，空串视为缺失
pub fn lookup_str<'a>(source: &'a Value, path: &str) -> Option<&'a str> {
    lookup_path(source, path)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// 解析记录/检查点中的时间戳
///
/// 接受 RFC3339；不带时区的 `T` 或空格分隔格式视为 UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// 解析记录中的时间戳字段：字符串按 [`parse_timestamp`]，数字按毫秒时间戳
pub fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// 以毫秒精度格式化时间戳（与存储的日期精度一致）
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
