//! 推送消息格式：`{"type": "INVALIDATE" | "UPDATE_ALL", "entity": "...", "id": "..."}`
//!
//! 消息只用于让界面缓存失效，不落盘。

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationMessage {
    /// 单条记录（带 id）或整个实体（不带 id）变更
    Invalidate {
        entity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// 实体整体刷新
    UpdateAll { entity: String },
}

impl InvalidationMessage {
    pub fn entity(&self) -> &str {
        match self {
            InvalidationMessage::Invalidate { entity, .. } | InvalidationMessage::UpdateAll { entity } => entity,
        }
    }

    /// 对应的缓存失效 key 与是否精确匹配
    pub fn cache_key(&self) -> (Vec<String>, bool) {
        match self {
            InvalidationMessage::Invalidate { entity, id: Some(id) } => (vec![entity.clone(), id.clone()], true),
            InvalidationMessage::Invalidate { entity, id: None } | InvalidationMessage::UpdateAll { entity } => {
                (vec![entity.clone()], false)
            }
        }
    }
}

/// 推送消息解析错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageParseError {
    #[error("消息不是合法 JSON: {0}")]
    Malformed(String),

    #[error("未知消息类型: {0}")]
    UnknownType(String),

    #[error("消息缺少字段: {0}")]
    MissingField(&'static str),
}

/// 解析单条推送消息；数字 id 会被转成字符串
pub fn parse_message(raw: &str) -> Result<InvalidationMessage, MessageParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| MessageParseError::Malformed(e.to_string()))?;
    parse_value(value)
}

pub(crate) fn parse_value(mut value: Value) -> Result<InvalidationMessage, MessageParseError> {
    let Some(obj) = value.as_object_mut() else {
        return Err(MessageParseError::Malformed("不是 JSON 对象".to_string()));
    };
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MessageParseError::MissingField("type"))?
        .to_string();
    if kind != "INVALIDATE" && kind != "UPDATE_ALL" {
        return Err(MessageParseError::UnknownType(kind));
    }
    match obj.get("entity") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => return Err(MessageParseError::MissingField("entity")),
    }
    if let Some(Value::Number(n)) = obj.get("id") {
        let id = n.to_string();
        obj.insert("id".to_string(), Value::String(id));
    }
    if obj.get("id").is_some_and(Value::is_null) {
        obj.remove("id");
    }
    serde_json::from_value(value).map_err(|e| MessageParseError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invalidate_with_id() {
        let msg = parse_message(r#"{"type":"INVALIDATE","entity":"workers","id":"w1"}"#).unwrap();
        assert_eq!(
            msg,
            InvalidationMessage::Invalidate {
                entity: "workers".into(),
                id: Some("w1".into())
            }
        );
        assert_eq!(msg.cache_key(), (vec!["workers".to_string(), "w1".to_string()], true));
    }

    #[test]
    fn test_parse_numeric_id_and_update_all() {
        let msg = parse_message(r#"{"type":"INVALIDATE","entity":"wells","id":42}"#).unwrap();
        assert_eq!(msg.cache_key().0, vec!["wells".to_string(), "42".to_string()]);

        let msg = parse_message(r#"{"type":"UPDATE_ALL","entity":"materials"}"#).unwrap();
        assert_eq!(msg.entity(), "materials");
        assert_eq!(msg.cache_key(), (vec!["materials".to_string()], false));

        let msg = parse_message(r#"{"type":"INVALIDATE","entity":"projects","id":null}"#).unwrap();
        assert_eq!(msg.cache_key(), (vec!["projects".to_string()], false));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_message("not json"), Err(MessageParseError::Malformed(_))));
        assert!(matches!(
            parse_message(r#"{"type":"PING"}"#),
            Err(MessageParseError::UnknownType(t)) if t == "PING"
        ));
        assert!(matches!(
            parse_message(r#"{"type":"INVALIDATE"}"#),
            Err(MessageParseError::MissingField("entity"))
        ));
        assert!(matches!(parse_message("[]"), Err(MessageParseError::Malformed(_))));
    }
}
