//! 搜索查询编译
//!
//! 输出 Elasticsearch 风格的 bool 查询。词表字段使用 nested 查询，
//! scheme 与编码条件必须命中同一个标签元素。

use super::{QueryTarget, field_path, list_entries, parse_number, pattern_value};
use crate::error::Result;
use crate::models::FilterCondition;
use crate::operators::Operator;
use crate::resolver::{FieldKind, ValueType};
use filter_shared::config::FieldLayoutConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// 编译后的搜索查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchQuery(Value);

impl SearchQuery {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    pub fn is_match_all(&self) -> bool {
        self.0.get("match_all").is_some()
    }
}

impl From<Value> for SearchQuery {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// 搜索目标
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchTarget;

/// 转义 wildcard 查询中的元字符
fn escape_wildcard(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl SearchTarget {
    fn should(clauses: Vec<Value>) -> Value {
        json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
    }

    fn wildcard(path: &str, pattern: String) -> Value {
        json!({ "wildcard": { path: { "value": pattern, "case_insensitive": true } } })
    }

    fn term(path: &str, value: Value, case_insensitive: bool) -> Value {
        if case_insensitive {
            json!({ "term": { path: { "value": value, "case_insensitive": true } } })
        } else {
            json!({ "term": { path: { "value": value } } })
        }
    }

    fn exists(path: &str) -> Value {
        json!({ "exists": { "field": path } })
    }

    /// IN 查询：数值字段用 terms，文本字段为不区分大小写 term 的析取
    fn any_in(condition: &FilterCondition, path: &str, value_type: ValueType) -> Result<Value> {
        let entries = list_entries(condition, value_type, Self::NAME)?;
        let query = match value_type {
            ValueType::Number => {
                let numbers: Vec<Value> = entries.iter().filter_map(|e| parse_number(e)).collect();
                json!({ "terms": { path: numbers } })
            }
            ValueType::Text => Self::should(
                entries
                    .iter()
                    .map(|e| Self::term(path, json!(e), true))
                    .collect(),
            ),
        };
        Ok(query)
    }

    /// 作用于单个字段的查询（NIN 另行组合）
    fn on_field(condition: &FilterCondition, path: &str, value_type: ValueType) -> Result<Value> {
        let query = match condition.operator {
            Operator::Like => {
                Self::wildcard(path, format!("*{}*", escape_wildcard(pattern_value(condition)?)))
            }
            Operator::StartsWith => json!({
                "prefix": { path: { "value": pattern_value(condition)?, "case_insensitive": true } }
            }),
            Operator::EndsWith => {
                Self::wildcard(path, format!("*{}", escape_wildcard(pattern_value(condition)?)))
            }
            Operator::Eq => {
                let exact = Self::term(path, json!(condition.value), false);
                match parse_number(&condition.value) {
                    Some(number) => Self::should(vec![exact, Self::term(path, number, false)]),
                    None => exact,
                }
            }
            Operator::In | Operator::Nin => Self::any_in(condition, path, value_type)?,
        };
        Ok(query)
    }

    fn plain(condition: &FilterCondition, path: &str, value_type: ValueType) -> Result<Value> {
        if condition.operator == Operator::Nin {
            let excluded = Self::any_in(condition, path, value_type)?;
            return Ok(json!({
                "bool": { "must": [Self::exists(path)], "must_not": [excluded] }
            }));
        }
        Self::on_field(condition, path, value_type)
    }

    fn vocabulary(
        condition: &FilterCondition,
        scheme: &str,
        layout: &FieldLayoutConfig,
    ) -> Result<Value> {
        let scheme_path = layout.tag_scheme_path();
        let code_path = layout.tag_code_path();
        let nested = |code_query: Value| {
            json!({
                "nested": {
                    "path": layout.tag_array_field,
                    "query": {
                        "bool": {
                            "must": [Self::term(&scheme_path, json!(scheme), false), code_query]
                        }
                    }
                }
            })
        };

        if condition.operator == Operator::Nin {
            let excluded = Self::any_in(condition, &code_path, ValueType::Text)?;
            return Ok(json!({
                "bool": {
                    "must": [nested(Self::exists(&code_path))],
                    "must_not": [nested(excluded)]
                }
            }));
        }

        Ok(nested(Self::on_field(condition, &code_path, ValueType::Text)?))
    }
}

impl QueryTarget for SearchTarget {
    type Output = SearchQuery;

    const NAME: &'static str = "search";

    fn match_all(&self) -> Value {
        json!({ "match_all": {} })
    }

    fn all_of(&self, mut clauses: Vec<Value>) -> Value {
        if clauses.len() == 1 {
            return clauses.remove(0);
        }
        json!({ "bool": { "must": clauses } })
    }

    fn any_of(&self, mut clauses: Vec<Value>) -> Value {
        if clauses.len() == 1 {
            return clauses.remove(0);
        }
        Self::should(clauses)
    }

    fn condition(
        &self,
        condition: &FilterCondition,
        kind: &FieldKind,
        layout: &FieldLayoutConfig,
    ) -> Result<Value> {
        match kind {
            FieldKind::Vocabulary { scheme } => Self::vocabulary(condition, scheme, layout),
            _ => {
                let (path, value_type) =
                    field_path(kind, layout).unwrap_or_else(|| (condition.field.clone(), ValueType::Text));
                Self::plain(condition, &path, value_type)
            }
        }
    }
}
