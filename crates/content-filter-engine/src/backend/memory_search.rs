//! 内存搜索索引
//!
//! 解释 Elasticsearch 风格查询的子集：`match_all` `bool` `term` `terms`
//! `wildcard` `prefix` `exists` `nested`。

use super::{ItemCollection, QueryResult, SearchBackend, is_scalar, raw_values, scalar_eq};
use crate::compiler::SearchQuery;
use crate::error::{FilterError, Result};
use crate::models::{ContentItem, collect_values};
use crate::operators::{case_insensitive, exact_pattern};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// 内存搜索索引
#[derive(Debug, Clone, Default)]
pub struct MemorySearchIndex {
    items: ItemCollection,
}

/// 字段级查询的参数：`{field: {"value": v, "case_insensitive": b}}` 或 `{field: v}`
struct FieldQuery<'q> {
    field: &'q str,
    value: &'q Value,
    case_insensitive: bool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(items: ItemCollection) -> Self {
        Self { items }
    }

    pub fn index(&self, item: ContentItem) -> String {
        self.items.insert(item)
    }

    /// 判断单个文档是否满足查询
    pub fn matches(doc: &Value, query: &Value) -> Result<bool> {
        let (kind, body) = single_entry(query)?;

        match kind {
            "match_all" => Ok(true),
            "bool" => bool_query(doc, body),
            "term" => {
                let q = field_query(body)?;
                let candidates = collect_values(doc, q.field);
                match q.value {
                    Value::String(expected) if q.case_insensitive => {
                        let regex = matcher(&exact_pattern(expected), true)?;
                        Ok(any_text(&candidates, &regex))
                    }
                    expected => Ok(candidates.iter().any(|c| scalar_eq(c, expected))),
                }
            }
            "terms" => {
                let (field, values) = single_entry(body)?;
                let values = values
                    .as_array()
                    .ok_or_else(|| unsupported("terms 需要数组"))?;
                Ok(collect_values(doc, field)
                    .iter()
                    .any(|c| values.iter().any(|v| scalar_eq(c, v))))
            }
            "wildcard" => {
                let q = field_query(body)?;
                let pattern = q
                    .value
                    .as_str()
                    .ok_or_else(|| unsupported("wildcard 需要字符串"))?;
                let regex = matcher(&wildcard_to_regex(pattern), q.case_insensitive)?;
                Ok(any_text(&collect_values(doc, q.field), &regex))
            }
            "prefix" => {
                let q = field_query(body)?;
                let prefix = q
                    .value
                    .as_str()
                    .ok_or_else(|| unsupported("prefix 需要字符串"))?;
                let regex = matcher(&format!("^{}", regex::escape(prefix)), q.case_insensitive)?;
                Ok(any_text(&collect_values(doc, q.field), &regex))
            }
            "exists" => {
                let field = body
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| unsupported("exists 需要 field"))?;
                Ok(collect_values(doc, field).iter().any(|c| is_scalar(c)))
            }
            "nested" => nested_query(doc, body),
            other => Err(unsupported(&format!("查询类型 {}", other))),
        }
    }
}

fn unsupported(message: &str) -> FilterError {
    FilterError::UnsupportedQuery(message.to_string())
}

fn single_entry(query: &Value) -> Result<(&str, &Value)> {
    match query.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| unsupported("空查询")),
        _ => Err(unsupported(&format!("查询必须是单键对象: {}", query))),
    }
}

fn field_query(body: &Value) -> Result<FieldQuery<'_>> {
    let (field, params) = single_entry(body)?;
    match params {
        Value::Object(options) => Ok(FieldQuery {
            field,
            value: options
                .get("value")
                .ok_or_else(|| unsupported("缺少 value"))?,
            case_insensitive: options
                .get("case_insensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        value => Ok(FieldQuery {
            field,
            value,
            case_insensitive: false,
        }),
    }
}

/// 文本类查询的匹配器；忽略大小写时与评估器共用同一套折叠规则
fn matcher(pattern: &str, ignore_case: bool) -> Result<Regex> {
    let built = if ignore_case {
        case_insensitive(pattern)
    } else {
        Regex::new(pattern)
    };
    built.map_err(|e| FilterError::UnsupportedQuery(e.to_string()))
}

fn any_text(candidates: &[&Value], regex: &Regex) -> bool {
    candidates
        .iter()
        .any(|c| c.as_str().is_some_and(|s| regex.is_match(s)))
}

fn clauses<'q>(body: &'q Map<String, Value>, key: &str) -> Vec<&'q Value> {
    match body.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => Vec::new(),
    }
}

fn bool_query(doc: &Value, body: &Value) -> Result<bool> {
    let body = body
        .as_object()
        .ok_or_else(|| unsupported("bool 需要对象"))?;

    for clause in clauses(body, "must").into_iter().chain(clauses(body, "filter")) {
        if !MemorySearchIndex::matches(doc, clause)? {
            return Ok(false);
        }
    }

    for clause in clauses(body, "must_not") {
        if MemorySearchIndex::matches(doc, clause)? {
            return Ok(false);
        }
    }

    let should = clauses(body, "should");
    if should.is_empty() {
        return Ok(true);
    }

    // 没有 must/filter 时 should 至少命中一个
    let has_required = body.contains_key("must") || body.contains_key("filter");
    let minimum = body
        .get("minimum_should_match")
        .and_then(Value::as_u64)
        .unwrap_or(if has_required { 0 } else { 1 });

    let mut hits = 0u64;
    for clause in should {
        if hits >= minimum {
            break;
        }
        if MemorySearchIndex::matches(doc, clause)? {
            hits += 1;
        }
    }
    Ok(hits >= minimum)
}

/// nested 查询：每个数组元素单独求值，字段路径仍以 path 为前缀
fn nested_query(doc: &Value, body: &Value) -> Result<bool> {
    let path = body
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| unsupported("nested 需要 path"))?;
    let query = body
        .get("query")
        .ok_or_else(|| unsupported("nested 需要 query"))?;

    for value in raw_values(doc, path) {
        let Value::Array(elements) = value else {
            continue;
        };
        for element in elements.iter().filter(|e| e.is_object()) {
            if MemorySearchIndex::matches(&rooted(path, element), query)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// 把元素挂回 path 之下，使 `subject.qcode` 这类路径只看到该元素
fn rooted(path: &str, element: &Value) -> Value {
    path.rsplit('.').fold(element.clone(), |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.to_string(), inner);
        Value::Object(map)
    })
}

/// wildcard 模式转为整串匹配的正则：`*` 任意串（含换行），`?` 单字符，`\` 转义
fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push_str("\\z");
    regex
}

impl SearchBackend for MemorySearchIndex {
    fn execute(&self, query: &SearchQuery) -> Result<QueryResult> {
        let query = query.as_value();
        let result = self.items.try_filter(|doc| Self::matches(doc, query))?;
        debug!(count = result.count, "搜索完成");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "_id": "1",
            "headline": "Creator",
            "urgency": 3,
            "subject": [
                {"scheme": "S1", "qcode": "X"},
                {"scheme": "S2", "qcode": "Y"}
            ]
        })
    }

    #[test]
    fn test_wildcard_to_regex() {
        assert_eq!(wildcard_to_regex("*tor"), "(?s)^.*tor\\z");
        assert_eq!(wildcard_to_regex("a\\*b?"), "(?s)^a\\*b.\\z");
    }

    #[test]
    fn test_leaf_queries() {
        let doc = doc();
        let hit = |q: Value| MemorySearchIndex::matches(&doc, &q).unwrap();

        assert!(hit(json!({"wildcard": {"headline": {"value": "*TOR", "case_insensitive": true}}})));
        assert!(!hit(json!({"wildcard": {"headline": {"value": "*TOR"}}})));
        assert!(hit(json!({"prefix": {"headline": {"value": "cre", "case_insensitive": true}}})));
        assert!(hit(json!({"terms": {"urgency": [2, 3]}})));
        assert!(!hit(json!({"term": {"urgency": {"value": "3"}}})));
        assert!(hit(json!({"exists": {"field": "headline"}})));
        assert!(!hit(json!({"exists": {"field": "priority"}})));
    }

    #[test]
    fn test_case_insensitive_text_queries_fold_like_the_evaluator() {
        let doc = json!({"_id": "1", "headline": "ΟΔΟΣ\nİstanbul"});
        let hit = |q: Value| MemorySearchIndex::matches(&doc, &q).unwrap();

        assert!(hit(json!({"wildcard": {"headline": {"value": "*ς*", "case_insensitive": true}}})));
        assert!(hit(json!({"prefix": {"headline": {"value": "οδοσ", "case_insensitive": true}}})));
        assert!(!hit(json!({"wildcard": {"headline": {"value": "*i*", "case_insensitive": true}}})));

        let word = json!({"_id": "2", "code": "σ"});
        let term = json!({"term": {"code": {"value": "ς", "case_insensitive": true}}});
        assert!(MemorySearchIndex::matches(&word, &term).unwrap());

        let trailing = json!({"_id": "3", "code": "σ\n"});
        assert!(!MemorySearchIndex::matches(&trailing, &term).unwrap());
    }

    #[test]
    fn test_bool_query() {
        let doc = doc();
        let query = json!({"bool": {
            "must": [{"exists": {"field": "urgency"}}],
            "must_not": [{"terms": {"urgency": [1]}}]
        }});
        assert!(MemorySearchIndex::matches(&doc, &query).unwrap());

        let query = json!({"bool": {
            "should": [{"term": {"urgency": {"value": 1}}}, {"term": {"urgency": {"value": 2}}}],
            "minimum_should_match": 1
        }});
        assert!(!MemorySearchIndex::matches(&doc, &query).unwrap());
    }

    #[test]
    fn test_nested_scopes_to_one_element() {
        let doc = doc();
        let nested = |scheme: &str, code: &str| {
            json!({"nested": {"path": "subject", "query": {"bool": {"must": [
                {"term": {"subject.scheme": {"value": scheme}}},
                {"term": {"subject.qcode": {"value": code}}}
            ]}}}})
        };

        assert!(!MemorySearchIndex::matches(&doc, &nested("S1", "Y")).unwrap());
        assert!(MemorySearchIndex::matches(&doc, &nested("S2", "Y")).unwrap());
    }

    #[test]
    fn test_unsupported_query() {
        let err = MemorySearchIndex::matches(&doc(), &json!({"range": {"urgency": {"gt": 1}}}))
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_QUERY");
    }

    #[test]
    fn test_search() {
        let index = MemorySearchIndex::new();
        index.index(ContentItem::new(doc()));
        index.index(ContentItem::new(json!({"_id": "2", "urgency": 1})));

        let result = index
            .execute(&SearchQuery::from(json!({"match_all": {}})))
            .unwrap();
        assert_eq!(result.count, 2);
    }
}
