//! 内存文档库
//!
//! 解释 MongoDB 风格查询文档的子集：`$and` `$or` `$nor` `$elemMatch`
//! `$regex`/`$options` `$in` `$nin` `$type` `$eq` `$exists` 以及字段直接相等。

use super::{ContentRepository, ItemCollection, QueryResult, is_scalar, raw_values, scalar_eq};
use crate::compiler::StorePredicate;
use crate::error::{FilterError, Result};
use crate::models::{ContentItem, collect_values};
use crate::operators::case_insensitive;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// 内存文档库
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    items: ItemCollection,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 与其他内存后端共享同一份条目
    pub fn with_collection(items: ItemCollection) -> Self {
        Self { items }
    }

    pub fn insert(&self, item: ContentItem) -> String {
        self.items.insert(item)
    }

    pub fn collection(&self) -> &ItemCollection {
        &self.items
    }

    /// 判断单个文档是否满足查询文档
    pub fn matches(doc: &Value, query: &Value) -> Result<bool> {
        let Value::Object(clauses) = query else {
            return Err(unsupported(format!("查询必须是对象: {}", query)));
        };

        for (key, operand) in clauses {
            let matched = match key.as_str() {
                "$and" => all(doc, operand)?,
                "$or" => {
                    let mut any = false;
                    for sub in array(operand, "$or")? {
                        if Self::matches(doc, sub)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                "$nor" => {
                    let mut none = true;
                    for sub in array(operand, "$nor")? {
                        if Self::matches(doc, sub)? {
                            none = false;
                            break;
                        }
                    }
                    none
                }
                op if op.starts_with('$') => {
                    return Err(unsupported(format!("顶层操作符 {}", op)));
                }
                path => field_matches(doc, path, operand)?,
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn unsupported(message: String) -> FilterError {
    FilterError::UnsupportedQuery(message)
}

fn array<'v>(operand: &'v Value, op: &str) -> Result<&'v Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| unsupported(format!("{} 需要数组", op)))
}

fn all(doc: &Value, operand: &Value) -> Result<bool> {
    for sub in array(operand, "$and")? {
        if !MemoryContentStore::matches(doc, sub)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_doc(operand: &Value) -> Option<&Map<String, Value>> {
    operand
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn field_matches(doc: &Value, path: &str, operand: &Value) -> Result<bool> {
    let Some(operators) = is_operator_doc(operand) else {
        let candidates = collect_values(doc, path);
        return Ok(candidates.iter().any(|c| scalar_eq(c, operand)));
    };

    for (op, arg) in operators {
        let matched = match op.as_str() {
            "$options" => continue,
            "$regex" => {
                let regex = build_regex(arg, operators.get("$options"))?;
                any_string(&collect_values(doc, path), &regex)
            }
            "$eq" => collect_values(doc, path).iter().any(|c| scalar_eq(c, arg)),
            "$in" => in_list(&collect_values(doc, path), array(arg, "$in")?)?,
            "$nin" => !in_list(&collect_values(doc, path), array(arg, "$nin")?)?,
            "$type" => {
                let types: Vec<&str> = match arg {
                    Value::String(t) => vec![t.as_str()],
                    Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
                    _ => return Err(unsupported("$type 需要字符串或数组".to_string())),
                };
                collect_values(doc, path)
                    .iter()
                    .any(|c| types.iter().any(|t| has_type(c, t)))
            }
            "$exists" => {
                let wanted = arg.as_bool().unwrap_or(true);
                collect_values(doc, path).iter().any(|c| is_scalar(c)) == wanted
            }
            "$elemMatch" => {
                let mut any = false;
                for value in raw_values(doc, path) {
                    let Value::Array(elements) = value else {
                        continue;
                    };
                    for element in elements {
                        if element.is_object() && MemoryContentStore::matches(element, arg)? {
                            any = true;
                            break;
                        }
                    }
                }
                any
            }
            other => return Err(unsupported(format!("字段操作符 {}", other))),
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn build_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| unsupported("$regex 需要字符串".to_string()))?;
    let ignore_case = options
        .and_then(Value::as_str)
        .is_some_and(|o| o.contains('i'));

    let built = if ignore_case {
        case_insensitive(pattern)
    } else {
        Regex::new(pattern)
    };
    built.map_err(|e| unsupported(format!("无效的正则 '{}': {}", pattern, e)))
}

fn any_string(candidates: &[&Value], regex: &Regex) -> bool {
    candidates
        .iter()
        .any(|c| c.as_str().is_some_and(|s| regex.is_match(s)))
}

/// `$in` 列表项可以是标量，也可以是 `{"$regex": .., "$options": ..}`
fn in_list(candidates: &[&Value], entries: &[Value]) -> Result<bool> {
    for entry in entries {
        let matched = match entry.get("$regex") {
            Some(pattern) => any_string(candidates, &build_regex(pattern, entry.get("$options"))?),
            None => candidates.iter().any(|c| scalar_eq(c, entry)),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

fn has_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "bool" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

impl ContentRepository for MemoryContentStore {
    fn execute(&self, predicate: &StorePredicate) -> Result<QueryResult> {
        let query = predicate.as_value();
        let result = self.items.try_filter(|doc| Self::matches(doc, query))?;
        debug!(count = result.count, "文档库查询完成");
        Ok(result)
    }
}
