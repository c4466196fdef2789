//! 文档库谓词编译
//!
//! 输出 MongoDB 风格的查询文档：表达式析取为 `$or`，合取为 `$and`，
//! 模式匹配为不区分大小写的 `$regex`，词表字段用 `$elemMatch` 把 scheme 与编码限定在同一个标签元素上。

use super::{QueryTarget, field_path, list_entries, parse_number, pattern_value};
use crate::error::Result;
use crate::models::FilterCondition;
use crate::operators::{Operator, exact_pattern};
use crate::resolver::{FieldKind, ValueType};
use filter_shared::config::FieldLayoutConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// 编译后的文档库谓词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePredicate(Value);

impl StorePredicate {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    /// 空文档表示匹配全部
    pub fn is_match_all(&self) -> bool {
        self.0.as_object().is_some_and(Map::is_empty)
    }
}

impl From<Value> for StorePredicate {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// 文档库目标
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTarget;

/// 视为存在的值类型
const PRESENT_TYPES: [&str; 3] = ["string", "number", "bool"];

impl StoreTarget {
    /// 不区分大小写的正则
    fn regex(pattern: String) -> Value {
        json!({ "$regex": pattern, "$options": "i" })
    }

    /// 作用于单个字段的操作符文档（NIN 另行组合）
    fn operand(condition: &FilterCondition, value_type: ValueType) -> Result<Value> {
        let operand = match condition.operator {
            Operator::Like | Operator::StartsWith | Operator::EndsWith => {
                let value = pattern_value(condition)?;
                Self::regex(condition.operator.pattern(value).unwrap_or_default())
            }
            Operator::Eq => match parse_number(&condition.value) {
                Some(number) => json!({ "$in": [condition.value, number] }),
                None => Value::String(condition.value.clone()),
            },
            Operator::In | Operator::Nin => {
                json!({ "$in": Self::list(condition, value_type)? })
            }
        };
        Ok(operand)
    }

    /// IN/NIN 的列表项：数值字段为数字，文本字段为整串匹配的不区分大小写正则
    fn list(condition: &FilterCondition, value_type: ValueType) -> Result<Vec<Value>> {
        let entries = list_entries(condition, value_type, Self::NAME)?;
        let values = match value_type {
            ValueType::Number => entries.iter().filter_map(|e| parse_number(e)).collect(),
            ValueType::Text => entries
                .iter()
                .map(|e| Self::regex(exact_pattern(e)))
                .collect(),
        };
        Ok(values)
    }

    fn field(path: &str, operand: Value) -> Value {
        let mut doc = Map::new();
        doc.insert(path.to_string(), operand);
        Value::Object(doc)
    }

    fn plain(condition: &FilterCondition, path: &str, value_type: ValueType) -> Result<Value> {
        if condition.operator == Operator::Nin {
            let entries = Self::list(condition, value_type)?;
            return Ok(json!({
                "$and": [
                    Self::field(path, json!({ "$type": PRESENT_TYPES })),
                    Self::field(path, json!({ "$nin": entries })),
                ]
            }));
        }
        Ok(Self::field(path, Self::operand(condition, value_type)?))
    }

    fn vocabulary(
        condition: &FilterCondition,
        scheme: &str,
        layout: &FieldLayoutConfig,
    ) -> Result<Value> {
        let elem_match = |code_operand: Value| {
            let mut element = Map::new();
            element.insert(layout.tag_scheme_key.clone(), json!(scheme));
            element.insert(layout.tag_code_key.clone(), code_operand);
            Self::field(
                &layout.tag_array_field,
                json!({ "$elemMatch": Value::Object(element) }),
            )
        };

        if condition.operator == Operator::Nin {
            let excluded = Self::operand(condition, ValueType::Text)?;
            return Ok(json!({
                "$and": [
                    elem_match(json!({ "$type": PRESENT_TYPES })),
                    { "$nor": [elem_match(excluded)] },
                ]
            }));
        }

        Ok(elem_match(Self::operand(condition, ValueType::Text)?))
    }
}

impl QueryTarget for StoreTarget {
    type Output = StorePredicate;

    const NAME: &'static str = "store";

    fn match_all(&self) -> Value {
        json!({})
    }

    fn all_of(&self, mut clauses: Vec<Value>) -> Value {
        if clauses.len() == 1 {
            return clauses.remove(0);
        }
        json!({ "$and": clauses })
    }

    fn any_of(&self, mut clauses: Vec<Value>) -> Value {
        if clauses.len() == 1 {
            return clauses.remove(0);
        }
        json!({ "$or": clauses })
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
