//! 内容过滤领域模型

use crate::operators::{Operator, split_values};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// 过滤条件（叶子谓词）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    #[serde(rename = "_id", deserialize_with = "ids::one")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

impl FilterCondition {
    pub fn new(
        id: impl Into<String>,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// 从原始字符串操作符构造，未知操作符在此处被拒绝
    pub fn parse(
        id: impl Into<String>,
        field: impl Into<String>,
        operator: &str,
        value: impl Into<String>,
    ) -> crate::error::Result<Self> {
        Ok(Self::new(id, field, operator.parse()?, value))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// IN/NIN 的值列表；其他操作符返回单元素列表
    pub fn values(&self) -> Vec<&str> {
        if self.operator.is_list() {
            split_values(&self.value)
        } else {
            vec![self.value.as_str()]
        }
    }
}

/// 表达式：所有条件与所有父过滤器的合取
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(
        rename = "fc",
        default,
        deserialize_with = "ids::set",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub condition_ids: BTreeSet<String>,
    #[serde(
        rename = "pf",
        default,
        deserialize_with = "ids::set",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub parent_filter_ids: BTreeSet<String>,
}

impl Expression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().with_conditions(ids)
    }

    pub fn parents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().with_parents(ids)
    }

    pub fn with_conditions<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_parents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_filter_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.condition_ids.is_empty() && self.parent_filter_ids.is_empty()
    }
}

/// 内容过滤器：表达式的析取
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFilter {
    #[serde(rename = "_id", deserialize_with = "ids::one")]
    pub id: String,
    pub name: String,
    #[serde(rename = "content_filter", with = "expression_list")]
    pub expressions: Vec<Expression>,
    /// 每次保存递增，参与匹配缓存的键
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ContentFilter {
    pub fn new(name: impl Into<String>, expressions: Vec<Expression>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, expressions)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        expressions: Vec<Expression>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            expressions,
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// 所有表达式直接引用的条件 ID
    pub fn condition_ids(&self) -> BTreeSet<&str> {
        self.expressions
            .iter()
            .flat_map(|e| e.condition_ids.iter().map(String::as_str))
            .collect()
    }

    /// 所有表达式直接引用的父过滤器 ID
    pub fn parent_filter_ids(&self) -> BTreeSet<&str> {
        self.expressions
            .iter()
            .flat_map(|e| e.parent_filter_ids.iter().map(String::as_str))
            .collect()
    }
}

/// 标识反序列化：字符串与整数都接受，统一为字符串
pub(crate) mod ids {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeSet;

    fn to_id<E: Error>(value: Value) -> Result<String, E> {
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(E::custom(format!("无效的标识: {}", other))),
        }
    }

    pub fn one<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        to_id(Value::deserialize(deserializer)?)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => to_id(value).map(Some),
        }
    }

    pub fn list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Value>::deserialize(deserializer)?
            .into_iter()
            .map(to_id)
            .collect()
    }

    pub fn set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(list(deserializer)?.into_iter().collect())
    }
}

/// 线上格式：`[{"expression": {"fc": [...], "pf": [...]}}]`
mod expression_list {
    use super::Expression;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Entry<E> {
        expression: E,
    }

    pub fn serialize<S>(expressions: &[Expression], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let entries: Vec<Entry<&Expression>> = expressions
            .iter()
            .map(|expression| Entry { expression })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Expression>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries: Vec<Entry<Expression>> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| e.expression).collect())
    }
}

/// 内容条目
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentItem {
    data: Value,
}

impl ContentItem {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    /// 从 JSON 对象创建
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let data: Value = serde_json::from_str(json)?;
        Ok(Self { data })
    }

    /// 条目标识：优先 `_id`，其次 `guid`
    pub fn id(&self) -> Option<String> {
        ["_id", "guid"]
            .iter()
            .filter_map(|key| self.data.get(key))
            .find_map(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// 获取单个字段值（点号分隔路径，支持数组下标，如 "task.desk" 或 "subject.0.qcode"）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.data;

        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }

    /// 按路径收集所有叶子值：路径中途遇到对象数组时展开每个元素，
    /// 末端为数组时展开为元素。与文档库和搜索索引的点号路径语义一致。
    pub fn values_at(&self, path: &str) -> Vec<&Value> {
        collect_values(&self.data, path)
    }

    /// 获取底层数据
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// 获取可变数据（用于测试或上游修改条目）
    pub fn data_mut(&mut self) -> &mut Value {
        &mut self.data
    }
}

impl From<Value> for ContentItem {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// 点号路径展开
pub fn collect_values<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    };
    let mut out = Vec::new();
    walk(root, &parts, &mut out);
    out
}

fn walk<'a>(current: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        match current {
            Value::Array(arr) => out.extend(arr.iter()),
            other => out.push(other),
        }
        return;
    };

    match current {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                walk(next, rest, out);
            }
        }
        Value::Array(arr) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = arr.get(index) {
                    walk(next, rest, out);
                }
            } else {
                for element in arr {
                    if element.is_object() {
                        walk(element, parts, out);
                    }
                }
            }
        }
        _ => {}
    }
}
