//! 查询后端
//!
//! 编译后的查询交给外部后端执行。内置的内存实现覆盖编译器用到的查询子集，
//! 用于开发、测试以及验证三种判定方式的一致性。

mod memory_search;
mod memory_store;

pub use memory_search::MemorySearchIndex;
pub use memory_store::MemoryContentStore;

use crate::compiler::{SearchQuery, StorePredicate};
use crate::error::Result;
use crate::models::{ContentItem, collect_values};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// 查询结果
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub items: Vec<ContentItem>,
    pub count: usize,
}

impl QueryResult {
    /// 结果中的条目 ID
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().filter_map(ContentItem::id).collect()
    }
}

/// 文档库
#[cfg_attr(test, mockall::automock)]
pub trait ContentRepository: Send + Sync {
    /// 按谓词查询条目
    fn execute(&self, predicate: &StorePredicate) -> Result<QueryResult>;
}

/// 搜索引擎
#[cfg_attr(test, mockall::automock)]
pub trait SearchBackend: Send + Sync {
    fn execute(&self, query: &SearchQuery) -> Result<QueryResult>;
}

/// 内存条目集合，多个内存后端可共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct ItemCollection {
    items: Arc<DashMap<String, ContentItem>>,
}

impl ItemCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或更新条目；没有 ID 的条目分配随机 ID
    pub fn insert(&self, item: ContentItem) -> String {
        let id = item.id().unwrap_or_else(|| Uuid::new_v4().to_string());
        self.items.insert(id.clone(), item);
        id
    }

    pub fn get(&self, id: &str) -> Option<ContentItem> {
        self.items.get(id).map(|v| v.clone())
    }

    pub fn remove(&self, id: &str) -> Option<ContentItem> {
        self.items.remove(id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 按条件筛选，结果按 ID 排序
    pub(crate) fn try_filter<F>(&self, predicate: F) -> Result<QueryResult>
    where
        F: Fn(&Value) -> Result<bool>,
    {
        let mut matched = Vec::new();
        for entry in self.items.iter() {
            if predicate(entry.value().data())? {
                matched.push((entry.key().clone(), entry.value().clone()));
            }
        }
        matched.sort_by(|a, b| a.0.cmp(&b.0));

        let items: Vec<ContentItem> = matched.into_iter().map(|(_, item)| item).collect();
        Ok(QueryResult {
            count: items.len(),
            items,
        })
    }
}

/// 路径末端字段的原始值（不展开数组），中途的对象数组仍会展开
pub(crate) fn raw_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (parent, last),
        None => ("", path),
    };
    collect_values(doc, parent)
        .into_iter()
        .filter_map(|v| v.get(last))
        .collect()
}

/// 标量相等：字符串精确比较，数值按数值比较，布尔直接比较
pub(crate) fn scalar_eq(candidate: &Value, expected: &Value) -> bool {
    match (candidate, expected) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => crate::evaluator::numbers_equal(a, b),
            _ => false,
        },
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

/// 是否为视为存在的标量
pub(crate) fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_values() {
        let doc = json!({"subject": [{"qcode": "a"}], "task": {"desk": "d1"}});
        assert_eq!(raw_values(&doc, "subject"), vec![&json!([{"qcode": "a"}])]);
        assert_eq!(raw_values(&doc, "task.desk"), vec![&json!("d1")]);
        assert!(raw_values(&doc, "missing").is_empty());
    }

    #[test]
    fn test_scalar_eq() {
        assert!(scalar_eq(&json!(2), &json!(2.0)));
        assert!(!scalar_eq(&json!("2"), &json!(2)));
        assert!(scalar_eq(&json!(true), &json!(true)));
    }

    #[test]
    fn test_collection_assigns_ids() {
        let collection = ItemCollection::new();
        let id = collection.insert(ContentItem::new(json!({"headline": "x"})));
        assert!(!id.is_empty());
        assert_eq!(collection.insert(ContentItem::new(json!({"_id": "1"}))), "1");
        assert_eq!(collection.len(), 2);
        assert!(collection.get("1").is_some());
    }
}
