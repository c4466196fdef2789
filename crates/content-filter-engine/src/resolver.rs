//! 词表解析
//!
//! 将条件中的字段名解析为字段类型。字段类型每次评估/编译时动态解析，
//! 不缓存在条件上，词表变更立即生效。

use dashmap::DashMap;
use filter_shared::config::FieldLayoutConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// 普通字段的值类型，决定 IN/NIN 是否按数值比较
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Text,
    Number,
}

/// 字段类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// 条目上的普通属性
    Plain { path: String, value_type: ValueType },
    /// 标签数组中 scheme 等于该词表的元素
    Vocabulary { scheme: String },
    /// 自定义属性对象中的自由文本
    CustomText { key: String },
}

/// 词表条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub name: String,
    pub qcode: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// 词表定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// "text" 表示自由文本自定义字段，其余为受控词表
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub items: Vec<VocabularyItem>,
}

impl Vocabulary {
    pub fn controlled(id: impl Into<String>, items: Vec<VocabularyItem>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            field_type: None,
            items,
        }
    }

    pub fn custom_text(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            field_type: Some("text".to_string()),
            items: Vec::new(),
        }
    }

    pub fn is_custom_text(&self) -> bool {
        self.field_type.as_deref() == Some("text")
    }
}

/// 词表解析器
#[cfg_attr(test, mockall::automock)]
pub trait VocabularyResolver: Send + Sync {
    /// 解析字段类型；未知字段视为普通属性
    fn resolve(&self, field: &str) -> FieldKind;

    /// 列出词表中的条目，词表不存在时返回空
    fn entries(&self, scheme: &str) -> Vec<VocabularyItem>;
}

/// 内存词表解析器
#[derive(Clone)]
pub struct MemoryVocabularyResolver {
    vocabularies: Arc<DashMap<String, Vocabulary>>,
    layout: Arc<FieldLayoutConfig>,
}

impl MemoryVocabularyResolver {
    pub fn new(layout: FieldLayoutConfig) -> Self {
        Self {
            vocabularies: Arc::new(DashMap::new()),
            layout: Arc::new(layout),
        }
    }

    pub fn with_vocabularies(layout: FieldLayoutConfig, vocabularies: Vec<Vocabulary>) -> Self {
        let resolver = Self::new(layout);
        for vocabulary in vocabularies {
            resolver.upsert(vocabulary);
        }
        resolver
    }

    pub fn upsert(&self, vocabulary: Vocabulary) {
        self.vocabularies.insert(vocabulary.id.clone(), vocabulary);
    }

    pub fn remove(&self, id: &str) -> Option<Vocabulary> {
        self.vocabularies.remove(id).map(|(_, v)| v)
    }
}

impl Default for MemoryVocabularyResolver {
    fn default() -> Self {
        Self::new(FieldLayoutConfig::default())
    }
}

impl VocabularyResolver for MemoryVocabularyResolver {
    fn resolve(&self, field: &str) -> FieldKind {
        if let Some(vocabulary) = self.vocabularies.get(field) {
            return if vocabulary.is_custom_text() {
                FieldKind::CustomText {
                    key: vocabulary.id.clone(),
                }
            } else {
                FieldKind::Vocabulary {
                    scheme: vocabulary.id.clone(),
                }
            };
        }

        let value_type = if self.layout.is_numeric(field) {
            ValueType::Number
        } else {
            ValueType::Text
        };
        FieldKind::Plain {
            path: field.to_string(),
            value_type,
        }
    }

    fn entries(&self, scheme: &str) -> Vec<VocabularyItem> {
        match self.vocabularies.get(scheme) {
            Some(vocabulary) => vocabulary.items.clone(),
            None => {
                debug!(scheme = %scheme, "词表不存在");
                Vec::new()
            }
        }
    }
}
