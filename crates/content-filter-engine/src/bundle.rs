//! 规则包
//!
//! 一次性描述词表、条件、过滤器、分发配置和待测条目的 JSON 文档，
//! 供命令行工具和测试夹具装载到引擎中。

use crate::distribution::{Product, RoutingRule, Subscriber};
use crate::engine::ContentFilterEngine;
use crate::error::{FilterError, Result};
use crate::models::{ContentFilter, ContentItem, FilterCondition};
use crate::resolver::{MemoryVocabularyResolver, Vocabulary};
use filter_shared::config::AppConfig;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// 规则包
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Bundle {
    pub vocabularies: Vec<Vocabulary>,
    pub conditions: Vec<FilterCondition>,
    pub filters: Vec<ContentFilter>,
    pub products: Vec<Product>,
    pub subscribers: Vec<Subscriber>,
    pub routing_rules: Vec<RoutingRule>,
    pub items: Vec<Value>,
}

impl Bundle {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn items(&self) -> Vec<ContentItem> {
        self.items.iter().cloned().map(ContentItem::new).collect()
    }

    /// 创建引擎并按依赖顺序装载全部内容，任何一项失败即中止
    pub fn into_engine(self, config: &AppConfig) -> Result<ContentFilterEngine> {
        let resolver =
            MemoryVocabularyResolver::with_vocabularies(config.fields.clone(), self.vocabularies);
        let engine = ContentFilterEngine::new(
            config.fields.clone(),
            config.cache.clone(),
            Arc::new(resolver),
        );

        let condition_count = self.conditions.len();
        for condition in self.conditions {
            engine.save_condition(condition)?;
        }

        let filter_count = self.filters.len();
        for rule in order_by_dependency(self.filters)? {
            engine.save_filter(rule)?;
        }

        for product in self.products {
            engine.save_product(product)?;
        }
        for subscriber in self.subscribers {
            engine.save_subscriber(subscriber)?;
        }
        for rule in self.routing_rules {
            engine.save_routing_rule(rule)?;
        }

        info!(
            conditions = condition_count,
            filters = filter_count,
            "规则包装载完成"
        );
        Ok(engine)
    }
}

/// 父过滤器排在引用它的过滤器之前；包外的父过滤器视为缺失
pub fn order_by_dependency(filters: Vec<ContentFilter>) -> Result<Vec<ContentFilter>> {
    let mut loaded: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(filters.len());
    let mut pending = filters;

    while !pending.is_empty() {
        let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|f| {
            f.parent_filter_ids()
                .iter()
                .all(|p| *p != f.id && loaded.contains(*p))
        });

        if ready.is_empty() {
            // 剩余过滤器互相等待：要么缺少父过滤器，要么存在环
            let stuck = &waiting[0];
            let known: HashSet<&str> = waiting.iter().map(|f| f.id.as_str()).collect();
            return Err(
                match stuck
                    .parent_filter_ids()
                    .into_iter()
                    .find(|p| !loaded.contains(*p) && !known.contains(p))
                {
                    Some(missing) => FilterError::FilterNotFound(missing.to_string()),
                    None => FilterError::CycleDetected {
                        path: waiting.iter().map(|f| f.id.clone()).collect(),
                    },
                },
            );
        }

        loaded.extend(ready.iter().map(|f| f.id.clone()));
        ordered.extend(ready);
        pending = waiting;
    }

    Ok(ordered)
}
