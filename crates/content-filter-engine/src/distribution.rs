//! 分发配置
//!
//! 产品（订阅）的过滤配置、订阅者与产品的关系、路由规则引用的过滤器。
//! 同时作为删除保护的外部引用方登记。

use crate::error::Referent;
use crate::models::ids;
use crate::registry::ReferentRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// 产品过滤方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// 命中过滤器的条目不分发
    Blocking,
    /// 只分发命中过滤器的条目
    Permitting,
}

impl FilterType {
    /// 根据过滤结果判断产品是否接受条目
    pub fn accepts(self, matched: bool) -> bool {
        match self {
            Self::Blocking => !matched,
            Self::Permitting => matched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFilter {
    #[serde(deserialize_with = "ids::one")]
    pub filter_id: String,
    pub filter_type: FilterType,
}

/// 产品
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "_id", deserialize_with = "ids::one")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_filter: Option<ProductFilter>,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content_filter: None,
        }
    }

    pub fn with_filter(mut self, filter_id: impl Into<String>, filter_type: FilterType) -> Self {
        self.content_filter = Some(ProductFilter {
            filter_id: filter_id.into(),
            filter_type,
        });
        self
    }

    pub fn filter_id(&self) -> Option<&str> {
        self.content_filter.as_ref().map(|f| f.filter_id.as_str())
    }
}

/// 订阅者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    #[serde(rename = "_id", deserialize_with = "ids::one")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "ids::list")]
    pub products: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Subscriber {
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            products: products.into_iter().map(Into::into).collect(),
            is_active: true,
        }
    }
}

/// 路由规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "_id", deserialize_with = "ids::one")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 未设置过滤器的规则对所有条目生效
    #[serde(default, deserialize_with = "ids::optional")]
    pub filter: Option<String>,
}

impl RoutingRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            filter,
        }
    }
}

/// 分发配置登记
#[derive(Debug, Clone, Default)]
pub struct DistributionRegistry {
    products: Arc<DashMap<String, Product>>,
    subscribers: Arc<DashMap<String, Subscriber>>,
    routing_rules: Arc<DashMap<String, RoutingRule>>,
}

impl DistributionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_product(&self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    pub fn upsert_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.id.clone(), subscriber);
    }

    pub fn upsert_routing_rule(&self, rule: RoutingRule) {
        self.routing_rules.insert(rule.id.clone(), rule);
    }

    pub fn product(&self, id: &str) -> Option<Product> {
        self.products.get(id).map(|p| p.clone())
    }

    pub fn subscriber(&self, id: &str) -> Option<Subscriber> {
        self.subscribers.get(id).map(|s| s.clone())
    }

    pub fn routing_rule(&self, id: &str) -> Option<RoutingRule> {
        self.routing_rules.get(id).map(|r| r.clone())
    }

    /// 订阅者关联的产品；不存在的产品被忽略
    pub fn products_of(&self, subscriber: &Subscriber) -> Vec<Product> {
        subscriber
            .products
            .iter()
            .filter_map(|id| self.product(id))
            .collect()
    }

    /// 启用中、且至少有一个产品使用了给定过滤器的订阅者
    pub fn active_subscribers_using(&self, filter_ids: &BTreeSet<String>) -> BTreeSet<String> {
        self.subscribers
            .iter()
            .filter(|s| s.is_active)
            .filter(|s| {
                self.products_of(s)
                    .iter()
                    .any(|p| p.filter_id().is_some_and(|id| filter_ids.contains(id)))
            })
            .map(|s| s.id.clone())
            .collect()
    }
}

impl ReferentRegistry for DistributionRegistry {
    fn list_referencing(&self, filter_id: &str) -> Vec<Referent> {
        let mut referents: Vec<Referent> = self
            .products
            .iter()
            .filter(|p| p.filter_id() == Some(filter_id))
            .map(|p| Referent::Product(p.id.clone()))
            .collect();

        referents.extend(
            self.routing_rules
                .iter()
                .filter(|r| r.filter.as_deref() == Some(filter_id))
                .map(|r| Referent::RoutingRule(r.id.clone())),
        );

        referents.sort();
        referents
    }
}
