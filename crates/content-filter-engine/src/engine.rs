//! 内容过滤引擎
//!
//! 对外的统一入口：匹配判定（带缓存）、两种查询编译、依赖查询、
//! 规则的受保护保存与删除，以及订阅分发和路由判定。

use crate::backend::{ContentRepository, QueryResult, SearchBackend};
use crate::cache::MatchCache;
use crate::compiler::{self, SearchCompiler, SearchQuery, SearchTarget, StoreCompiler, StorePredicate, StoreTarget};
use crate::distribution::{DistributionRegistry, Product, RoutingRule, Subscriber};
use crate::error::{FilterError, Result};
use crate::evaluator::ExpressionEvaluator;
use crate::models::{ContentFilter, ContentItem, FilterCondition};
use crate::registry::{FilterLookup, FilterRegistry};
use crate::resolver::{MemoryVocabularyResolver, ValueType, VocabularyResolver};
use crate::usage;
use filter_shared::config::{AppConfig, CacheConfig, FieldLayoutConfig};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// 注册引擎使用的指标描述
pub fn describe_metrics() {
    metrics::describe_counter!(
        "content_filter_evaluations_total",
        "Total number of content filter evaluations"
    );
    metrics::describe_histogram!(
        "content_filter_evaluation_duration_seconds",
        "Content filter evaluation duration in seconds"
    );
    metrics::describe_counter!("content_filter_cache_hits_total", "Match cache hits");
    metrics::describe_counter!("content_filter_cache_misses_total", "Match cache misses");
    metrics::describe_counter!(
        "content_filter_cache_invalidations_total",
        "Targeted match cache invalidations"
    );
}

/// 内容过滤引擎
#[derive(Clone)]
pub struct ContentFilterEngine {
    registry: FilterRegistry,
    resolver: Arc<dyn VocabularyResolver>,
    layout: Arc<FieldLayoutConfig>,
    cache: MatchCache,
    cache_config: CacheConfig,
    distribution: Arc<DistributionRegistry>,
}

impl ContentFilterEngine {
    pub fn new(
        layout: FieldLayoutConfig,
        cache_config: CacheConfig,
        resolver: Arc<dyn VocabularyResolver>,
    ) -> Self {
        let distribution = Arc::new(DistributionRegistry::new());
        let registry = FilterRegistry::new().with_referents(distribution.clone());

        Self {
            registry,
            resolver,
            layout: Arc::new(layout),
            cache: MatchCache::new(&cache_config),
            cache_config,
            distribution,
        }
    }

    /// 按应用配置创建，使用内存词表
    pub fn from_config(config: &AppConfig) -> Self {
        let resolver = MemoryVocabularyResolver::new(config.fields.clone());
        Self::new(config.fields.clone(), config.cache.clone(), Arc::new(resolver))
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &dyn VocabularyResolver {
        self.resolver.as_ref()
    }

    pub fn layout(&self) -> &FieldLayoutConfig {
        &self.layout
    }

    pub fn cache(&self) -> &MatchCache {
        &self.cache
    }

    pub fn distribution(&self) -> &DistributionRegistry {
        &self.distribution
    }

    fn evaluator(&self) -> ExpressionEvaluator<'_> {
        ExpressionEvaluator::new(&self.registry, self.resolver.as_ref(), &self.layout)
    }

    fn store_compiler(&self) -> StoreCompiler<'_> {
        StoreCompiler::new(StoreTarget, &self.registry, self.resolver.as_ref(), &self.layout)
    }

    fn search_compiler(&self) -> SearchCompiler<'_> {
        SearchCompiler::new(SearchTarget, &self.registry, self.resolver.as_ref(), &self.layout)
    }

    // ==================== 匹配 ====================

    /// 判断条目是否满足过滤器
    ///
    /// `use_cache` 为 false 时跳过缓存读取，重新计算并写回结果。
    pub fn matches(
        &self,
        rule: Option<&ContentFilter>,
        item: &ContentItem,
        use_cache: bool,
    ) -> Result<bool> {
        self.matches_in(&self.cache, rule, item, use_cache)
    }

    /// 按 ID 查找过滤器后判断
    pub fn matches_id(&self, filter_id: &str, item: &ContentItem, use_cache: bool) -> Result<bool> {
        let rule = self.require_filter(filter_id)?;
        self.matches(Some(rule.as_ref()), item, use_cache)
    }

    fn matches_in(
        &self,
        cache: &MatchCache,
        rule: Option<&ContentFilter>,
        item: &ContentItem,
        use_cache: bool,
    ) -> Result<bool> {
        let Some(rule) = rule else {
            return Ok(true);
        };

        // 临时规则（无 ID）与无标识的条目不缓存
        let item_id = item.id().filter(|_| !rule.id.is_empty() && cache.is_enabled());

        if use_cache {
            if let Some(item_id) = &item_id {
                if let Some(hit) = cache.get(&rule.id, rule.revision, item_id) {
                    return Ok(hit);
                }
            }
        }

        let generation = cache.generation();
        let start = Instant::now();
        let matched = self.evaluator().matches(Some(rule), item)?;
        metrics::counter!("content_filter_evaluations_total").increment(1);
        metrics::histogram!("content_filter_evaluation_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        if let Some(item_id) = &item_id {
            cache.put(&rule.id, rule.revision, item_id, matched, generation);
        }

        Ok(matched)
    }

    /// 用过滤器筛选一批条目，返回命中的条目
    pub fn filter_items(&self, filter_id: &str, items: &[ContentItem]) -> Result<Vec<ContentItem>> {
        let rule = self.require_filter(filter_id)?;
        let scope = self.batch();

        let mut matched = Vec::new();
        for item in items {
            if scope.matches(Some(rule.as_ref()), item)? {
                matched.push(item.clone());
            }
        }

        debug!(filter_id, total = items.len(), matched = matched.len(), "条目筛选完成");
        Ok(matched)
    }

    /// 创建批处理作用域，作用域内使用独立的缓存
    pub fn batch(&self) -> BatchScope<'_> {
        let config = CacheConfig {
            enabled: true,
            ..self.cache_config.clone()
        };
        BatchScope {
            engine: self,
            cache: MatchCache::new(&config),
        }
    }

    // ==================== 编译 ====================

    pub fn compile_store(&self, rule: Option<&ContentFilter>) -> Result<StorePredicate> {
        self.store_compiler().compile(rule)
    }

    pub fn compile_search(&self, rule: Option<&ContentFilter>) -> Result<SearchQuery> {
        self.search_compiler().compile(rule)
    }

    /// 编译并在文档库中执行
    pub fn query_store(
        &self,
        rule: Option<&ContentFilter>,
        repository: &dyn ContentRepository,
    ) -> Result<QueryResult> {
        repository.execute(&self.compile_store(rule)?)
    }

    /// 编译并在搜索引擎中执行
    pub fn query_search(
        &self,
        rule: Option<&ContentFilter>,
        backend: &dyn SearchBackend,
    ) -> Result<QueryResult> {
        backend.execute(&self.compile_search(rule)?)
    }

    // ==================== 依赖 ====================

    pub fn dependents_of_condition(&self, condition_id: &str, transitive: bool) -> BTreeSet<String> {
        self.registry.dependents_of_condition(condition_id, transitive)
    }

    pub fn dependents_of_filter(&self, filter_id: &str, transitive: bool) -> BTreeSet<String> {
        self.registry.dependents_of_filter(filter_id, transitive)
    }

    /// 与给定条件取值有交集的已保存条件，经由过滤器（含父过滤器引用）和产品
    /// 所影响到的启用中订阅者
    #[instrument(skip(self, condition), fields(field = %condition.field, operator = %condition.operator))]
    pub fn subscribers_by_condition(&self, condition: &FilterCondition) -> Result<BTreeSet<String>> {
        compiler::check_condition(condition, self.resolver.as_ref(), &self.layout)?;

        let kind = self.resolver.resolve(&condition.field);
        let value_type = compiler::field_path(&kind, &self.layout)
            .map(|(_, value_type)| value_type)
            .unwrap_or(ValueType::Text);

        let mut filters = BTreeSet::new();
        for stored in self.registry.list_conditions() {
            if usage::overlaps(condition, &stored, value_type) {
                filters.extend(self.registry.dependents_of_condition(&stored.id, true));
            }
        }

        let subscribers = self.distribution.active_subscribers_using(&filters);
        debug!(filters = filters.len(), subscribers = subscribers.len(), "条件使用情况");
        Ok(subscribers)
    }

    // ==================== 规则维护 ====================

    pub fn get_filter(&self, filter_id: &str) -> Option<Arc<ContentFilter>> {
        self.registry.filter(filter_id)
    }

    pub fn get_condition(&self, condition_id: &str) -> Option<Arc<FilterCondition>> {
        self.registry.condition(condition_id)
    }

    fn require_filter(&self, filter_id: &str) -> Result<Arc<ContentFilter>> {
        self.registry
            .filter(filter_id)
            .ok_or_else(|| FilterError::FilterNotFound(filter_id.to_string()))
    }

    /// 保存条件，并使所有（间接）使用它的过滤器的缓存失效
    pub fn save_condition(&self, condition: FilterCondition) -> Result<Arc<FilterCondition>> {
        let saved = self.registry.save_condition_with(condition, |c| {
            compiler::check_condition(c, self.resolver.as_ref(), &self.layout)
        })?;

        let affected = self.registry.dependents_of_condition(&saved.id, true);
        self.cache.invalidate_filters(&affected);
        Ok(saved)
    }

    /// 保存过滤器；两个查询目标都能编译才会提交
    pub fn save_filter(&self, rule: ContentFilter) -> Result<Arc<ContentFilter>> {
        let saved = self.registry.save_filter_with(rule, |r| {
            self.compile_store(Some(r))?;
            self.compile_search(Some(r))?;
            Ok(())
        })?;

        let mut affected = self.registry.dependents_of_filter(&saved.id, true);
        affected.insert(saved.id.clone());
        self.cache.invalidate_filters(&affected);
        Ok(saved)
    }

    /// 删除过滤器；仍被引用时返回 ReferentialIntegrity 及引用方列表
    pub fn delete(&self, filter_id: &str) -> Result<ContentFilter> {
        let removed = self.registry.delete_filter(filter_id)?;
        self.cache.invalidate_filters(&BTreeSet::from([filter_id.to_string()]));
        Ok(Arc::unwrap_or_clone(removed))
    }

    pub fn delete_condition(&self, condition_id: &str) -> Result<FilterCondition> {
        self.registry
            .delete_condition(condition_id)
            .map(Arc::unwrap_or_clone)
    }

    // ==================== 分发 ====================

    /// 保存产品；引用的过滤器必须存在
    #[instrument(skip(self, product), fields(product_id = %product.id))]
    pub fn save_product(&self, product: Product) -> Result<()> {
        self.registry.with_writer_lock(|| -> Result<()> {
            if let Some(filter_id) = product.filter_id() {
                self.require_filter(filter_id)?;
            }
            self.distribution.upsert_product(product);
            Ok(())
        })?;
        info!("产品已保存");
        Ok(())
    }

    /// 保存路由规则；引用的过滤器必须存在
    #[instrument(skip(self, rule), fields(routing_rule_id = %rule.id))]
    pub fn save_routing_rule(&self, rule: RoutingRule) -> Result<()> {
        self.registry.with_writer_lock(|| -> Result<()> {
            if let Some(filter_id) = &rule.filter {
                self.require_filter(filter_id)?;
            }
            self.distribution.upsert_routing_rule(rule);
            Ok(())
        })?;
        info!("路由规则已保存");
        Ok(())
    }

    pub fn save_subscriber(&self, subscriber: Subscriber) -> Result<()> {
        if let Some(missing) = subscriber
            .products
            .iter()
            .find(|id| self.distribution.product(id).is_none())
        {
            return Err(FilterError::NotFound {
                entity: "product",
                id: missing.clone(),
            });
        }
        self.distribution.upsert_subscriber(subscriber);
        Ok(())
    }

    /// 订阅者是否接收条目：任一产品接受即可
    pub fn subscriber_receives(&self, subscriber_id: &str, item: &ContentItem) -> Result<bool> {
        self.subscriber_receives_in(&self.cache, subscriber_id, item)
    }

    fn subscriber_receives_in(
        &self,
        cache: &MatchCache,
        subscriber_id: &str,
        item: &ContentItem,
    ) -> Result<bool> {
        let subscriber = self
            .distribution
            .subscriber(subscriber_id)
            .ok_or_else(|| FilterError::NotFound {
                entity: "subscriber",
                id: subscriber_id.to_string(),
            })?;

        if !subscriber.is_active {
            debug!(subscriber_id, "订阅者未启用");
            return Ok(false);
        }

        for product in self.distribution.products_of(&subscriber) {
            if self.product_accepts(cache, &product, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn product_accepts(&self, cache: &MatchCache, product: &Product, item: &ContentItem) -> Result<bool> {
        let Some(config) = &product.content_filter else {
            return Ok(true);
        };

        let rule = match self.registry.filter(&config.filter_id) {
            Some(rule) => rule,
            None => {
                warn!(product_id = %product.id, filter_id = %config.filter_id, "产品引用的过滤器不存在");
                return Err(FilterError::FilterNotFound(config.filter_id.clone()));
            }
        };

        let matched = self.matches_in(cache, Some(rule.as_ref()), item, true)?;
        Ok(config.filter_type.accepts(matched))
    }

    /// 路由规则是否作用于条目；未设置过滤器的规则总是生效
    pub fn routing_rule_applies(&self, rule_id: &str, item: &ContentItem) -> Result<bool> {
        self.routing_rule_applies_in(&self.cache, rule_id, item)
    }

    fn routing_rule_applies_in(
        &self,
        cache: &MatchCache,
        rule_id: &str,
        item: &ContentItem,
    ) -> Result<bool> {
        let routing_rule = self
            .distribution
            .routing_rule(rule_id)
            .ok_or_else(|| FilterError::NotFound {
                entity: "routing rule",
                id: rule_id.to_string(),
            })?;

        let rule = routing_rule
            .filter
            .as_deref()
            .map(|id| self.require_filter(id))
            .transpose()?;

        self.matches_in(cache, rule.as_deref(), item, true)
    }
}

/// 批处理作用域
///
/// 一次路由或分发处理使用独立缓存，作用域结束即丢弃。
pub struct BatchScope<'e> {
    engine: &'e ContentFilterEngine,
    cache: MatchCache,
}

impl BatchScope<'_> {
    pub fn matches(&self, rule: Option<&ContentFilter>, item: &ContentItem) -> Result<bool> {
        self.engine.matches_in(&self.cache, rule, item, true)
    }

    pub fn subscriber_receives(&self, subscriber_id: &str, item: &ContentItem) -> Result<bool> {
        self.engine
            .subscriber_receives_in(&self.cache, subscriber_id, item)
    }

    pub fn routing_rule_applies(&self, rule_id: &str, item: &ContentItem) -> Result<bool> {
        self.engine
            .routing_rule_applies_in(&self.cache, rule_id, item)
    }

    /// 作用域内缓存的结果数
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::FilterType;
    use crate::models::Expression;
    use crate::operators::Operator;
    use serde_json::json;

    fn engine() -> ContentFilterEngine {
        let engine = ContentFilterEngine::from_config(&AppConfig::default());
        engine
            .save_condition(FilterCondition::new("1", "headline", Operator::Like, "tor"))
            .unwrap();
        engine
            .save_condition(FilterCondition::new("2", "urgency", Operator::In, "2"))
            .unwrap();
        engine
            .save_filter(ContentFilter::with_id("1", "tor", vec![Expression::conditions(["1"])]))
            .unwrap();
        engine
            .save_filter(ContentFilter::with_id(
                "3",
                "tor-urgent",
                vec![Expression::conditions(["2"]).with_parents(["1"])],
            ))
            .unwrap();
        engine
    }

    fn item(id: &str, headline: &str, urgency: i64) -> ContentItem {
        ContentItem::new(json!({"_id": id, "headline": headline, "urgency": urgency}))
    }

    #[test]
    fn test_matches_uses_cache() {
        let engine = engine();
        let rule = engine.get_filter("1").unwrap();
        let story = item("a", "story", 1);

        assert!(engine.matches(Some(rule.as_ref()), &story, true).unwrap());
        assert!(engine.matches(Some(rule.as_ref()), &story, true).unwrap());
        assert_eq!(engine.cache().stats().hits, 1);
    }

    #[test]
    fn test_adhoc_rules_are_not_cached() {
        let engine = engine();
        let adhoc = ContentFilter::with_id("", "adhoc", vec![Expression::conditions(["1"])]);

        assert!(engine.matches(Some(&adhoc), &item("a", "story", 1), true).unwrap());
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_condition_change_invalidates_dependents() {
        let engine = engine();
        let parent = engine.get_filter("1").unwrap();
        let child = engine.get_filter("3").unwrap();
        let target = item("a", "story", 2);

        assert!(engine.matches(Some(parent.as_ref()), &target, true).unwrap());
        assert!(engine.matches(Some(child.as_ref()), &target, true).unwrap());
        assert_eq!(engine.cache().len(), 2);

        engine
            .save_condition(FilterCondition::new("1", "headline", Operator::Like, "xyz"))
            .unwrap();

        assert!(engine.cache().is_empty());
        assert!(!engine.matches(Some(child.as_ref()), &target, true).unwrap());
    }

    #[test]
    fn test_save_condition_rejects_inexpressible() {
        let engine = engine();
        let err = engine
            .save_condition(FilterCondition::new("9", "urgency", Operator::In, "high"))
            .unwrap_err();
        assert_eq!(err.code(), "INEXPRESSIBLE_CONDITION");
        assert!(engine.get_condition("9").is_none());
    }

    #[test]
    fn test_delete_guarded_by_product() {
        let engine = engine();
        engine
            .save_product(Product::new("p-2", "p-2").with_filter("1", FilterType::Blocking))
            .unwrap();

        engine.delete("3").unwrap();
        let err = engine.delete("1").unwrap_err();
        assert_eq!(err.code(), "REFERENTIAL_INTEGRITY");
        assert_eq!(err.referents().len(), 1);
    }

    #[test]
    fn test_product_requires_existing_filter() {
        let engine = engine();
        let err = engine
            .save_product(Product::new("p", "p").with_filter("404", FilterType::Permitting))
            .unwrap_err();
        assert_eq!(err.code(), "FILTER_NOT_FOUND");
    }

    #[test]
    fn test_subscriber_receives() {
        let engine = engine();
        engine
            .save_product(Product::new("block", "block").with_filter("1", FilterType::Blocking))
            .unwrap();
        engine
            .save_product(Product::new("permit", "permit").with_filter("1", FilterType::Permitting))
            .unwrap();
        engine
            .save_subscriber(Subscriber::new("s-block", "s", ["block"]))
            .unwrap();
        engine
            .save_subscriber(Subscriber::new("s-permit", "s", ["permit"]))
            .unwrap();

        let story = item("a", "story", 1);
        let other = item("b", "weather", 1);

        assert!(!engine.subscriber_receives("s-block", &story).unwrap());
        assert!(engine.subscriber_receives("s-block", &other).unwrap());
        assert!(engine.subscriber_receives("s-permit", &story).unwrap());
        assert!(!engine.subscriber_receives("s-permit", &other).unwrap());
        assert_eq!(
            engine.subscriber_receives("nobody", &story).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn test_routing_rule_applies() {
        let engine = engine();
        engine
            .save_routing_rule(RoutingRule::new("r-1", "tor", Some("1".into())))
            .unwrap();
        engine
            .save_routing_rule(RoutingRule::new("r-all", "all", None))
            .unwrap();

        assert!(engine.routing_rule_applies("r-1", &item("a", "story", 1)).unwrap());
        assert!(!engine.routing_rule_applies("r-1", &item("b", "weather", 1)).unwrap());
        assert!(engine.routing_rule_applies("r-all", &item("b", "weather", 1)).unwrap());
    }

    #[test]
    fn test_batch_scope_has_private_cache() {
        let engine = engine();
        let rule = engine.get_filter("1").unwrap();
        let story = item("a", "story", 1);

        let scope = engine.batch();
        assert!(scope.matches(Some(rule.as_ref()), &story).unwrap());
        assert_eq!(scope.cached(), 1);
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_filter_items() {
        let engine = engine();
        let items = vec![item("a", "story", 2), item("b", "story", 1), item("c", "news", 2)];

        let matched = engine.filter_items("3", &items).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), Some("a".to_string()));
    }
}
