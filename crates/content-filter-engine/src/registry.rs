//! 过滤规则注册表
//!
//! 条件与过滤器的唯一写入入口：保存时校验、维护依赖索引、执行删除保护。
//! 所有写操作经由同一把写锁串行化，删除检查与删除动作对并发保存是原子的。

use crate::dependency::DependencyIndex;
use crate::error::{FilterError, Referent, Result};
use crate::models::{ContentFilter, FilterCondition};
use crate::operators::split_values;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 条件与过滤器的只读查询
pub trait FilterLookup: Send + Sync {
    fn condition(&self, id: &str) -> Option<Arc<FilterCondition>>;
    fn filter(&self, id: &str) -> Option<Arc<ContentFilter>>;
}

/// 外部引用方登记（产品/订阅、路由规则）
#[cfg_attr(test, mockall::automock)]
pub trait ReferentRegistry: Send + Sync {
    /// 列出引用该过滤器的所有对象
    fn list_referencing(&self, filter_id: &str) -> Vec<Referent>;
}

/// 过滤规则注册表
#[derive(Clone)]
pub struct FilterRegistry {
    conditions: Arc<DashMap<String, Arc<FilterCondition>>>,
    filters: Arc<DashMap<String, Arc<ContentFilter>>>,
    index: Arc<RwLock<DependencyIndex>>,
    /// 单写者锁
    writer: Arc<Mutex<()>>,
    referents: Vec<Arc<dyn ReferentRegistry>>,
}

impl FilterRegistry {
    /// 创建新的注册表
    pub fn new() -> Self {
        Self {
            conditions: Arc::new(DashMap::new()),
            filters: Arc::new(DashMap::new()),
            index: Arc::new(RwLock::new(DependencyIndex::new())),
            writer: Arc::new(Mutex::new(())),
            referents: Vec::new(),
        }
    }

    /// 挂载外部引用方，删除过滤器前会逐一询问
    pub fn with_referents(mut self, registry: Arc<dyn ReferentRegistry>) -> Self {
        self.referents.push(registry);
        self
    }

    /// 当前存储的过滤器数量
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    /// 在写锁内执行外部引用方的变更，使其与删除检查互斥
    ///
    /// 闭包内不得再调用本注册表的写操作。
    pub fn with_writer_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.writer.lock();
        f()
    }

    /// 保存条件（新增或更新）
    pub fn save_condition(&self, condition: FilterCondition) -> Result<Arc<FilterCondition>> {
        self.save_condition_with(condition, |_| Ok(()))
    }

    /// 保存条件，在提交前执行激活检查（如两个查询目标的可编译性）
    #[instrument(skip(self, condition, activate), fields(condition_id = %condition.id))]
    pub fn save_condition_with<F>(
        &self,
        condition: FilterCondition,
        activate: F,
    ) -> Result<Arc<FilterCondition>>
    where
        F: FnOnce(&FilterCondition) -> Result<()>,
    {
        let _guard = self.writer.lock();

        Self::validate_condition(&condition)?;
        activate(&condition)?;

        let condition = Arc::new(condition);
        self.conditions
            .insert(condition.id.clone(), Arc::clone(&condition));

        info!(field = %condition.field, operator = %condition.operator, "过滤条件已保存");
        Ok(condition)
    }

    /// 保存过滤器（新增或更新）
    pub fn save_filter(&self, rule: ContentFilter) -> Result<Arc<ContentFilter>> {
        self.save_filter_with(rule, |_| Ok(()))
    }

    /// 保存过滤器，结构校验通过后、提交前执行激活检查
    #[instrument(skip(self, rule, activate), fields(filter_id = %rule.id, filter_name = %rule.name))]
    pub fn save_filter_with<F>(&self, mut rule: ContentFilter, activate: F) -> Result<Arc<ContentFilter>>
    where
        F: FnOnce(&ContentFilter) -> Result<()>,
    {
        let _guard = self.writer.lock();

        self.validate_filter(&rule)?;
        activate(&rule)?;

        let previous = self.filters.get(&rule.id).map(|r| Arc::clone(r.value()));
        match &previous {
            Some(old) => {
                rule.revision = old.revision + 1;
                rule.created_at = old.created_at;
            }
            None => rule.revision = rule.revision.max(1),
        }
        rule.updated_at = Utc::now();

        {
            let mut index = self.index.write();
            match &previous {
                Some(old) => index.replace(old, &rule),
                None => index.register(&rule),
            }
        }

        let rule = Arc::new(rule);
        self.filters.insert(rule.id.clone(), Arc::clone(&rule));

        info!(revision = rule.revision, "内容过滤器已保存");
        Ok(rule)
    }

    /// 删除过滤器；仍被引用时返回全部引用方
    #[instrument(skip(self))]
    pub fn delete_filter(&self, filter_id: &str) -> Result<Arc<ContentFilter>> {
        let _guard = self.writer.lock();

        if !self.filters.contains_key(filter_id) {
            warn!("删除不存在的过滤器: {}", filter_id);
            return Err(FilterError::FilterNotFound(filter_id.to_string()));
        }

        let referents = self.referents_of_filter(filter_id);
        if !referents.is_empty() {
            warn!(referents = ?referents, "过滤器仍被引用，拒绝删除");
            return Err(FilterError::ReferentialIntegrity {
                id: filter_id.to_string(),
                referents,
            });
        }

        let (_, removed) = self
            .filters
            .remove(filter_id)
            .ok_or_else(|| FilterError::FilterNotFound(filter_id.to_string()))?;
        self.index.write().unregister(&removed);

        info!("内容过滤器已删除: {}", filter_id);
        Ok(removed)
    }

    /// 删除条件；仍被过滤器使用时拒绝
    #[instrument(skip(self))]
    pub fn delete_condition(&self, condition_id: &str) -> Result<Arc<FilterCondition>> {
        let _guard = self.writer.lock();

        let users = self.index.read().dependents_of_condition(condition_id, false);
        if !users.is_empty() {
            warn!(filters = ?users, "过滤条件仍被使用，拒绝删除");
            return Err(FilterError::ReferentialIntegrity {
                id: condition_id.to_string(),
                referents: users.into_iter().map(Referent::ContentFilter).collect(),
            });
        }

        match self.conditions.remove(condition_id) {
            Some((_, removed)) => {
                info!("过滤条件已删除: {}", condition_id);
                Ok(removed)
            }
            None => {
                warn!("删除不存在的过滤条件: {}", condition_id);
                Err(FilterError::ConditionNotFound(condition_id.to_string()))
            }
        }
    }

    /// 汇总过滤器的所有引用方：其他过滤器 + 外部登记
    fn referents_of_filter(&self, filter_id: &str) -> Vec<Referent> {
        let mut referents: BTreeSet<Referent> = self
            .index
            .read()
            .dependents_of_filter(filter_id, false)
            .into_iter()
            .map(Referent::ContentFilter)
            .collect();

        for registry in &self.referents {
            referents.extend(registry.list_referencing(filter_id));
        }

        referents.into_iter().collect()
    }

    pub fn dependents_of_condition(&self, condition_id: &str, transitive: bool) -> BTreeSet<String> {
        self.index.read().dependents_of_condition(condition_id, transitive)
    }

    pub fn dependents_of_filter(&self, filter_id: &str, transitive: bool) -> BTreeSet<String> {
        self.index.read().dependents_of_filter(filter_id, transitive)
    }

    /// 获取所有过滤器 ID
    pub fn list_ids(&self) -> Vec<String> {
        self.filters.iter().map(|r| r.key().clone()).collect()
    }

    /// 获取所有过滤器
    pub fn list_all(&self) -> Vec<Arc<ContentFilter>> {
        self.filters.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn list_conditions(&self) -> Vec<Arc<FilterCondition>> {
        self.conditions.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// 校验条件本身
    fn validate_condition(condition: &FilterCondition) -> Result<()> {
        let invalid = |reason: &str| FilterError::InvalidCondition {
            condition_id: condition.id.clone(),
            reason: reason.to_string(),
        };

        if condition.id.is_empty() {
            return Err(invalid("条件 ID 不能为空"));
        }
        if condition.field.trim().is_empty() {
            return Err(invalid("字段不能为空"));
        }
        if condition.operator.is_list() {
            if split_values(&condition.value).is_empty() {
                return Err(invalid("值列表不能为空"));
            }
        } else if condition.value.is_empty() {
            return Err(invalid("值不能为空"));
        }

        Ok(())
    }

    /// 校验过滤器结构：非空、引用存在、无环
    fn validate_filter(&self, rule: &ContentFilter) -> Result<()> {
        if rule.id.is_empty() {
            return Err(FilterError::FilterNotFound(String::new()));
        }
        if rule.expressions.is_empty() {
            return Err(FilterError::EmptyFilter(rule.id.clone()));
        }

        for (index, expression) in rule.expressions.iter().enumerate() {
            if expression.is_empty() {
                return Err(FilterError::EmptyExpression {
                    filter_id: rule.id.clone(),
                    index,
                });
            }

            if let Some(missing) = expression
                .condition_ids
                .iter()
                .find(|id| !self.conditions.contains_key(id.as_str()))
            {
                return Err(FilterError::ConditionNotFound(missing.clone()));
            }

            if let Some(missing) = expression
                .parent_filter_ids
                .iter()
                .find(|id| **id != rule.id && !self.filters.contains_key(id.as_str()))
            {
                return Err(FilterError::FilterNotFound(missing.clone()));
            }
        }

        let parents = rule.parent_filter_ids();
        if let Some(parent) = self
            .index
            .read()
            .would_create_cycle(&rule.id, parents.iter().copied())
        {
            let mut path = vec![rule.id.clone(), parent.clone()];
            if parent != rule.id {
                path.push(rule.id.clone());
            }
            return Err(FilterError::CycleDetected { path });
        }

        Ok(())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterLookup for FilterRegistry {
    fn condition(&self, id: &str) -> Option<Arc<FilterCondition>> {
        self.conditions.get(id).map(|c| Arc::clone(c.value()))
    }

    fn filter(&self, id: &str) -> Option<Arc<ContentFilter>> {
        self.filters.get(id).map(|f| Arc::clone(f.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Expression;
    use crate::operators::Operator;

    fn registry_with_conditions() -> FilterRegistry {
        let registry = FilterRegistry::new();
        registry
            .save_condition(FilterCondition::new("1", "headline", Operator::Like, "tor"))
            .unwrap();
        registry
            .save_condition(FilterCondition::new("2", "urgency", Operator::In, "2"))
            .unwrap();
        registry
    }

    fn filter(id: &str, expressions: Vec<Expression>) -> ContentFilter {
        ContentFilter::with_id(id, format!("filter-{}", id), expressions)
    }

    #[test]
    fn test_save_and_get_filter() {
        let registry = registry_with_conditions();
        let saved = registry
            .save_filter(filter("1", vec![Expression::conditions(["1"])]))
            .unwrap();

        assert_eq!(saved.revision, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.filter("1").unwrap().name, "filter-1");
        assert!(registry.dependents_of_condition("1", false).contains("1"));
    }

    #[test]
    fn test_update_bumps_revision() {
        let registry = registry_with_conditions();
        let first = registry
            .save_filter(filter("1", vec![Expression::conditions(["1"])]))
            .unwrap();
        let second = registry
            .save_filter(filter("1", vec![Expression::conditions(["2"])]))
            .unwrap();

        assert_eq!(second.revision, 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(registry.dependents_of_condition("1", false).is_empty());
        assert!(registry.dependents_of_condition("2", false).contains("1"));
    }

    #[test]
    fn test_rejects_empty_expression() {
        let registry = registry_with_conditions();
        let err = registry
            .save_filter(filter(
                "1",
                vec![Expression::conditions(["1"]), Expression::new()],
            ))
            .unwrap_err();

        assert!(matches!(err, FilterError::EmptyExpression { index: 1, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejects_empty_filter() {
        let registry = registry_with_conditions();
        let err = registry.save_filter(filter("1", vec![])).unwrap_err();
        assert_eq!(err.code(), "EMPTY_FILTER");
    }

    #[test]
    fn test_rejects_unknown_references() {
        let registry = registry_with_conditions();

        let err = registry
            .save_filter(filter("1", vec![Expression::conditions(["99"])]))
            .unwrap_err();
        assert_eq!(err.code(), "CONDITION_NOT_FOUND");

        let err = registry
            .save_filter(filter("1", vec![Expression::parents(["nope"])]))
            .unwrap_err();
        assert_eq!(err.code(), "FILTER_NOT_FOUND");
    }

    #[test]
    fn test_rejects_self_reference() {
        let registry = registry_with_conditions();
        let err = registry
            .save_filter(filter("1", vec![Expression::parents(["1"])]))
            .unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");
    }

    #[test]
    fn test_rejects_indirect_cycle() {
        let registry = registry_with_conditions();
        registry
            .save_filter(filter("a", vec![Expression::conditions(["1"])]))
            .unwrap();
        registry
            .save_filter(filter("b", vec![Expression::parents(["a"])]))
            .unwrap();

        // a 改为引用 b，会形成 a -> b -> a
        let err = registry
            .save_filter(filter("a", vec![Expression::parents(["b"])]))
            .unwrap_err();
        assert_eq!(err.to_string(), "检测到循环引用: a -> b -> a");
        assert_eq!(registry.filter("a").unwrap().revision, 1);
    }

    #[test]
    fn test_rejects_invalid_conditions() {
        let registry = FilterRegistry::new();

        let err = registry
            .save_condition(FilterCondition::new("1", "", Operator::Eq, "x"))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONDITION");

        let err = registry
            .save_condition(FilterCondition::new("2", "urgency", Operator::In, " , "))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONDITION");

        let err = registry
            .save_condition(FilterCondition::new("3", "headline", Operator::Like, ""))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONDITION");
    }

    #[test]
    fn test_activation_failure_blocks_save() {
        let registry = registry_with_conditions();
        let err = registry
            .save_filter_with(filter("1", vec![Expression::conditions(["1"])]), |_| {
                Err(FilterError::Inexpressible {
                    condition_id: "1".into(),
                    target: "store",
                    reason: "test".into(),
                })
            })
            .unwrap_err();

        assert_eq!(err.code(), "INEXPRESSIBLE_CONDITION");
        assert!(registry.filter("1").is_none());
        assert!(registry.dependents_of_condition("1", false).is_empty());
    }

    #[test]
    fn test_delete_blocked_by_parent_reference() {
        let registry = registry_with_conditions();
        registry
            .save_filter(filter("1", vec![Expression::conditions(["1"])]))
            .unwrap();
        registry
            .save_filter(filter("3", vec![Expression::conditions(["2"]).with_parents(["1"])]))
            .unwrap();

        let err = registry.delete_filter("1").unwrap_err();
        assert_eq!(err.referents(), &[Referent::ContentFilter("3".into())]);

        registry.delete_filter("3").unwrap();
        registry.delete_filter("1").unwrap();
        assert!(registry.is_empty());
        assert!(registry.dependents_of_condition("1", false).is_empty());
    }

    #[test]
    fn test_delete_blocked_by_external_referents() {
        let mut external = MockReferentRegistry::new();
        external.expect_list_referencing().returning(|id| match id {
            "1" => vec![Referent::Product("p-2".into())],
            _ => vec![],
        });

        let registry = registry_with_conditions().with_referents(Arc::new(external));
        registry
            .save_filter(filter("1", vec![Expression::conditions(["1"])]))
            .unwrap();
        registry
            .save_filter(filter("2", vec![Expression::conditions(["2"])]))
            .unwrap();

        let err = registry.delete_filter("1").unwrap_err();
        assert_eq!(err.referents(), &[Referent::Product("p-2".into())]);
        assert!(registry.delete_filter("2").is_ok());
    }

    #[test]
    fn test_delete_condition_guard() {
        let registry = registry_with_conditions();
        registry
            .save_filter(filter("1", vec![Expression::conditions(["1"])]))
            .unwrap();

        let err = registry.delete_condition("1").unwrap_err();
        assert_eq!(err.code(), "REFERENTIAL_INTEGRITY");
        assert!(registry.delete_condition("2").is_ok());
        assert_eq!(registry.condition_count(), 1);
    }

    #[test]
    fn test_delete_nonexistent() {
        let registry = FilterRegistry::new();
        assert_eq!(registry.delete_filter("x").unwrap_err().code(), "FILTER_NOT_FOUND");
        assert_eq!(
            registry.delete_condition("x").unwrap_err().code(),
            "CONDITION_NOT_FOUND"
        );
    }

    #[test]
    fn test_concurrent_saves() {
        use std::thread;

        let registry = registry_with_conditions();
        let registry_clone = registry.clone();

        let handle = thread::spawn(move || {
            for i in 0..100 {
                registry_clone
                    .save_filter(filter(&format!("f-{}", i), vec![Expression::conditions(["1"])]))
                    .unwrap();
            }
        });

        for i in 100..200 {
            registry
                .save_filter(filter(&format!("f-{}", i), vec![Expression::conditions(["2"])]))
                .unwrap();
        }

        handle.join().unwrap();

        assert_eq!(registry.len(), 200);
        assert_eq!(registry.dependents_of_condition("1", false).len(), 100);
    }
}
