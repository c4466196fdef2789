//! 规则编译器
//!
//! 将内容过滤器编译为外部查询：文档库谓词（store）与搜索引擎查询（search）。
//! 两个目标共用同一套规则遍历，只在叶子条件与逻辑组合的表示上不同。
//! 编译结果与内存评估器对同一条目给出相同的判定。

pub mod search;
pub mod store;

use crate::error::{FilterError, Result};
use crate::evaluator::VisitPath;
use crate::models::{ContentFilter, Expression, FilterCondition};
use crate::registry::FilterLookup;
use crate::resolver::{FieldKind, ValueType, VocabularyResolver};
use filter_shared::config::FieldLayoutConfig;
use serde_json::{Number, Value, json};
use tracing::debug;

pub use search::{SearchQuery, SearchTarget};
pub use store::{StorePredicate, StoreTarget};

/// 查询目标
pub trait QueryTarget {
    /// 编译产物
    type Output: From<Value>;

    /// 目标名称，用于错误信息与日志
    const NAME: &'static str;

    /// 无过滤器时的查询（匹配全部）
    fn match_all(&self) -> Value;

    /// 合取
    fn all_of(&self, clauses: Vec<Value>) -> Value;

    /// 析取
    fn any_of(&self, clauses: Vec<Value>) -> Value;

    /// 编译单个条件
    fn condition(
        &self,
        condition: &FilterCondition,
        kind: &FieldKind,
        layout: &FieldLayoutConfig,
    ) -> Result<Value>;
}

/// 规则编译器
pub struct RuleCompiler<'a, T: QueryTarget> {
    target: T,
    lookup: &'a dyn FilterLookup,
    resolver: &'a dyn VocabularyResolver,
    layout: &'a FieldLayoutConfig,
}

/// 文档库谓词编译器
pub type StoreCompiler<'a> = RuleCompiler<'a, StoreTarget>;

/// 搜索查询编译器
pub type SearchCompiler<'a> = RuleCompiler<'a, SearchTarget>;

impl<'a, T: QueryTarget> RuleCompiler<'a, T> {
    pub fn new(
        target: T,
        lookup: &'a dyn FilterLookup,
        resolver: &'a dyn VocabularyResolver,
        layout: &'a FieldLayoutConfig,
    ) -> Self {
        Self {
            target,
            lookup,
            resolver,
            layout,
        }
    }

    /// 编译过滤器；`None` 编译为匹配全部
    pub fn compile(&self, rule: Option<&ContentFilter>) -> Result<T::Output> {
        let query = match rule {
            Some(rule) => {
                let mut path = VisitPath::default();
                let query = self.compile_filter(rule, &mut path)?;
                debug!(filter_id = %rule.id, target = T::NAME, "过滤器已编译");
                query
            }
            None => self.target.match_all(),
        };
        Ok(T::Output::from(query))
    }

    fn compile_filter(&self, rule: &ContentFilter, path: &mut VisitPath) -> Result<Value> {
        if rule.expressions.is_empty() {
            return Err(FilterError::EmptyFilter(rule.id.clone()));
        }

        path.enter(&rule.id)?;
        let branches = rule
            .expressions
            .iter()
            .enumerate()
            .map(|(index, expression)| self.compile_expression(rule, index, expression, path))
            .collect::<Result<Vec<_>>>()?;
        path.leave();

        Ok(self.target.any_of(branches))
    }

    fn compile_expression(
        &self,
        rule: &ContentFilter,
        index: usize,
        expression: &Expression,
        path: &mut VisitPath,
    ) -> Result<Value> {
        if expression.is_empty() {
            return Err(FilterError::EmptyExpression {
                filter_id: rule.id.clone(),
                index,
            });
        }

        let mut clauses = Vec::with_capacity(
            expression.condition_ids.len() + expression.parent_filter_ids.len(),
        );

        for condition_id in &expression.condition_ids {
            let condition = self
                .lookup
                .condition(condition_id)
                .ok_or_else(|| FilterError::ConditionNotFound(condition_id.clone()))?;
            clauses.push(self.compile_condition(&condition)?);
        }

        for parent_id in &expression.parent_filter_ids {
            let parent = self
                .lookup
                .filter(parent_id)
                .ok_or_else(|| FilterError::FilterNotFound(parent_id.clone()))?;
            clauses.push(self.compile_filter(&parent, path)?);
        }

        Ok(self.target.all_of(clauses))
    }

    /// 编译单个条件（字段类型在此动态解析）
    pub fn compile_condition(&self, condition: &FilterCondition) -> Result<Value> {
        let kind = self.resolver.resolve(&condition.field);
        self.target.condition(condition, &kind, self.layout)
    }
}

/// 检查条件能否同时编译为两个查询目标，用于保存前的激活检查
pub fn check_condition(
    condition: &FilterCondition,
    resolver: &dyn VocabularyResolver,
    layout: &FieldLayoutConfig,
) -> Result<()> {
    let kind = resolver.resolve(&condition.field);
    StoreTarget.condition(condition, &kind, layout)?;
    SearchTarget.condition(condition, &kind, layout)?;
    Ok(())
}

/// 普通字段与自定义文本字段在条目上的路径；词表字段返回 None
pub(crate) fn field_path(kind: &FieldKind, layout: &FieldLayoutConfig) -> Option<(String, ValueType)> {
    match kind {
        FieldKind::Plain { path, value_type } => Some((path.clone(), *value_type)),
        FieldKind::CustomText { key } => Some((layout.custom_path(key), ValueType::Text)),
        FieldKind::Vocabulary { .. } => None,
    }
}

/// 解析数值，整数保持整数表示
pub(crate) fn parse_number(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Some(json!(i));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// 校验条件值并返回 IN/NIN 的值列表
///
/// 数值字段的列表项必须全部可解析为数值，否则该条件无法表达为外部查询。
pub(crate) fn list_entries<'c>(
    condition: &'c FilterCondition,
    value_type: ValueType,
    target: &'static str,
) -> Result<Vec<&'c str>> {
    let entries = condition.values();
    if entries.is_empty() {
        return Err(FilterError::InvalidCondition {
            condition_id: condition.id.clone(),
            reason: "值列表不能为空".to_string(),
        });
    }

    if value_type == ValueType::Number {
        if let Some(bad) = entries.iter().find(|e| parse_number(e).is_none()) {
            return Err(FilterError::Inexpressible {
                condition_id: condition.id.clone(),
                target,
                reason: format!("数值字段 '{}' 的值 '{}' 不是数字", condition.field, bad),
            });
        }
    }

    Ok(entries)
}

/// 模式匹配类条件的值不能为空
pub(crate) fn pattern_value(condition: &FilterCondition) -> Result<&str> {
    if condition.value.is_empty() {
        return Err(FilterError::InvalidCondition {
            condition_id: condition.id.clone(),
            reason: "值不能为空".to_string(),
        });
    }
    Ok(&condition.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Operator;
    use crate::registry::FilterRegistry;
    use crate::resolver::MemoryVocabularyResolver;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("2"), Some(json!(2)));
        assert_eq!(parse_number(" 2.5 "), Some(json!(2.5)));
        assert_eq!(parse_number("two"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn test_numeric_list_must_parse() {
        let cond = FilterCondition::new("c", "urgency", Operator::In, "1,high");
        let err = list_entries(&cond, ValueType::Number, "store").unwrap_err();
        assert_eq!(err.code(), "INEXPRESSIBLE_CONDITION");

        assert_eq!(list_entries(&cond, ValueType::Text, "store").unwrap(), vec!["1", "high"]);
    }

    #[test]
    fn test_check_condition() {
        let resolver = MemoryVocabularyResolver::default();
        let layout = FieldLayoutConfig::default();

        let ok = FilterCondition::new("c", "urgency", Operator::In, "1,2");
        assert!(check_condition(&ok, &resolver, &layout).is_ok());

        let bad = FilterCondition::new("c", "urgency", Operator::Nin, "urgent");
        assert!(check_condition(&bad, &resolver, &layout).is_err());
    }

    #[test]
    fn test_empty_structures_rejected() {
        let registry = FilterRegistry::new();
        let resolver = MemoryVocabularyResolver::default();
        let layout = FieldLayoutConfig::default();
        let compiler = StoreCompiler::new(StoreTarget, &registry, &resolver, &layout);

        let empty = ContentFilter::with_id("e", "empty", vec![]);
        assert_eq!(compiler.compile(Some(&empty)).unwrap_err().code(), "EMPTY_FILTER");

        let hollow = ContentFilter::with_id("h", "hollow", vec![Expression::new()]);
        assert_eq!(
            compiler.compile(Some(&hollow)).unwrap_err().code(),
            "EMPTY_EXPRESSION"
        );
    }
}
