//! 表达式评估器
//!
//! 在内存中判断单个条目是否满足内容过滤器：
//! 表达式之间为 OR，表达式内部的条件与父过滤器为 AND，父过滤器递归求值。
//! 缺失的元数据永远不满足谓词（包括 NIN）。

use crate::error::{FilterError, Result};
use crate::models::{ContentFilter, ContentItem, Expression, FilterCondition, collect_values};
use crate::operators::{Operator, case_insensitive, exact_pattern, split_values};
use crate::registry::FilterLookup;
use crate::resolver::{FieldKind, ValueType, VocabularyResolver};
use filter_shared::config::FieldLayoutConfig;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// 递归访问路径，用于循环引用检测
#[derive(Debug, Default, Clone)]
pub struct VisitPath {
    stack: Vec<String>,
}

impl VisitPath {
    /// 进入过滤器；路径上已存在同一 ID 时返回循环错误
    pub fn enter(&mut self, filter_id: &str) -> Result<()> {
        if self.stack.iter().any(|id| id == filter_id) {
            let mut path = self.stack.clone();
            path.push(filter_id.to_string());
            return Err(FilterError::CycleDetected { path });
        }
        self.stack.push(filter_id.to_string());
        Ok(())
    }

    pub fn leave(&mut self) {
        self.stack.pop();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// 数值相等比较（整数与浮点统一按 f64）
pub(crate) fn numbers_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

/// 条件评估器
///
/// 只负责操作符语义：给定一组候选值，判断谓词是否成立。
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `candidates` - 从条目中取到的所有候选值（数组已展开）
    /// * `operator` - 操作符
    /// * `value` - 条件中定义的原始值（IN/NIN 为逗号分隔列表）
    /// * `value_type` - 字段值类型，决定 IN/NIN 是否按数值比较
    pub fn evaluate(
        candidates: &[&Value],
        operator: Operator,
        value: &str,
        value_type: ValueType,
    ) -> bool {
        // 只有字符串、数值、布尔算作存在的值
        if !Self::is_present(candidates) {
            return false;
        }

        match operator {
            Operator::Like | Operator::StartsWith | Operator::EndsWith => {
                let patterns: Vec<String> = operator.pattern(value).into_iter().collect();
                Self::any_string(candidates, &patterns)
            }
            Operator::Eq => candidates.iter().any(|c| Self::eq(c, value)),
            Operator::In => Self::in_list(candidates, value, value_type),
            Operator::Nin => !Self::in_list(candidates, value, value_type),
        }
    }

    /// 候选值中是否存在标量
    pub fn is_present(candidates: &[&Value]) -> bool {
        candidates
            .iter()
            .any(|c| matches!(c, Value::String(_) | Value::Number(_) | Value::Bool(_)))
    }

    /// 字符串候选值是否命中任一忽略大小写的正则
    fn any_string(candidates: &[&Value], patterns: &[String]) -> bool {
        let matchers: Vec<Regex> = patterns
            .iter()
            .filter_map(|p| match case_insensitive(p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "无法构建匹配正则");
                    None
                }
            })
            .collect();

        candidates.iter().any(|c| match c {
            Value::String(s) => matchers.iter().any(|m| m.is_match(s)),
            _ => false,
        })
    }

    /// 相等比较：数值候选按数值比较，字符串候选精确比较
    fn eq(candidate: &Value, expected: &str) -> bool {
        match candidate {
            Value::String(s) => s == expected,
            Value::Number(n) => match (n.as_f64(), expected.trim().parse::<f64>()) {
                (Some(actual), Ok(expected)) => numbers_equal(actual, expected),
                _ => false,
            },
            _ => false,
        }
    }

    /// 列表包含检查
    fn in_list(candidates: &[&Value], value: &str, value_type: ValueType) -> bool {
        let entries = split_values(value);

        match value_type {
            ValueType::Number => {
                let numbers: Vec<f64> = entries.iter().filter_map(|e| e.parse().ok()).collect();
                candidates.iter().any(|c| match c.as_f64() {
                    Some(actual) if c.is_number() => {
                        numbers.iter().any(|n| numbers_equal(actual, *n))
                    }
                    _ => false,
                })
            }
            ValueType::Text => {
                let patterns: Vec<String> = entries.iter().map(|e| exact_pattern(e)).collect();
                Self::any_string(candidates, &patterns)
            }
        }
    }
}

/// 表达式评估器
pub struct ExpressionEvaluator<'a> {
    lookup: &'a dyn FilterLookup,
    resolver: &'a dyn VocabularyResolver,
    layout: &'a FieldLayoutConfig,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(
        lookup: &'a dyn FilterLookup,
        resolver: &'a dyn VocabularyResolver,
        layout: &'a FieldLayoutConfig,
    ) -> Self {
        Self {
            lookup,
            resolver,
            layout,
        }
    }

    /// 判断条目是否满足过滤器；`None` 表示无过滤器，恒为 true
    pub fn matches(&self, rule: Option<&ContentFilter>, item: &ContentItem) -> Result<bool> {
        let Some(rule) = rule else {
            return Ok(true);
        };

        let mut path = VisitPath::default();
        self.matches_filter(rule, item, &mut path)
    }

    fn matches_filter(
        &self,
        rule: &ContentFilter,
        item: &ContentItem,
        path: &mut VisitPath,
    ) -> Result<bool> {
        path.enter(&rule.id)?;

        let mut matched = false;
        for expression in &rule.expressions {
            if self.matches_expression(expression, item, path)? {
                matched = true;
                break;
            }
        }

        path.leave();
        Ok(matched)
    }

    /// 表达式内所有条件和父过滤器都必须满足（短路求值）
    fn matches_expression(
        &self,
        expression: &Expression,
        item: &ContentItem,
        path: &mut VisitPath,
    ) -> Result<bool> {
        for condition_id in &expression.condition_ids {
            let condition = self
                .lookup
                .condition(condition_id)
                .ok_or_else(|| FilterError::ConditionNotFound(condition_id.clone()))?;

            if !self.evaluate(&condition, item) {
                return Ok(false);
            }
        }

        for parent_id in &expression.parent_filter_ids {
            let parent = self
                .lookup
                .filter(parent_id)
                .ok_or_else(|| FilterError::FilterNotFound(parent_id.clone()))?;

            if !self.matches_filter(&parent, item, path)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// 评估单个条件
    pub fn evaluate(&self, condition: &FilterCondition, item: &ContentItem) -> bool {
        let kind = self.resolver.resolve(&condition.field);

        let (candidates, value_type) = match &kind {
            FieldKind::Plain { path, value_type } => (item.values_at(path), *value_type),
            FieldKind::CustomText { key } => {
                (item.values_at(&self.layout.custom_path(key)), ValueType::Text)
            }
            FieldKind::Vocabulary { scheme } => (self.vocabulary_codes(item, scheme), ValueType::Text),
        };

        if !ConditionEvaluator::is_present(&candidates) {
            debug!(
                condition_id = %condition.id,
                field = %condition.field,
                item_id = ?item.id(),
                "字段缺失，条件不满足"
            );
            return false;
        }

        ConditionEvaluator::evaluate(&candidates, condition.operator, &condition.value, value_type)
    }

    /// 收集标签数组中属于该词表的所有元素编码
    fn vocabulary_codes<'i>(&self, item: &'i ContentItem, scheme: &str) -> Vec<&'i Value> {
        let Some(Value::Array(entries)) = item.get_field(&self.layout.tag_array_field) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter(|entry| {
                entry.get(&self.layout.tag_scheme_key).and_then(Value::as_str) == Some(scheme)
            })
            .flat_map(|entry| collect_values(entry, &self.layout.tag_code_key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FilterRegistry;
    use crate::resolver::{MemoryVocabularyResolver, MockVocabularyResolver, Vocabulary};
    use serde_json::json;

    fn eval(candidate: Value, operator: Operator, value: &str, value_type: ValueType) -> bool {
        ConditionEvaluator::evaluate(&[&candidate], operator, value, value_type)
    }

    #[test]
    fn test_like_is_case_insensitive_substring() {
        assert!(eval(json!("story"), Operator::Like, "TOR", ValueType::Text));
        assert!(eval(json!("prtorque"), Operator::Like, "tor", ValueType::Text));
        assert!(!eval(json!("headline"), Operator::Like, "tor", ValueType::Text));
    }

    #[test]
    fn test_prefix_and_suffix() {
        assert!(eval(json!("Story"), Operator::StartsWith, "sto", ValueType::Text));
        assert!(!eval(json!("creator"), Operator::StartsWith, "sto", ValueType::Text));
        assert!(eval(json!("creaTOR"), Operator::EndsWith, "tor", ValueType::Text));
        assert!(!eval(json!("story"), Operator::EndsWith, "tor", ValueType::Text));
    }

    #[test]
    fn test_pattern_operators_ignore_numbers() {
        assert!(!eval(json!(123), Operator::Like, "2", ValueType::Text));
    }

    #[test]
    fn test_eq_is_type_tolerant() {
        assert!(eval(json!(2), Operator::Eq, "2", ValueType::Number));
        assert!(eval(json!(2.0), Operator::Eq, "2", ValueType::Text));
        assert!(eval(json!("my text"), Operator::Eq, "my text", ValueType::Text));
        assert!(!eval(json!("My Text"), Operator::Eq, "my text", ValueType::Text));
    }

    #[test]
    fn test_in_numeric_and_text() {
        assert!(eval(json!(3), Operator::In, "2,3,4", ValueType::Number));
        assert!(!eval(json!(9), Operator::In, "2,3,4", ValueType::Number));
        // 数值字段上的字符串不参与数值比较
        assert!(!eval(json!("3"), Operator::In, "2,3,4", ValueType::Number));
        assert!(eval(json!("bin/alg"), Operator::In, "BIN/ALG, BIN/ECO", ValueType::Text));
    }

    #[test]
    fn test_text_matching_uses_simple_case_folding() {
        assert!(eval(json!("Σ"), Operator::Like, "ς", ValueType::Text));
        assert!(eval(json!("σ"), Operator::In, "ς", ValueType::Text));
        assert!(!eval(json!("İstanbul"), Operator::StartsWith, "i", ValueType::Text));
        assert!(!eval(json!("İstanbul"), Operator::Like, "i", ValueType::Text));
        assert!(eval(json!("İstanbul"), Operator::StartsWith, "İ", ValueType::Text));
    }

    #[test]
    fn test_pattern_value_is_literal() {
        assert!(eval(json!("a.b*c?"), Operator::Like, "b*c?", ValueType::Text));
        assert!(!eval(json!("axb"), Operator::Like, "a.b", ValueType::Text));
        assert!(!eval(json!("creator\n"), Operator::EndsWith, "tor", ValueType::Text));
    }

    #[test]
    fn test_nin_requires_presence() {
        assert!(eval(json!(9), Operator::Nin, "2,3", ValueType::Number));
        assert!(!eval(json!(3), Operator::Nin, "2,3", ValueType::Number));
        assert!(!ConditionEvaluator::evaluate(&[], Operator::Nin, "2,3", ValueType::Number));
        assert!(!eval(Value::Null, Operator::Nin, "2,3", ValueType::Number));
    }

    #[test]
    fn test_array_candidates_are_existential() {
        let a = json!("alpha");
        let b = json!("beta");
        assert!(ConditionEvaluator::evaluate(&[&a, &b], Operator::In, "beta", ValueType::Text));
        assert!(!ConditionEvaluator::evaluate(&[&a, &b], Operator::Nin, "beta", ValueType::Text));
    }

    #[test]
    fn test_none_rule_always_matches() {
        let registry = FilterRegistry::new();
        let resolver = MemoryVocabularyResolver::default();
        let layout = FieldLayoutConfig::default();
        let evaluator = ExpressionEvaluator::new(&registry, &resolver, &layout);

        let item = ContentItem::new(json!({"_id": "6"}));
        assert!(evaluator.matches(None, &item).unwrap());
    }

    #[test]
    fn test_vocabulary_scoping_within_one_entry() {
        let mut resolver = MockVocabularyResolver::new();
        resolver.expect_resolve().returning(|_| FieldKind::Vocabulary {
            scheme: "S1".to_string(),
        });

        let registry = FilterRegistry::new();
        let layout = FieldLayoutConfig::default();
        let evaluator = ExpressionEvaluator::new(&registry, &resolver, &layout);

        let item = ContentItem::new(json!({
            "_id": "x",
            "subject": [
                {"scheme": "S1", "qcode": "X"},
                {"scheme": "S2", "qcode": "Y"}
            ]
        }));

        let wants_y = FilterCondition::new("c", "topic", Operator::Eq, "Y");
        let wants_x = FilterCondition::new("c", "topic", Operator::Eq, "X");
        assert!(!evaluator.evaluate(&wants_y, &item));
        assert!(evaluator.evaluate(&wants_x, &item));
    }

    #[test]
    fn test_custom_text_field() {
        let resolver = MemoryVocabularyResolver::with_vocabularies(
            FieldLayoutConfig::default(),
            vec![Vocabulary::custom_text("custom_text")],
        );
        let registry = FilterRegistry::new();
        let layout = FieldLayoutConfig::default();
        let evaluator = ExpressionEvaluator::new(&registry, &resolver, &layout);

        let item = ContentItem::new(json!({"_id": "8", "extra": {"custom_text": "my text"}}));
        let cond = FilterCondition::new("7", "custom_text", Operator::Eq, "my text");
        assert!(evaluator.evaluate(&cond, &item));

        let missing = ContentItem::new(json!({"_id": "1", "headline": "my text"}));
        assert!(!evaluator.evaluate(&cond, &missing));
    }

    #[test]
    fn test_missing_condition_reference_is_error() {
        let registry = FilterRegistry::new();
        let resolver = MemoryVocabularyResolver::default();
        let layout = FieldLayoutConfig::default();
        let evaluator = ExpressionEvaluator::new(&registry, &resolver, &layout);

        let rule = ContentFilter::with_id("adhoc", "adhoc", vec![Expression::conditions(["404"])]);
        let item = ContentItem::new(json!({"_id": "1"}));
        let err = evaluator.matches(Some(&rule), &item).unwrap_err();
        assert_eq!(err.code(), "CONDITION_NOT_FOUND");
    }

    #[test]
    fn test_visit_path_detects_reentry() {
        let mut path = VisitPath::default();
        path.enter("a").unwrap();
        path.enter("b").unwrap();
        let err = path.enter("a").unwrap_err();
        assert_eq!(err.to_string(), "检测到循环引用: a -> b -> a");

        path.leave();
        assert_eq!(path.depth(), 1);
    }
}
