//! 条件使用情况
//!
//! 给定一个字段/操作符/值，判断已保存的条件是否可能与它同时命中同一条目，
//! 引擎据此找出受影响的过滤器、产品和订阅者。

use crate::evaluator::numbers_equal;
use crate::models::FilterCondition;
use crate::operators::{Operator, case_insensitive, exact_pattern, split_values};
use crate::resolver::ValueType;

/// 两个同字段条件的取值是否有交集
///
/// - 模式类操作符只与同一操作符、同一值（忽略大小写）的条件相关
/// - IN/EQ 之间比较值集合是否相交
/// - IN 与 NIN 之间看 IN 一侧是否有值落在 NIN 列表之外
/// - 两个 NIN 总是相关
pub fn overlaps(query: &FilterCondition, stored: &FilterCondition, value_type: ValueType) -> bool {
    if query.field != stored.field {
        return false;
    }

    if query.operator.is_pattern() || stored.operator.is_pattern() {
        return query.operator == stored.operator
            && same_value(&query.value, &stored.value, ValueType::Text);
    }

    let wanted = entries(query);
    let existing = entries(stored);

    match (query.operator == Operator::Nin, stored.operator == Operator::Nin) {
        (false, false) => wanted.iter().any(|w| contains(&existing, w, value_type)),
        (false, true) => wanted.iter().any(|w| !contains(&existing, w, value_type)),
        (true, false) => existing.iter().any(|e| !contains(&wanted, e, value_type)),
        (true, true) => true,
    }
}

fn entries(condition: &FilterCondition) -> Vec<&str> {
    if condition.operator.is_list() {
        split_values(&condition.value)
    } else {
        vec![condition.value.as_str()]
    }
}

fn contains(list: &[&str], value: &str, value_type: ValueType) -> bool {
    list.iter().any(|entry| same_value(entry, value, value_type))
}

/// 数值字段按数值相等，文本按评估器的忽略大小写规则整串相等
fn same_value(a: &str, b: &str, value_type: ValueType) -> bool {
    match value_type {
        ValueType::Number => match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            (Ok(x), Ok(y)) => numbers_equal(x, y),
            _ => false,
        },
        ValueType::Text => case_insensitive(&exact_pattern(a)).is_ok_and(|r| r.is_match(b)),
    }
}
