//! 内容过滤引擎错误类型

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 阻止删除的引用方
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Referent {
    /// 通过 parent_filter_ids 引用的其他内容过滤器
    ContentFilter(String),
    /// 在过滤配置中引用该过滤器的产品（订阅）
    Product(String),
    /// 在 filter 字段中引用该过滤器的路由规则
    RoutingRule(String),
}

impl fmt::Display for Referent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentFilter(id) => write!(f, "content_filter:{}", id),
            Self::Product(id) => write!(f, "product:{}", id),
            Self::RoutingRule(id) => write!(f, "routing_rule:{}", id),
        }
    }
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 规则配置错误：保存、激活或编译时拒绝
    Configuration,
    /// 删除被引用阻止
    ReferentialIntegrity,
    /// 后端无法执行查询
    Backend,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("无效的操作符: {0}")]
    UnknownOperator(String),

    #[error("内容过滤器 '{0}' 至少需要一个表达式")]
    EmptyFilter(String),

    #[error("内容过滤器 '{filter_id}' 的第 {index} 个表达式为空")]
    EmptyExpression { filter_id: String, index: usize },

    #[error("过滤条件 '{condition_id}' 无效: {reason}")]
    InvalidCondition {
        condition_id: String,
        reason: String,
    },

    #[error("检测到循环引用: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("过滤条件 '{condition_id}' 无法编译为 {target} 查询: {reason}")]
    Inexpressible {
        condition_id: String,
        target: &'static str,
        reason: String,
    },

    #[error("过滤条件未找到: {0}")]
    ConditionNotFound(String),

    #[error("内容过滤器未找到: {0}")]
    FilterNotFound(String),

    #[error("{entity} 未找到: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("'{id}' 仍被引用，无法删除: {}", format_referents(referents))]
    ReferentialIntegrity { id: String, referents: Vec<Referent> },

    #[error("不支持的查询: {0}")]
    UnsupportedQuery(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

fn format_referents(referents: &[Referent]) -> String {
    referents
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl FilterError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOperator(_) => "UNKNOWN_OPERATOR",
            Self::EmptyFilter(_) => "EMPTY_FILTER",
            Self::EmptyExpression { .. } => "EMPTY_EXPRESSION",
            Self::InvalidCondition { .. } => "INVALID_CONDITION",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::Inexpressible { .. } => "INEXPRESSIBLE_CONDITION",
            Self::ConditionNotFound(_) => "CONDITION_NOT_FOUND",
            Self::FilterNotFound(_) => "FILTER_NOT_FOUND",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ReferentialIntegrity { .. } => "REFERENTIAL_INTEGRITY",
            Self::UnsupportedQuery(_) => "UNSUPPORTED_QUERY",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReferentialIntegrity { .. } => ErrorKind::ReferentialIntegrity,
            Self::UnsupportedQuery(_) => ErrorKind::Backend,
            _ => ErrorKind::Configuration,
        }
    }

    /// 删除被阻止时返回引用方列表
    pub fn referents(&self) -> &[Referent] {
        match self {
            Self::ReferentialIntegrity { referents, .. } => referents,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = FilterError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "检测到循环引用: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_referential_integrity_lists_referents() {
        let err = FilterError::ReferentialIntegrity {
            id: "1".into(),
            referents: vec![
                Referent::Product("p-1".into()),
                Referent::RoutingRule("rr-4".into()),
            ],
        };
        assert_eq!(err.kind(), ErrorKind::ReferentialIntegrity);
        assert_eq!(err.code(), "REFERENTIAL_INTEGRITY");
        assert_eq!(err.referents().len(), 2);
        assert!(err.to_string().contains("product:p-1, routing_rule:rr-4"));
    }
}
