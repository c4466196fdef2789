//! 过滤条件操作符定义
//!
//! 操作符表是唯一的：保存时的校验、评估器和两个编译器都通过这里解析操作符。

use crate::error::FilterError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    // 字符串匹配（不区分大小写）
    Like,
    StartsWith,
    EndsWith,

    // 相等
    Eq,

    // 集合（值为逗号分隔列表）
    In,
    Nin,
}

impl Operator {
    pub const ALL: [Operator; 6] = [
        Self::Like,
        Self::StartsWith,
        Self::EndsWith,
        Self::Eq,
        Self::In,
        Self::Nin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Eq => "eq",
            Self::In => "in",
            Self::Nin => "nin",
        }
    }

    /// 是否为模式匹配类操作符
    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Like | Self::StartsWith | Self::EndsWith)
    }

    /// 值是否为逗号分隔列表
    pub fn is_list(&self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }

    /// 模式类操作符对应的正则（值已转义），非模式操作符返回 `None`
    ///
    /// 评估器直接使用该正则，文档库谓词以 `$regex` 原样下发，
    /// 结尾锚点用 `\z`，不接受末尾换行。
    pub fn pattern(&self, value: &str) -> Option<String> {
        if !self.is_pattern() {
            return None;
        }

        let escaped = regex::escape(value);
        Some(match self {
            Self::StartsWith => format!("^{}", escaped),
            Self::EndsWith => format!("{}\\z", escaped),
            _ => escaped,
        })
    }
}

/// 整串相等的正则（IN/NIN 文本项、忽略大小写的 term）
pub fn exact_pattern(value: &str) -> String {
    format!("^{}\\z", regex::escape(value))
}

/// 忽略大小写的匹配器
///
/// 评估器与两个内存后端共用，大小写折叠规则（Unicode 简单折叠）因此一致。
pub fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| FilterError::UnknownOperator(s.to_string()))
    }
}

impl TryFrom<String> for Operator {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

/// 拆分 IN/NIN 的逗号分隔值，去除空白和空项
pub fn split_values(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect()
}
