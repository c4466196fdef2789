//! 内容过滤引擎
//!
//! 用可复用的过滤规则判断内容条目是否满足条件，支持：
//! - 内存中逐条评估（带匹配缓存）
//! - 编译为文档库谓词与搜索查询，三者判定一致
//! - 依赖索引驱动的删除保护与缓存失效
//! - 产品、订阅者和路由规则上的分发判定

pub mod backend;
pub mod bundle;
pub mod cache;
pub mod compiler;
pub mod dependency;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod operators;
pub mod registry;
pub mod resolver;
pub mod usage;

pub use backend::{
    ContentRepository, ItemCollection, MemoryContentStore, MemorySearchIndex, QueryResult,
    SearchBackend,
};
pub use bundle::Bundle;
pub use cache::{CacheStats, MatchCache};
pub use compiler::{SearchQuery, StorePredicate};
pub use dependency::DependencyIndex;
pub use distribution::{
    DistributionRegistry, FilterType, Product, ProductFilter, RoutingRule, Subscriber,
};
pub use engine::{BatchScope, ContentFilterEngine, describe_metrics};
pub use error::{ErrorKind, FilterError, Referent, Result};
pub use evaluator::ExpressionEvaluator;
pub use models::{ContentFilter, ContentItem, Expression, FilterCondition};
pub use operators::Operator;
pub use registry::{FilterLookup, FilterRegistry, ReferentRegistry};
pub use resolver::{
    FieldKind, MemoryVocabularyResolver, ValueType, Vocabulary, VocabularyItem,
    VocabularyResolver,
};
