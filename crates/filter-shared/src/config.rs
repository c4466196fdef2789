//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 内容条目字段布局
///
/// 描述条目中标签数组、自定义属性等字段的位置，
/// 评估器和两个查询编译器共用同一份布局，保证三者读取的是同一批字段。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldLayoutConfig {
    /// 标签数组字段（每个元素包含 scheme 和 code）
    pub tag_array_field: String,
    /// 标签元素中的词表键
    pub tag_scheme_key: String,
    /// 标签元素中的编码键
    pub tag_code_key: String,
    /// 自由文本自定义属性所在的对象字段
    pub custom_field: String,
    /// 按数值比较的普通字段
    pub numeric_fields: Vec<String>,
}

impl Default for FieldLayoutConfig {
    fn default() -> Self {
        Self {
            tag_array_field: "subject".to_string(),
            tag_scheme_key: "scheme".to_string(),
            tag_code_key: "qcode".to_string(),
            custom_field: "extra".to_string(),
            numeric_fields: vec!["urgency".to_string(), "priority".to_string()],
        }
    }
}

impl FieldLayoutConfig {
    /// 判断普通字段是否按数值处理
    pub fn is_numeric(&self, field: &str) -> bool {
        self.numeric_fields.iter().any(|f| f == field)
    }

    /// 标签元素内 scheme 的完整路径（如 subject.scheme）
    pub fn tag_scheme_path(&self) -> String {
        format!("{}.{}", self.tag_array_field, self.tag_scheme_key)
    }

    /// 标签元素内 code 的完整路径（如 subject.qcode）
    pub fn tag_code_path(&self) -> String {
        format!("{}.{}", self.tag_array_field, self.tag_code_key)
    }

    /// 自定义属性的完整路径（如 extra.custom_text）
    pub fn custom_path(&self, key: &str) -> String {
        format!("{}.{}", self.custom_field, key)
    }
}

/// 匹配缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// 缓存条目上限，达到上限时整体清空
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 100_000,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub fields: FieldLayoutConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CONTENT_FILTER_ 前缀，如 CONTENT_FILTER_CACHE__MAX_ENTRIES -> cache.max_entries）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env =
            std::env::var("CONTENT_FILTER_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 字段名本身含下划线，层级分隔使用双下划线
            .add_source(
                Environment::with_prefix("CONTENT_FILTER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("fields.numeric_fields")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
