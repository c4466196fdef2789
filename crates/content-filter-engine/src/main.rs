//! 内容过滤命令行工具
//!
//! 装载规则包，输出编译后的查询、逐条判定结果或依赖关系。
//!
//! ```bash
//! content-filter compile -b rules.json -f 4
//! content-filter evaluate -b rules.json
//! content-filter dependents -b rules.json --condition 1 --transitive
//! content-filter subscribers -b rules.json --field urgency --operator nin --value 3
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use content_filter::{
    Bundle, ContentFilterEngine, ContentItem, FilterCondition, ItemCollection,
    MemoryContentStore, MemorySearchIndex, Operator, describe_metrics,
};
use filter_shared::config::AppConfig;
use filter_shared::observability;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 内容过滤命令行工具
#[derive(Parser, Debug)]
#[command(name = "content-filter")]
#[command(version, about = "内容过滤规则编译与评估工具")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 输出过滤器编译后的文档库谓词与搜索查询
    Compile {
        /// 规则包 JSON 文件
        #[arg(short, long)]
        bundle: PathBuf,

        /// 过滤器 ID；不指定时编译全部
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// 对规则包中的条目逐条判定，并与两个内存后端的结果对照
    Evaluate {
        #[arg(short, long)]
        bundle: PathBuf,

        #[arg(short, long)]
        filter: Option<String>,

        /// 订阅者 ID；指定时输出该订阅者是否接收每个条目
        #[arg(short, long)]
        subscriber: Option<String>,
    },

    /// 查询依赖某个条件或过滤器的过滤器
    Dependents {
        #[arg(short, long)]
        bundle: PathBuf,

        #[arg(long, conflicts_with = "filter")]
        condition: Option<String>,

        #[arg(long)]
        filter: Option<String>,

        /// 包含间接依赖
        #[arg(short, long)]
        transitive: bool,
    },

    /// 查询会受某个条件影响的订阅者
    Subscribers {
        #[arg(short, long)]
        bundle: PathBuf,

        #[arg(long)]
        field: String,

        #[arg(long)]
        operator: Operator,

        #[arg(long)]
        value: String,
    },
}

fn load(path: &Path, config: &AppConfig) -> Result<(ContentFilterEngine, Vec<ContentItem>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取规则包: {}", path.display()))?;
    let bundle = Bundle::from_json(&raw).context("规则包格式错误")?;
    let items = bundle.items();
    let engine = bundle.into_engine(config).context("规则包装载失败")?;
    Ok((engine, items))
}

fn selected_filters(engine: &ContentFilterEngine, filter: Option<String>) -> Result<Vec<String>> {
    match filter {
        Some(id) => {
            if engine.get_filter(&id).is_none() {
                bail!("过滤器不存在: {}", id);
            }
            Ok(vec![id])
        }
        None => {
            let mut ids = engine.registry().list_ids();
            ids.sort();
            Ok(ids)
        }
    }
}

fn run_compile(config: &AppConfig, bundle: PathBuf, filter: Option<String>) -> Result<()> {
    let (engine, _) = load(&bundle, config)?;

    for id in selected_filters(&engine, filter)? {
        let rule = engine.get_filter(&id);
        let output = json!({
            "filter": id,
            "store": engine.compile_store(rule.as_deref())?,
            "search": engine.compile_search(rule.as_deref())?,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

fn run_evaluate(
    config: &AppConfig,
    bundle: PathBuf,
    filter: Option<String>,
    subscriber: Option<String>,
) -> Result<()> {
    let (engine, items) = load(&bundle, config)?;

    let collection = ItemCollection::new();
    for item in &items {
        collection.insert(item.clone());
    }
    let store = MemoryContentStore::with_collection(collection.clone());
    let search = MemorySearchIndex::with_collection(collection);

    let scope = engine.batch();
    let mut disagreements = 0usize;

    for id in selected_filters(&engine, filter)? {
        let rule = engine.get_filter(&id);
        let in_store: BTreeSet<String> = engine.query_store(rule.as_deref(), &store)?.ids().into_iter().collect();
        let in_search: BTreeSet<String> = engine.query_search(rule.as_deref(), &search)?.ids().into_iter().collect();

        let mut matched = Vec::new();
        for item in &items {
            let Some(item_id) = item.id() else {
                continue;
            };
            let verdict = scope.matches(rule.as_deref(), item)?;
            if verdict {
                matched.push(item_id.clone());
            }
            if verdict != in_store.contains(&item_id) || verdict != in_search.contains(&item_id) {
                disagreements += 1;
                warn!(filter_id = %id, item_id = %item_id, "评估器与查询结果不一致");
            }
        }

        println!(
            "{}",
            serde_json::to_string(&json!({ "filter": id, "matched": matched }))?
        );
    }

    if let Some(subscriber_id) = subscriber {
        for item in &items {
            let receives = scope.subscriber_receives(&subscriber_id, item)?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "subscriber": subscriber_id,
                    "item": item.id(),
                    "receives": receives,
                }))?
            );
        }
    }

    info!(cached = scope.cached(), disagreements, "评估完成");
    if disagreements > 0 {
        bail!("{} 处判定不一致", disagreements);
    }
    Ok(())
}

fn run_dependents(
    config: &AppConfig,
    bundle: PathBuf,
    condition: Option<String>,
    filter: Option<String>,
    transitive: bool,
) -> Result<()> {
    let (engine, _) = load(&bundle, config)?;

    let dependents = match (condition, filter) {
        (Some(id), _) => engine.dependents_of_condition(&id, transitive),
        (None, Some(id)) => engine.dependents_of_filter(&id, transitive),
        (None, None) => bail!("需要指定 --condition 或 --filter"),
    };

    println!("{}", serde_json::to_string(&dependents)?);
    Ok(())
}

fn run_subscribers(
    config: &AppConfig,
    bundle: PathBuf,
    field: String,
    operator: Operator,
    value: String,
) -> Result<()> {
    let (engine, _) = load(&bundle, config)?;
    let condition = FilterCondition::new("", field, operator, value);
    let subscribers = engine.subscribers_by_condition(&condition)?;
    println!("{}", serde_json::to_string(&subscribers)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load("content-filter").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    observability::init(&config.service_name, &config.observability)?;
    describe_metrics();

    match cli.command {
        Commands::Compile { bundle, filter } => run_compile(&config, bundle, filter),
        Commands::Evaluate {
            bundle,
            filter,
            subscriber,
        } => run_evaluate(&config, bundle, filter, subscriber),
        Commands::Dependents {
            bundle,
            condition,
            filter,
            transitive,
        } => run_dependents(&config, bundle, condition, filter, transitive),
        Commands::Subscribers {
            bundle,
            field,
            operator,
            value,
        } => run_subscribers(&config, bundle, field, operator, value),
    }
}
