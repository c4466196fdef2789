//! 依赖索引
//!
//! 条件与过滤器之间的反向引用图。保存时增量维护，
//! 查询直接或间接依赖，并在保存前检测父过滤器引用是否成环。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::models::ContentFilter;

/// 依赖索引
///
/// 维护两张反向映射，用于删除保护与定向缓存失效：
/// - condition_id -> 直接使用该条件的过滤器
/// - content_filter_id -> 通过 parent_filter_ids 直接引用该过滤器的过滤器
#[derive(Debug, Default, Clone)]
pub struct DependencyIndex {
    condition_dependents: HashMap<String, HashSet<String>>,
    filter_dependents: HashMap<String, HashSet<String>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从一组过滤器构建索引
    pub fn from_filters<'a, I>(filters: I) -> Self
    where
        I: IntoIterator<Item = &'a ContentFilter>,
    {
        let mut index = Self::default();
        for filter in filters {
            index.register(filter);
        }
        index
    }

    /// 登记过滤器的所有直接引用
    pub fn register(&mut self, rule: &ContentFilter) {
        for condition_id in rule.condition_ids() {
            self.condition_dependents
                .entry(condition_id.to_string())
                .or_default()
                .insert(rule.id.clone());
        }
        for parent_id in rule.parent_filter_ids() {
            self.filter_dependents
                .entry(parent_id.to_string())
                .or_default()
                .insert(rule.id.clone());
        }
    }

    /// 移除过滤器的所有直接引用
    pub fn unregister(&mut self, rule: &ContentFilter) {
        for condition_id in rule.condition_ids() {
            Self::remove_edge(&mut self.condition_dependents, condition_id, &rule.id);
        }
        for parent_id in rule.parent_filter_ids() {
            Self::remove_edge(&mut self.filter_dependents, parent_id, &rule.id);
        }
    }

    /// 更新过滤器：对比新旧引用集合，只增删差异部分
    pub fn replace(&mut self, old: &ContentFilter, new: &ContentFilter) {
        let old_conditions = old.condition_ids();
        let new_conditions = new.condition_ids();
        for removed in old_conditions.difference(&new_conditions) {
            Self::remove_edge(&mut self.condition_dependents, removed, &old.id);
        }
        for added in new_conditions.difference(&old_conditions) {
            self.condition_dependents
                .entry(added.to_string())
                .or_default()
                .insert(new.id.clone());
        }

        let old_parents = old.parent_filter_ids();
        let new_parents = new.parent_filter_ids();
        for removed in old_parents.difference(&new_parents) {
            Self::remove_edge(&mut self.filter_dependents, removed, &old.id);
        }
        for added in new_parents.difference(&old_parents) {
            self.filter_dependents
                .entry(added.to_string())
                .or_default()
                .insert(new.id.clone());
        }
    }

    fn remove_edge(map: &mut HashMap<String, HashSet<String>>, key: &str, dependent: &str) {
        if let Some(set) = map.get_mut(key) {
            set.remove(dependent);
            if set.is_empty() {
                map.remove(key);
            }
        }
    }

    /// 使用该条件的过滤器；transitive 时包含所有间接引用它们的过滤器
    pub fn dependents_of_condition(&self, condition_id: &str, transitive: bool) -> BTreeSet<String> {
        let direct: BTreeSet<String> = self
            .condition_dependents
            .get(condition_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        if !transitive {
            return direct;
        }

        let mut all = direct.clone();
        for filter_id in &direct {
            all.extend(self.dependents_of_filter(filter_id, true));
        }
        all
    }

    /// 引用该过滤器的过滤器；transitive 时按广度优先展开，遇到环也会终止
    pub fn dependents_of_filter(&self, filter_id: &str, transitive: bool) -> BTreeSet<String> {
        let direct = |id: &str| -> Vec<String> {
            self.filter_dependents
                .get(id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        if !transitive {
            return direct(filter_id).into_iter().collect();
        }

        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = direct(filter_id).into();
        while let Some(id) = queue.pop_front() {
            if id == filter_id || !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(direct(&id));
        }
        seen
    }

    /// 判断让 filter_id 引用 parent_ids 是否会形成环
    ///
    /// 若某个父过滤器本身就是 filter_id，或已（间接）依赖 filter_id，则会成环。
    pub fn would_create_cycle<'a, I>(&self, filter_id: &str, parent_ids: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let dependents = self.dependents_of_filter(filter_id, true);
        parent_ids
            .into_iter()
            .find(|parent| *parent == filter_id || dependents.contains(*parent))
            .map(str::to_string)
    }

    /// 检查依赖索引是否为空
    pub fn is_empty(&self) -> bool {
        self.condition_dependents.is_empty() && self.filter_dependents.is_empty()
    }
}
