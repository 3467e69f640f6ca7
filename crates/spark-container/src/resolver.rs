//! # 依赖解析器
//!
//! ## 核心意图（Why）
//! - 依据实现声明的依赖槽位建图，计算一个与所有依赖边一致的线性启动顺序，其逆序即关闭顺序；
//! - 在实例化任何组件之前发现依赖环，以 [`ContainerError::CyclicDependency`] 拒绝整个启动。
//!
//! ## 行为契约（What）
//! - 无约束的组件之间按注册序号升序排列，同一注册集合总得到同一顺序；
//! - 指向未注册请求类型的槽位不产生边，由生命周期控制器在注入时报告。
//!
//! ## 实现要点（How）
//! - Kahn 算法，就绪队列为按注册序号的小顶堆，输出即字典序最小的拓扑序；
//! - 剩余节点非空时说明有环，再以带递归栈的 DFS 在剩余子图上找出一条具体环路用于报错。

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::error::ContainerError;
use crate::registry::ComponentRegistry;
use crate::request::ComponentId;

/// 解析得到的启动顺序。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitializationOrder {
    order: Vec<ComponentId>,
}

impl InitializationOrder {
    /// 启动顺序。
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = ComponentId> + '_ {
        self.order.iter().copied()
    }

    /// 关闭顺序。
    pub fn shutdown_order(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.order.iter().rev().copied()
    }

    /// 组件在启动顺序中的位置。
    pub fn position(&self, id: ComponentId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    /// 以切片形式返回。
    pub fn as_slice(&self) -> &[ComponentId] {
        &self.order
    }

    /// 组件数量。
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// 依赖解析器。
#[derive(Clone, Copy, Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// 对注册表中的活动注册求启动顺序。
    pub fn resolve(registry: &ComponentRegistry) -> Result<InitializationOrder, ContainerError> {
        let graph: Vec<(ComponentId, Vec<ComponentId>)> = registry
            .iter()
            .map(|registration| {
                let edges = registration
                    .implementation()
                    .dependencies()
                    .filter_map(|request_type| registry.provider_of(request_type))
                    .collect();
                (registration.id(), edges)
            })
            .collect();

        topological_order(&graph)
            .map(|order| InitializationOrder { order })
            .map_err(|cycle| ContainerError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|id| {
                        registry
                            .get(id)
                            .map(|registration| registration.label())
                            .unwrap_or_else(|| id.to_string())
                    })
                    .collect(),
            })
    }
}

/// 对 `(节点, 该节点依赖的节点)` 列表做确定性拓扑排序。
///
/// - **返回**：成功时依赖总排在依赖者之前；失败时返回一条环路，首尾为同一节点；
/// - 边指向不在节点集合中的目标时被忽略；重复边只计一次。
pub fn topological_order(
    graph: &[(ComponentId, Vec<ComponentId>)],
) -> Result<Vec<ComponentId>, Vec<ComponentId>> {
    let nodes: BTreeSet<ComponentId> = graph.iter().map(|(id, _)| *id).collect();
    let mut dependencies: BTreeMap<ComponentId, BTreeSet<ComponentId>> = BTreeMap::new();
    let mut dependents: BTreeMap<ComponentId, Vec<ComponentId>> = BTreeMap::new();

    for (id, edges) in graph {
        let entry = dependencies.entry(*id).or_default();
        for target in edges.iter().filter(|target| nodes.contains(target)) {
            if entry.insert(*target) {
                dependents.entry(*target).or_default().push(*id);
            }
        }
    }

    let mut in_degree: BTreeMap<ComponentId, usize> = dependencies
        .iter()
        .map(|(id, targets)| (*id, targets.len()))
        .collect();
    let mut ready: BinaryHeap<Reverse<ComponentId>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let placed: BTreeSet<ComponentId> = order.into_iter().collect();
    let remaining: BTreeSet<ComponentId> = nodes.difference(&placed).copied().collect();
    Err(find_cycle(&dependencies, &remaining))
}

fn find_cycle(
    dependencies: &BTreeMap<ComponentId, BTreeSet<ComponentId>>,
    remaining: &BTreeSet<ComponentId>,
) -> Vec<ComponentId> {
    let mut visited = BTreeSet::new();
    for start in remaining {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(*start, dependencies, remaining, &mut visited, &mut stack) {
            return cycle;
        }
    }
    // Kahn 剩余节点必含环，走到这里说明图在两次遍历间被改动。
    remaining.iter().copied().collect()
}

fn visit(
    node: ComponentId,
    dependencies: &BTreeMap<ComponentId, BTreeSet<ComponentId>>,
    remaining: &BTreeSet<ComponentId>,
    visited: &mut BTreeSet<ComponentId>,
    stack: &mut Vec<ComponentId>,
) -> Option<Vec<ComponentId>> {
    if let Some(position) = stack.iter().position(|entry| *entry == node) {
        let mut cycle = stack[position..].to_vec();
        cycle.push(node);
        return Some(cycle);
    }
    if !visited.insert(node) {
        return None;
    }
    stack.push(node);
    for target in dependencies.get(&node).into_iter().flatten() {
        if remaining.contains(target)
            && let Some(cycle) = visit(*target, dependencies, remaining, visited, stack)
        {
            return Some(cycle);
        }
    }
    stack.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(sequence: u64) -> ComponentId {
        ComponentId::new(sequence)
    }

    #[test]
    fn dependencies_come_first() {
        let graph = vec![(id(0), vec![id(2)]), (id(1), vec![]), (id(2), vec![id(1)])];
        assert_eq!(topological_order(&graph), Ok(vec![id(1), id(2), id(0)]));
    }

    #[test]
    fn unconstrained_nodes_follow_registration_order() {
        let graph = vec![(id(3), vec![]), (id(1), vec![]), (id(2), vec![])];
        assert_eq!(topological_order(&graph), Ok(vec![id(1), id(2), id(3)]));
    }

    #[test]
    fn two_node_cycle_is_named() {
        let graph = vec![(id(0), vec![id(1)]), (id(1), vec![id(0)]), (id(2), vec![])];
        let cycle = topological_order(&graph).expect_err("应检测到环");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
        assert!(cycle.contains(&id(0)) && cycle.contains(&id(1)));
        assert!(!cycle.contains(&id(2)));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let graph = vec![(id(0), vec![id(0)])];
        assert_eq!(topological_order(&graph), Err(vec![id(0), id(0)]));
    }

    #[test]
    fn dangling_edges_are_ignored() {
        let graph = vec![(id(0), vec![id(9)])];
        assert_eq!(topological_order(&graph), Ok(vec![id(0)]));
    }

    #[test]
    fn cycle_behind_acyclic_prefix_is_reported() {
        // 0 <- 1 <- 2 <- 3 <- 2
        let graph = vec![
            (id(0), vec![]),
            (id(1), vec![id(0)]),
            (id(2), vec![id(1), id(3)]),
            (id(3), vec![id(2)]),
        ];
        let cycle = topological_order(&graph).expect_err("应检测到环");
        assert_eq!(cycle, vec![id(2), id(3), id(2)]);
    }
}
