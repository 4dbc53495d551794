//! Dependency resolution - build order for a set of target resources
//!
//! Resolution runs in three passes, none of which mutate anything:
//!
//! 1. Cycle check over the static graph reachable from the targets
//!    (ancestry and explicit edges), iterative three-color DFS.
//! 2. Expansion: explicit dependencies are always scheduled; a clone or
//!    archive source is scheduled only when it does not exist yet. This
//!    is transitive, so a missing grandparent is built before its child.
//! 3. Topological emission over the scheduled set, smallest ready id first.

use crate::error::{Error, Result};
use catalog::{Catalog, ResourceId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Resolve `targets` into a creation order.
///
/// `exists` is the authoritative observation of whether a resource is
/// already present on the hypervisor. It is only consulted for clone and
/// archive sources, and at most once per id per call.
pub fn resolve<F>(catalog: &Catalog, targets: &[ResourceId], mut exists: F) -> Result<Vec<ResourceId>>
where
    F: FnMut(ResourceId) -> anyhow::Result<bool>,
{
    let roots: BTreeSet<ResourceId> = targets.iter().copied().collect();
    for id in &roots {
        catalog.require(*id)?;
    }

    check_acyclic(catalog, &roots)?;

    let scheduled = expand(catalog, &roots, &mut exists)?;
    let order = emit(catalog, &scheduled)?;

    log::debug!(
        "resolved {:?} into {} resources: {:?}",
        targets,
        order.len(),
        order
    );
    Ok(order)
}

/// Iterative DFS with gray/black marking; a gray neighbor is a back-edge.
pub(crate) fn check_acyclic(catalog: &Catalog, roots: &BTreeSet<ResourceId>) -> Result<()> {
    let mut colors: HashMap<ResourceId, Color> = HashMap::new();

    for &root in roots {
        if colors.contains_key(&root) {
            continue;
        }

        // (node, its prerequisites, index of the next prerequisite to visit)
        let mut stack: Vec<(ResourceId, Vec<ResourceId>, usize)> = Vec::new();
        colors.insert(root, Color::Gray);
        stack.push((root, prerequisites(catalog, root)?, 0));

        while let Some((node, edges, next)) = stack.last_mut() {
            if *next < edges.len() {
                let target = edges[*next];
                *next += 1;

                match colors.get(&target) {
                    None => {
                        colors.insert(target, Color::Gray);
                        let target_edges = prerequisites(catalog, target)?;
                        stack.push((target, target_edges, 0));
                    }
                    Some(Color::Gray) => {
                        let start = stack
                            .iter()
                            .position(|(id, _, _)| *id == target)
                            .unwrap_or(0);
                        let mut cycle: Vec<ResourceId> =
                            stack[start..].iter().map(|(id, _, _)| *id).collect();
                        cycle.push(target);
                        return Err(Error::Dependency { cycle });
                    }
                    Some(Color::Black) => {}
                }
            } else {
                let done = *node;
                colors.insert(done, Color::Black);
                stack.pop();
            }
        }
    }

    Ok(())
}

fn prerequisites(catalog: &Catalog, id: ResourceId) -> Result<Vec<ResourceId>> {
    Ok(catalog.require(id)?.prerequisites().into_iter().collect())
}

/// Worklist expansion of the targets into everything that must be converged
fn expand<F>(
    catalog: &Catalog,
    roots: &BTreeSet<ResourceId>,
    exists: &mut F,
) -> Result<BTreeSet<ResourceId>>
where
    F: FnMut(ResourceId) -> anyhow::Result<bool>,
{
    let mut scheduled: BTreeSet<ResourceId> = roots.clone();
    let mut worklist: VecDeque<ResourceId> = roots.iter().copied().collect();
    let mut observed: HashMap<ResourceId, bool> = HashMap::new();

    while let Some(id) = worklist.pop_front() {
        let definition = catalog.require(id)?;

        for &dep in &definition.explicit_dependencies {
            if scheduled.insert(dep) {
                worklist.push_back(dep);
            }
        }

        let Some(source) = definition.creation_method.source_id() else {
            continue;
        };
        if scheduled.contains(&source) {
            continue;
        }

        let present = match observed.get(&source) {
            Some(present) => *present,
            None => {
                let present = exists(source).map_err(|e| Error::Probe {
                    id: source,
                    source: e.into(),
                })?;
                observed.insert(source, present);
                present
            }
        };

        if present {
            log::debug!("resource {id}: source {source} already exists");
        } else {
            log::info!("resource {id}: source {source} does not exist, scheduling it first");
            scheduled.insert(source);
            worklist.push_back(source);
        }
    }

    Ok(scheduled)
}

/// Kahn's algorithm restricted to the scheduled set
fn emit(catalog: &Catalog, scheduled: &BTreeSet<ResourceId>) -> Result<Vec<ResourceId>> {
    let mut pending: BTreeMap<ResourceId, usize> = BTreeMap::new();
    let mut dependents: HashMap<ResourceId, Vec<ResourceId>> = HashMap::new();

    for &id in scheduled {
        let edges: Vec<ResourceId> = catalog
            .require(id)?
            .prerequisites()
            .into_iter()
            .filter(|p| scheduled.contains(p))
            .collect();
        pending.insert(id, edges.len());
        for prerequisite in edges {
            dependents.entry(prerequisite).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<ResourceId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(scheduled.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != scheduled.len() {
        let cycle: Vec<ResourceId> = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(Error::Dependency { cycle });
    }

    Ok(order)
}
