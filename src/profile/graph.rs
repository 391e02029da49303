//! Dependency-graph resolution over `inherits_from` and `depends_on` edges:
//! Kahn's algorithm for a deterministic load order, with quarantine (not a
//! hard failure) for any profile that references a missing id or
//! participates in a cycle. A quarantined profile's dependents are
//! quarantined too, transitively, since they can't be merged or scheduled
//! without it.

use std::collections::{BTreeMap, BTreeSet};

use super::types::ProfileSource;

#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineEntry {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct GraphResolution {
    /// Profile ids in an order where every `inherits_from`/`depends_on`
    /// target precedes the profile that references it. Lexicographic
    /// tie-break among simultaneously-ready nodes for determinism.
    pub order: Vec<String>,
    pub quarantined: Vec<QuarantineEntry>,
}

pub fn resolve(sources: &BTreeMap<String, ProfileSource>) -> GraphResolution {
    let valid_ids: BTreeSet<&String> = sources.keys().collect();
    let mut quarantined: BTreeMap<String, String> = BTreeMap::new();

    for (id, source) in sources {
        for reference in references(source) {
            if !valid_ids.contains(&reference) {
                quarantined
                    .entry(id.clone())
                    .or_insert_with(|| format!("references missing profile '{reference}'"));
            }
        }
    }

    propagate_quarantine(sources, &mut quarantined, "depends on a quarantined profile");

    let active: BTreeMap<&String, &ProfileSource> = sources
        .iter()
        .filter(|(id, _)| !quarantined.contains_key(*id))
        .collect();

    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (&id, _) in &active {
        in_degree.entry(id.clone()).or_insert(0);
    }
    for (&id, source) in &active {
        for reference in references(source) {
            if active.contains_key(&reference) {
                *in_degree.entry(id.clone()).or_insert(0) += 1;
                dependents.entry(reference).or_default().push(id.clone());
            }
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut order = Vec::new();
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        if let Some(deps) = dependents.get(&next) {
            for dependent in deps {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.clone());
                    }
                }
            }
        }
    }

    for (id, &degree) in &in_degree {
        if degree > 0 && !order.contains(id) {
            quarantined
                .entry(id.clone())
                .or_insert_with(|| "participates in an inheritance/dependency cycle".to_string());
        }
    }

    propagate_quarantine(sources, &mut quarantined, "depends on a quarantined profile");
    order.retain(|id| !quarantined.contains_key(id));

    GraphResolution {
        order,
        quarantined: quarantined
            .into_iter()
            .map(|(id, reason)| QuarantineEntry { id, reason })
            .collect(),
    }
}

fn references(source: &ProfileSource) -> Vec<String> {
    let mut refs = Vec::new();
    if let Some(parent) = &source.inherits_from {
        refs.push(parent.clone());
    }
    refs.extend(source.depends_on.iter().cloned());
    refs
}

fn propagate_quarantine(
    sources: &BTreeMap<String, ProfileSource>,
    quarantined: &mut BTreeMap<String, String>,
    reason: &str,
) {
    loop {
        let mut added = false;
        for (id, source) in sources {
            if quarantined.contains_key(id) {
                continue;
            }
            if references(source).iter().any(|r| quarantined.contains_key(r)) {
                quarantined.insert(id.clone(), reason.to_string());
                added = true;
            }
        }
        if !added {
            break;
        }
    }
}
