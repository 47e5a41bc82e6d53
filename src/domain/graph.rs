use std::collections::{BTreeSet, HashMap};

use crate::domain::node::{NodeData, NodeId};
use crate::error::{Error, Result};

/// Orders graph nodes so every link points backwards: a node appears only
/// after every node its link inputs reference. Ties keep the incoming
/// order, so all members of a group derive the same schedule from the same
/// node list.
///
/// Graph files are keyed by node id and say nothing about run order; a
/// consumer's id may well sort before its source's. Links to ids outside
/// the list impose no ordering and surface as resolution failures when the
/// referencing node actually runs.
///
/// # Returns
/// Returns `Error::GraphCycle` when the links cannot be ordered.
pub fn execution_order(nodes: &[(NodeId, NodeData)]) -> Result<Vec<NodeId>> {
    let position: HashMap<&NodeId, usize> =
        nodes.iter().enumerate().map(|(at, (id, _))| (id, at)).collect();

    let mut blockers = vec![0usize; nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (at, (_, data)) in nodes.iter().enumerate() {
        for spec in data.inputs.values() {
            if let Some((source, _)) = spec.as_link() {
                if let Some(&dep) = position.get(source) {
                    blockers[at] += 1;
                    consumers[dep].push(at);
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&at| blockers[at] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(at) = ready.pop_first() {
        order.push(nodes[at].0.clone());

        for &blocked in &consumers[at] {
            blockers[blocked] -= 1;
            if blockers[blocked] == 0 {
                ready.insert(blocked);
            }
        }
    }

    // A node still blocked here sits on a link cycle or behind one.
    for (at, (id, _)) in nodes.iter().enumerate() {
        if blockers[at] > 0 {
            return Err(Error::GraphCycle(id.clone()));
        }
    }

    Ok(order)
}
