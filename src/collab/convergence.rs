//! Deterministic merge of concurrent text edits.
//!
//! The engine keeps a replicated character tree. Every character is a child
//! of the character it was typed after (its anchor), remembers the sequence
//! that inserted it and, once removed, the sequence that deleted it. Because
//! nothing is ever physically removed, the document as it looked at any past
//! version can be reconstructed, and an operation written against an old base
//! version is positioned relative to exactly what its author saw.
//!
//! Siblings under the same anchor are ordered by a sibling key:
//! operations with a newer base version come first, so an insert always lands
//! before characters its author had already seen next to the anchor. Among
//! operations sharing a base version the lower `(timestamp, author)` tuple goes
//! first. The resulting order depends only on the operations themselves, never
//! on the order in which the coordinator received them.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{Edit, EditRequest, Operation};

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SiblingKey {
    base: Reverse<u64>,
    timestamp: i64,
    author: String,
    op_id: Uuid,
}

impl SiblingKey {
    fn of(op: &Operation) -> Self {
        SiblingKey {
            base: Reverse(op.base_version),
            timestamp: op.timestamp.timestamp_millis(),
            author: op.author_id.clone(),
            op_id: op.op_id,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    ch: char,
    key: Arc<SiblingKey>,
    inserted_at: u64,
    deleted_at: Option<u64>,
    children: Vec<NodeId>,
}

impl Node {
    fn visible_at(&self, version: u64) -> bool {
        self.inserted_at <= version && self.deleted_at.map_or(true, |d| d > version)
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedInsert {
    anchor: NodeId,
    key: Arc<SiblingKey>,
    text: String,
}

/// The outcome of positioning one operation against the current replica
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    insert: Option<PlannedInsert>,
    deletes: Vec<NodeId>,
    edits: Vec<Edit>,
}

impl Resolution {
    /// Edits that turn the current document into the next version
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }
}

#[derive(Debug)]
pub struct ConvergenceEngine {
    nodes: Vec<Node>,
    // Document order of every non-root node, tombstones included.
    order: Vec<NodeId>,
    version: u64,
}

impl Default for ConvergenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceEngine {
    pub fn new() -> Self {
        let root = Node {
            ch: '\0',
            key: Arc::new(SiblingKey {
                base: Reverse(0),
                timestamp: 0,
                author: String::new(),
                op_id: Uuid::nil(),
            }),
            inserted_at: 0,
            deleted_at: None,
            children: Vec::new(),
        };
        Self {
            nodes: vec![root],
            order: Vec::new(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> String {
        self.order
            .iter()
            .map(|&id| &self.nodes[id])
            .filter(|n| n.is_live())
            .map(|n| n.ch)
            .collect()
    }

    /// Characters ever inserted, tombstones included
    pub fn footprint(&self) -> usize {
        self.order.len()
    }

    /// Position `pending` against everything accepted after its base version.
    ///
    /// Does not mutate the replica; pass the result to [`integrate`](Self::integrate)
    /// once the operation is durably accepted.
    pub fn resolve(&self, pending: &Operation) -> Result<Resolution, SyncError> {
        let request = EditRequest::parse(&pending.payload)?;
        let base = pending.base_version;
        if base > self.version {
            return Err(SyncError::FutureBaseVersion {
                base,
                current: self.version,
            });
        }

        let base_view: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|&id| self.nodes[id].visible_at(base))
            .collect();

        let mut targets = Vec::new();
        if let Some((position, length)) = request.removed_range() {
            let end = position
                .checked_add(length)
                .filter(|&end| end <= base_view.len())
                .ok_or_else(|| range_error(position.saturating_add(length), base_view.len(), base))?;
            // Characters a concurrent operation already removed stay removed.
            targets.extend(
                base_view[position..end]
                    .iter()
                    .copied()
                    .filter(|&id| self.nodes[id].is_live()),
            );
        }

        let insert = match request.inserted_text() {
            Some((position, _)) if position > base_view.len() => {
                return Err(range_error(position, base_view.len(), base));
            }
            Some((_, "")) | None => None,
            Some((position, text)) => Some(PlannedInsert {
                anchor: if position == 0 { ROOT } else { base_view[position - 1] },
                key: Arc::new(SiblingKey::of(pending)),
                text: text.to_string(),
            }),
        };

        let edits = self.edits_for(&targets, insert.as_ref());
        Ok(Resolution {
            insert,
            deletes: targets,
            edits,
        })
    }

    /// Apply a resolution as the operation accepted at `sequence`
    pub fn integrate(&mut self, sequence: u64, resolution: &Resolution) {
        for &id in &resolution.deletes {
            self.nodes[id].deleted_at.get_or_insert(sequence);
        }
        if let Some(planned) = &resolution.insert {
            let mut parent = planned.anchor;
            for ch in planned.text.chars() {
                let id = self.nodes.len();
                self.nodes.push(Node {
                    ch,
                    key: planned.key.clone(),
                    inserted_at: sequence,
                    deleted_at: None,
                    children: Vec::new(),
                });
                let slot = self.slot_for(parent, &planned.key);
                self.nodes[parent].children.insert(slot, id);
                parent = id;
            }
        }
        self.version = sequence;
        self.rebuild_order();
    }

    fn slot_for(&self, parent: NodeId, key: &SiblingKey) -> usize {
        self.nodes[parent]
            .children
            .partition_point(|&c| *self.nodes[c].key < *key)
    }

    fn edits_for(&self, targets: &[NodeId], insert: Option<&PlannedInsert>) -> Vec<Edit> {
        let removed: HashSet<NodeId> = targets.iter().copied().collect();
        let mut edits = Vec::new();

        // Live positions of the removed characters, grouped into runs and
        // emitted right to left so earlier positions stay valid.
        let mut positions = Vec::with_capacity(targets.len());
        let mut live_index = 0;
        for &id in &self.order {
            if !self.nodes[id].is_live() {
                continue;
            }
            if removed.contains(&id) {
                positions.push(live_index);
            }
            live_index += 1;
        }
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for position in positions {
            match runs.last_mut() {
                Some((start, length)) if *start + *length == position => *length += 1,
                _ => runs.push((position, 1)),
            }
        }
        for (position, length) in runs.into_iter().rev() {
            edits.push(Edit::Delete { position, length });
        }

        if let Some(planned) = insert {
            let predecessor = self.predecessor_of(planned);
            let mut position = 0;
            if predecessor != ROOT {
                for &id in &self.order {
                    if self.nodes[id].is_live() && !removed.contains(&id) {
                        position += 1;
                    }
                    if id == predecessor {
                        break;
                    }
                }
            }
            edits.push(Edit::Insert {
                position,
                text: planned.text.clone(),
            });
        }
        edits
    }

    /// Node the planned insert will follow in document order
    fn predecessor_of(&self, planned: &PlannedInsert) -> NodeId {
        let slot = self.slot_for(planned.anchor, &planned.key);
        if slot == 0 {
            return planned.anchor;
        }
        let mut node = self.nodes[planned.anchor].children[slot - 1];
        while let Some(&last) = self.nodes[node].children.last() {
            node = last;
        }
        node
    }

    fn rebuild_order(&mut self) {
        self.order.clear();
        let mut stack: Vec<NodeId> = self.nodes[ROOT].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            self.order.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
    }
}

fn range_error(position: usize, len: usize, base: u64) -> SyncError {
    SyncError::UnsupportedOperation(format!(
        "position {} is outside the {} chars of version {}",
        position, len, base
    ))
}
