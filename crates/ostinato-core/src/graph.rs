//! Handle-based node graph with typed ports and cycle-safe connections.
//!
//! Nodes and connections are referenced by small integer ids resolved through
//! owning tables, so cross-thread snapshots and cascading deletes are value
//! comparisons rather than pointer lifetime management. The graph stays
//! acyclic at all times: a connect that would close a cycle fails atomically
//! and leaves the graph untouched.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, warn};

/// Graph node handle. Monotonically assigned, never reused while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection handle.
pub type ConnectionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Audio,
    Midi,
}

/// Node type tag. The engine assigns roles; the graph only stores the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Output,
    Source,
    Bus,
    Gain,
    TestSynth,
    Player,
    PluginHost,
}

/// Port declaration. Immutable after node creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub direction: PortDirection,
    pub signal: SignalKind,
    pub channels: u16,
}

impl PortSpec {
    pub fn audio_in(name: &str, channels: u16) -> Self {
        Self {
            name: name.to_string(),
            direction: PortDirection::Input,
            signal: SignalKind::Audio,
            channels,
        }
    }

    pub fn audio_out(name: &str, channels: u16) -> Self {
        Self {
            name: name.to_string(),
            direction: PortDirection::Output,
            signal: SignalKind::Audio,
            channels,
        }
    }

    pub fn midi_in(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direction: PortDirection::Input,
            signal: SignalKind::Midi,
            channels: 1,
        }
    }
}

/// Directed port-to-port connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub src_node: NodeId,
    pub src_port: String,
    pub dst_node: NodeId,
    pub dst_port: String,
}

#[derive(Debug)]
struct NodeEntry {
    kind: NodeKind,
    name: String,
    ports: Vec<PortSpec>,
}

/// The node graph: owns nodes and connections, computes execution order.
///
/// A distinguished Output node exists from construction and can never be
/// removed. Execution order is a topological sort recomputed lazily behind a
/// dirty flag; outside a batch scope recomputation happens synchronously
/// after every mutating call.
#[derive(Debug)]
pub struct NodeGraph {
    nodes: HashMap<NodeId, NodeEntry>,
    connections: Vec<Connection>,
    next_node: u32,
    next_connection: ConnectionId,
    output: NodeId,
    order: Vec<NodeId>,
    dirty: bool,
    deferred: bool,
}

impl NodeGraph {
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: HashMap::new(),
            connections: Vec::new(),
            next_node: 1,
            next_connection: 1,
            output: NodeId(0),
            order: Vec::new(),
            dirty: false,
            deferred: false,
        };
        graph.output = graph.add_node(
            NodeKind::Output,
            "Output",
            vec![PortSpec::audio_in("in", 2)],
        );
        graph
    }

    /// The built-in output node (single stereo audio input).
    pub fn output_node(&self) -> NodeId {
        self.output
    }

    pub fn add_node(&mut self, kind: NodeKind, name: &str, ports: Vec<PortSpec>) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        debug!(node = id.0, ?kind, name, "graph: add node");
        self.nodes.insert(
            id,
            NodeEntry {
                kind,
                name: name.to_string(),
                ports,
            },
        );
        self.mark_dirty();
        id
    }

    /// Remove a node, cascading every connection that touches it.
    ///
    /// Returns false for unknown handles and for the output node (no-op, not
    /// an error).
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if id == self.output {
            warn!(node = id.0, "graph: output node cannot be removed");
            return false;
        }
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        let before = self.connections.len();
        self.connections
            .retain(|c| c.src_node != id && c.dst_node != id);
        debug!(
            node = id.0,
            cascaded = before - self.connections.len(),
            "graph: remove node"
        );
        self.mark_dirty();
        true
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&id).map(|n| n.kind)
    }

    /// Node name, or empty string for unknown handles.
    pub fn node_name(&self, id: NodeId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    pub fn ports(&self, id: NodeId) -> &[PortSpec] {
        self.nodes.get(&id).map(|n| n.ports.as_slice()).unwrap_or(&[])
    }

    fn find_port(&self, node: NodeId, name: &str, direction: PortDirection) -> Option<&PortSpec> {
        self.nodes
            .get(&node)?
            .ports
            .iter()
            .find(|p| p.name == name && p.direction == direction)
    }

    /// Connect an output port to an input port.
    ///
    /// Fails with `InvalidNode` for unknown handles, `InvalidPort` when a
    /// port name does not exist with the required direction, `TypeMismatch`
    /// when signal kinds differ, and `CycleDetected` when the edge would make
    /// the graph cyclic. On failure the graph is unchanged.
    pub fn connect(
        &mut self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<ConnectionId> {
        if !self.nodes.contains_key(&src_node) {
            return Err(Error::InvalidNode(src_node.0));
        }
        if !self.nodes.contains_key(&dst_node) {
            return Err(Error::InvalidNode(dst_node.0));
        }
        let src = self
            .find_port(src_node, src_port, PortDirection::Output)
            .ok_or_else(|| Error::InvalidPort {
                node: src_node.0,
                port: src_port.to_string(),
            })?;
        let dst = self
            .find_port(dst_node, dst_port, PortDirection::Input)
            .ok_or_else(|| Error::InvalidPort {
                node: dst_node.0,
                port: dst_port.to_string(),
            })?;
        if src.signal != dst.signal {
            return Err(Error::TypeMismatch {
                src_port: src_port.to_string(),
                dst_port: dst_port.to_string(),
            });
        }
        if self.would_create_cycle(src_node, dst_node) {
            warn!(
                src = src_node.0,
                dst = dst_node.0,
                "graph: connect rejected, would create cycle"
            );
            return Err(Error::CycleDetected);
        }

        let id = self.next_connection;
        self.next_connection += 1;
        self.connections.push(Connection {
            id,
            src_node,
            src_port: src_port.to_string(),
            dst_node,
            dst_port: dst_port.to_string(),
        });
        debug!(
            conn = id,
            src = src_node.0,
            dst = dst_node.0,
            "graph: connect"
        );
        self.mark_dirty();
        Ok(id)
    }

    /// Remove a connection by id. Returns false if not found.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != id);
        let removed = self.connections.len() != before;
        if removed {
            debug!(conn = id, "graph: disconnect");
            self.mark_dirty();
        }
        removed
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connections_for(&self, node: NodeId) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|c| c.src_node == node || c.dst_node == node)
            .cloned()
            .collect()
    }

    /// Defer execution-order recomputation until `commit_batch`.
    pub fn begin_batch(&mut self) {
        self.deferred = true;
    }

    /// Recompute the execution order if any batched mutation left it dirty.
    pub fn commit_batch(&mut self) {
        self.deferred = false;
        if self.dirty {
            self.rebuild_order();
        }
    }

    /// Topologically sorted execution order.
    pub fn render_order(&mut self) -> &[NodeId] {
        if self.dirty {
            self.rebuild_order();
        }
        &self.order
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        if !self.deferred {
            self.rebuild_order();
        }
    }

    fn rebuild_order(&mut self) {
        // Kahn's algorithm. The graph is acyclic by construction, so every
        // node ends up in the order.
        let mut in_degree: HashMap<NodeId, usize> =
            self.nodes.keys().map(|&id| (id, 0)).collect();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> =
            self.nodes.keys().map(|&id| (id, Vec::new())).collect();

        for conn in &self.connections {
            adjacency.get_mut(&conn.src_node).unwrap().push(conn.dst_node);
            *in_degree.get_mut(&conn.dst_node).unwrap() += 1;
        }

        let mut ready: VecDeque<NodeId> = {
            let mut roots: Vec<NodeId> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&id, _)| id)
                .collect();
            roots.sort();
            roots.into()
        };

        self.order.clear();
        while let Some(current) = ready.pop_front() {
            self.order.push(current);
            for &next in &adjacency[&current] {
                let deg = in_degree.get_mut(&next).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(next);
                }
            }
        }
        self.dirty = false;
    }

    fn would_create_cycle(&self, src: NodeId, dst: NodeId) -> bool {
        // BFS from dst following outgoing connections; reaching src means the
        // new edge src->dst would close a cycle.
        if src == dst {
            return true;
        }
        let mut frontier = VecDeque::from([dst]);
        let mut visited = HashSet::from([dst]);
        while let Some(current) = frontier.pop_front() {
            for conn in self.connections.iter().filter(|c| c.src_node == current) {
                if conn.dst_node == src {
                    return true;
                }
                if visited.insert(conn.dst_node) {
                    frontier.push_back(conn.dst_node);
                }
            }
        }
        false
    }
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}
