use std::collections::HashMap;
use std::{fs, path::Path as FsPath};

use graph_types::{Location, MsgType, ResultReturnPolicy, loc::LOCALHOST};
use petgraph::prelude::StableDiGraph;
use petgraph::graph::NodeIndex;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::RuntimeError;
use crate::path::MsgConversion;

/// Message name matching every name of its kind.
pub const WILDCARD_MSG_NAME: &str = "*";

/// Graph as written by users: extension nodes plus the routes between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    /// URI of the app the graph runs in; `localhost` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_uri: Option<String>,
    #[serde(default)]
    pub graph_id: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    pub name: String,
    pub extension_group: String,
    /// Addon implementing the node; defaults to the node name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub property: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionDefinition {
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<MsgFlowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<MsgFlowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_frame: Vec<MsgFlowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_frame: Vec<MsgFlowDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MsgFlowDefinition {
    pub name: String,
    pub dest: Vec<DestDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_return_policy: Option<ResultReturnPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DestDefinition {
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_conversion: Option<MsgConversion>,
}

impl GraphDefinition {
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &FsPath) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    pub fn app_uri(&self) -> &str {
        self.app_uri.as_deref().unwrap_or(LOCALHOST)
    }
}

/// JSON Schema describing graph files.
pub fn graph_schema() -> Value {
    serde_json::to_value(schema_for!(GraphDefinition)).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub loc: Location,
    pub msg_conversion: Option<MsgConversion>,
}

/// Where one named message of one source goes, and how results of a
/// fanned-out command are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgDestInfo {
    pub name: String,
    pub dests: Vec<Destination>,
    pub policy: ResultReturnPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub loc: Location,
    pub addon: String,
    pub property: Value,
}

/// Read-only routing view of a started graph.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    app_uri: String,
    graph_id: String,
    nodes: Vec<GraphNode>,
    routes: HashMap<(Location, MsgType), Vec<MsgDestInfo>>,
}

impl RoutingTable {
    pub fn from_definition(def: &GraphDefinition) -> Result<Self, RuntimeError> {
        let app_uri = def.app_uri().to_string();
        let graph_id = def.graph_id.clone();

        let mut nodes: Vec<GraphNode> = Vec::with_capacity(def.nodes.len());
        for node in &def.nodes {
            let loc = Location::new(
                node.app.clone().unwrap_or_default(),
                graph_id.clone(),
                node.extension_group.clone(),
                node.name.clone(),
            )
            .with_localhost_translated(&app_uri);
            if nodes.iter().any(|n| n.loc == loc) {
                return Err(RuntimeError::InvalidGraph(format!("duplicate node {loc}")));
            }
            nodes.push(GraphNode {
                loc,
                addon: node.addon.clone().unwrap_or_else(|| node.name.clone()),
                property: node.property.clone(),
            });
        }

        let mut table = Self { app_uri, graph_id, nodes, routes: HashMap::new() };

        for conn in &def.connections {
            let src = table.resolve_node(
                &conn.extension,
                conn.extension_group.as_deref(),
                conn.app.as_deref(),
            )?;
            let kinds = [
                (MsgType::Cmd, &conn.cmd),
                (MsgType::Data, &conn.data),
                (MsgType::AudioFrame, &conn.audio_frame),
                (MsgType::VideoFrame, &conn.video_frame),
            ];
            for (msg_type, flows) in kinds {
                for flow in flows {
                    let info = table.dest_info(flow)?;
                    let entries = table.routes.entry((src.clone(), msg_type)).or_default();
                    if entries.iter().any(|e| e.name == info.name) {
                        return Err(RuntimeError::InvalidGraph(format!(
                            "{msg_type} `{}` declared twice for {src}",
                            info.name
                        )));
                    }
                    entries.push(info);
                }
            }
        }

        table.report_topology();
        Ok(table)
    }

    fn resolve_node(
        &self,
        extension: &str,
        group: Option<&str>,
        app: Option<&str>,
    ) -> Result<Location, RuntimeError> {
        let app = app
            .filter(|a| !a.is_empty() && *a != LOCALHOST)
            .unwrap_or(&self.app_uri);
        let mut candidates = self.nodes.iter().filter(|n| {
            n.loc.extension_name == extension
                && n.loc.app_uri == app
                && group.is_none_or(|g| n.loc.extension_group_name == g)
        });
        match (candidates.next(), candidates.next()) {
            (Some(node), None) => Ok(node.loc.clone()),
            (Some(_), Some(_)) => Err(RuntimeError::InvalidGraph(format!(
                "extension `{extension}` is ambiguous, name its extension_group"
            ))),
            (None, _) => Err(RuntimeError::InvalidGraph(format!(
                "extension `{extension}` is not a node of graph `{}`",
                self.graph_id
            ))),
        }
    }

    fn dest_info(&self, flow: &MsgFlowDefinition) -> Result<MsgDestInfo, RuntimeError> {
        if flow.dest.is_empty() {
            return Err(RuntimeError::InvalidGraph(format!("`{}` has no destination", flow.name)));
        }
        let dests = flow
            .dest
            .iter()
            .map(|d| {
                Ok(Destination {
                    loc: self.resolve_node(
                        &d.extension,
                        d.extension_group.as_deref(),
                        d.app.as_deref(),
                    )?,
                    msg_conversion: d.msg_conversion.clone(),
                })
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        Ok(MsgDestInfo {
            name: flow.name.clone(),
            dests,
            policy: flow.result_return_policy.unwrap_or_default(),
        })
    }

    /// Cycles are legal (commands looping back get renamed by their IN
    /// path), they are only worth a debug line.
    fn report_topology(&self) {
        let mut graph: StableDiGraph<Location, MsgType> = StableDiGraph::new();
        let index_of: HashMap<&Location, NodeIndex> = self
            .nodes
            .iter()
            .map(|n| (&n.loc, graph.add_node(n.loc.clone())))
            .collect();
        for ((src, msg_type), infos) in &self.routes {
            for info in infos {
                for dest in &info.dests {
                    if let (Some(&i), Some(&j)) = (index_of.get(src), index_of.get(&dest.loc)) {
                        graph.add_edge(i, j, *msg_type);
                    }
                }
            }
        }
        if petgraph::algo::is_cyclic_directed(&graph) {
            debug!(graph = %self.graph_id, "graph routes contain cycles");
        }
        info!(
            graph = %self.graph_id,
            nodes = graph.node_count(),
            routes = graph.edge_count(),
            "routing table built"
        );
    }

    pub fn app_uri(&self) -> &str {
        &self.app_uri
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, loc: &Location) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.loc == loc)
    }

    /// Destinations declared for `name` sent by `src`, falling back to the
    /// `*` entry of that kind.
    pub fn lookup(&self, src: &Location, msg_type: MsgType, name: &str) -> Option<&MsgDestInfo> {
        let src = src.clone().with_localhost_translated(&self.app_uri);
        let infos = self.routes.get(&(src, msg_type))?;
        infos
            .iter()
            .find(|i| i.name == name)
            .or_else(|| infos.iter().find(|i| i.name == WILDCARD_MSG_NAME))
    }

    /// Fill in graph id and app placeholders of an address given by an
    /// extension.
    pub fn normalize(&self, loc: &mut Location) {
        loc.translate_localhost(&self.app_uri);
        if loc.graph_id.is_empty() {
            loc.graph_id = self.graph_id.clone();
        }
    }
}
