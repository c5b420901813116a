use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use graph_types::{Location, MsgType};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::PathClock;
use crate::config::PathTimeoutInfo;
use crate::error::RuntimeError;
use crate::extension::{Extension, ExtensionCore};
use crate::extension_thread::ExtensionThread;
use crate::graph::{GraphDefinition, GraphNode, RoutingTable};
use crate::message::{Message, ResultHandler};
use crate::msg_kind::MsgKindTable;
use crate::path::{AttachTo, PathTable};
use crate::router::{MsgRouter, ThreadMsg};
use crate::schema::SchemaStore;

pub type ExtensionFactory = Arc<dyn Fn(&GraphNode) -> Box<dyn Extension> + Send + Sync>;

/// Named constructors for extensions, looked up by a node's `addon`.
#[derive(Clone, Default)]
pub struct AddonRegistry {
    factories: Arc<DashMap<String, ExtensionFactory>>,
}

impl fmt::Debug for AddonRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("AddonRegistry").field("addons", &names).finish()
    }
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, addon: &str, factory: F)
    where
        F: Fn(&GraphNode) -> Box<dyn Extension> + Send + Sync + 'static,
    {
        self.factories.insert(addon.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, addon: &str) -> bool {
        self.factories.contains_key(addon)
    }

    pub fn create(&self, node: &GraphNode) -> Option<Box<dyn Extension>> {
        let factory = self.factories.get(&node.addon)?.value().clone();
        Some(factory(node))
    }
}

/// Knobs of a graph instance.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Base path timeouts, overridden per node by its `_graph` properties.
    pub timeouts: PathTimeoutInfo,
    pub kinds: MsgKindTable,
    pub clock: PathClock,
}

/// The engine's own extension: it only relays what clients inject.
struct EngineExtension;

#[async_trait]
impl Extension for EngineExtension {}

/// Results of one command sent by a client. Ends after the result marked
/// completed, or when the engine goes away.
#[derive(Debug)]
pub struct ResultStream {
    rx: mpsc::UnboundedReceiver<Message>,
    done: bool,
}

impl Stream for ResultStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(result)) => {
                if result.is_completed() {
                    self.done = true;
                }
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A running graph: one task per extension plus the engine task.
pub struct Engine {
    loc: Location,
    routing: Arc<RoutingTable>,
    router: MsgRouter,
    extensions: Vec<(Location, JoinHandle<()>)>,
    engine_task: Option<JoinHandle<()>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("loc", &self.loc)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

impl Engine {
    /// Build the routing table and spawn every extension of `def`. Must be
    /// called from within a tokio runtime.
    pub fn start(
        def: &GraphDefinition,
        addons: &AddonRegistry,
        options: EngineOptions,
    ) -> Result<Self, RuntimeError> {
        let routing = Arc::new(RoutingTable::from_definition(def)?);
        let kinds = Arc::new(options.kinds);
        let router = MsgRouter::new();

        // Everything that can fail happens before the first task is spawned.
        let mut prepared = Vec::with_capacity(routing.nodes().len());
        for node in routing.nodes() {
            let ext = addons.create(node).ok_or_else(|| {
                RuntimeError::InvalidGraph(format!(
                    "addon `{}` of {} is not registered",
                    node.addon, node.loc
                ))
            })?;
            let schema = SchemaStore::from_api(&ext.api())?;
            let mut properties = node.property.clone();
            schema.check_extension_properties(&mut properties)?;
            let timeouts = options.timeouts.with_properties(&properties);
            let table = PathTable::new(AttachTo::Extension(node.loc.clone()), timeouts)
                .with_clock(options.clock.clone());
            let core = ExtensionCore::new(
                table,
                routing.clone(),
                schema,
                kinds.clone(),
                router.clone(),
                properties,
            );
            prepared.push((ext, core));
        }

        let loc = Location::engine(routing.app_uri(), routing.graph_id());
        let engine_core = ExtensionCore::new(
            PathTable::new(AttachTo::Engine(loc.clone()), PathTimeoutInfo::never())
                .with_clock(options.clock.clone()),
            routing.clone(),
            SchemaStore::default(),
            kinds,
            router.clone(),
            Value::Null,
        );
        let rx = router.register(loc.clone());
        let engine_thread = ExtensionThread::new(engine_core, Box::new(EngineExtension), rx);
        let engine_task = tokio::spawn(engine_thread.run());

        let mut extensions = Vec::with_capacity(prepared.len());
        for (ext, core) in prepared {
            let ext_loc = core.loc.clone();
            let rx = router.register(ext_loc.clone());
            extensions.push((ext_loc, tokio::spawn(ExtensionThread::new(core, ext, rx).run())));
        }
        info!(graph = %routing.graph_id(), extensions = extensions.len(), "graph started");

        Ok(Self { loc, routing, router, extensions, engine_task: Some(engine_task) })
    }

    pub fn loc(&self) -> &Location {
        &self.loc
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn is_running(&self, loc: &Location) -> bool {
        self.router.is_registered(loc)
    }

    /// Resolve an address relative to this graph, e.g. one built with
    /// `Location::new("localhost", "", group, name)`.
    pub fn resolve(&self, mut loc: Location) -> Location {
        self.routing.normalize(&mut loc);
        loc
    }

    /// Inject a command. It needs explicit destinations, since the engine
    /// has no routes of its own; its results arrive on the returned stream.
    pub async fn send_cmd(&self, mut cmd: Message) -> Result<ResultStream, RuntimeError> {
        if cmd.msg_type() != MsgType::Cmd {
            return Err(RuntimeError::InvalidArgument(format!("`{}` is not a command", cmd.name())));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        cmd.set_result_handler(ResultHandler::new(move |_, result| {
            let _ = tx.send(result);
        }));
        self.inject(cmd).await?;
        Ok(ResultStream { rx, done: false })
    }

    /// Inject data or a frame addressed to explicit destinations.
    pub async fn send_msg(&self, msg: Message) -> Result<(), RuntimeError> {
        if msg.msg_type().is_cmd_like() {
            return Err(RuntimeError::InvalidArgument(format!(
                "use send_cmd for {} `{}`",
                msg.msg_type(),
                msg.name()
            )));
        }
        self.inject(msg).await
    }

    async fn inject(&self, msg: Message) -> Result<(), RuntimeError> {
        let (reply, outcome) = oneshot::channel();
        self.router
            .send(&self.loc, ThreadMsg::Client { msg, reply })
            .map_err(|_| RuntimeError::Closed)?;
        outcome.await.map_err(|_| RuntimeError::Closed)?
    }

    /// Close every extension, then the engine, which answers the client
    /// commands still in flight.
    pub async fn close(mut self) {
        for (loc, handle) in self.extensions.drain(..) {
            close_task(&self.router, &loc, handle).await;
        }
        if let Some(handle) = self.engine_task.take() {
            close_task(&self.router, &self.loc, handle).await;
        }
        info!(graph = %self.routing.graph_id(), "graph closed");
    }
}

async fn close_task(router: &MsgRouter, loc: &Location, handle: JoinHandle<()>) {
    let (tx, done) = oneshot::channel();
    if router.send(loc, ThreadMsg::Close(tx)).is_ok() {
        let _ = done.await;
    }
    if let Err(e) = handle.await {
        error!(extension = %loc, "extension task failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionEnv;
    use futures::StreamExt;
    use graph_types::StatusCode;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Extension for Echo {
        async fn on_cmd(&mut self, env: &mut ExtensionEnv<'_>, cmd: Message) {
            let text = cmd.property("text").cloned().unwrap_or(Value::Null);
            let result =
                Message::cmd_result_from_cmd(StatusCode::Ok, &cmd).with_property("echo", text);
            env.return_result(result).unwrap();
        }
    }

    fn graph() -> GraphDefinition {
        serde_json::from_value(json!({
            "app_uri": "app://test",
            "graph_id": "g1",
            "nodes": [{"name": "echo", "extension_group": "grp"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn client_cmd_round_trip() {
        let addons = AddonRegistry::new();
        addons.register("echo", |_| Box::new(Echo));
        let engine = Engine::start(&graph(), &addons, EngineOptions::default()).unwrap();

        let mut cmd = Message::new_cmd("say").with_property("text", json!("hi"));
        cmd.set_dest(engine.resolve(Location::new("localhost", "", "grp", "echo")));
        let cmd_id = cmd.cmd_id().to_string();
        let results: Vec<Message> = engine.send_cmd(cmd).await.unwrap().collect().await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cmd_id(), cmd_id);
        assert_eq!(results[0].property("echo"), Some(&json!("hi")));
        assert!(results[0].is_completed());
        engine.close().await;
    }

    #[tokio::test]
    async fn missing_addon_fails_start() {
        let err =
            Engine::start(&graph(), &AddonRegistry::new(), EngineOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidGraph(_)));
    }

    #[tokio::test]
    async fn engine_rejects_unaddressed_and_non_cmd() {
        let addons = AddonRegistry::new();
        addons.register("echo", |_| Box::new(Echo));
        let engine = Engine::start(&graph(), &addons, EngineOptions::default()).unwrap();

        let err = engine.send_cmd(Message::new_cmd("say")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::MsgNotConnected { .. }));
        assert!(engine.send_cmd(Message::new_data("d")).await.is_err());
        assert!(engine.send_msg(Message::new_cmd("c")).await.is_err());
        engine.close().await;
    }
}
