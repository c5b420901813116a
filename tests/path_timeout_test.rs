use std::time::Duration;

use async_trait::async_trait;
use extgraph::extension_thread::PATH_TIMEOUT_DETAIL;
use extgraph::{
    AddonRegistry, Engine, EngineOptions, Extension, ExtensionEnv, GraphDefinition, Location,
    Message, StatusCode,
};
use futures::StreamExt;
use serde_json::json;

struct Relay;

#[async_trait]
impl Extension for Relay {
    async fn on_cmd(&mut self, env: &mut ExtensionEnv<'_>, cmd: Message) {
        let forward = cmd.clone_as_new().with_result_handler(|env, result| {
            env.return_result(result).unwrap();
        });
        env.send_cmd(forward).unwrap();
    }
}

/// Answers, but only after `delay`.
struct Sluggish {
    delay: Duration,
}

#[async_trait]
impl Extension for Sluggish {
    async fn on_cmd(&mut self, env: &mut ExtensionEnv<'_>, cmd: Message) {
        tokio::time::sleep(self.delay).await;
        env.return_result(Message::cmd_result_from_cmd(StatusCode::Ok, &cmd)).unwrap();
    }
}

fn start(delay: Duration) -> Engine {
    let def: GraphDefinition = serde_json::from_value(json!({
        "graph_id": "timeouts",
        "nodes": [
            {
                "name": "front",
                "extension_group": "grp",
                "addon": "relay",
                "property": {
                    "_graph": {
                        "path_timeout": {"out_path": 1_000_000},
                        "path_check_interval": 100_000
                    }
                }
            },
            {"name": "back", "extension_group": "grp", "addon": "sluggish"}
        ],
        "connections": [{
            "extension": "front",
            "cmd": [{"name": "work", "dest": [{"extension": "back"}]}]
        }]
    }))
    .unwrap();

    let addons = AddonRegistry::new();
    addons.register("relay", |_| Box::new(Relay));
    addons.register("sluggish", move |_| Box::new(Sluggish { delay }));
    Engine::start(&def, &addons, EngineOptions::default()).unwrap()
}

fn work(engine: &Engine) -> Message {
    let mut cmd = Message::new_cmd("work");
    cmd.set_dest(engine.resolve(Location::new("localhost", "", "grp", "front")));
    cmd
}

#[tokio::test(start_paused = true)]
async fn slow_answer_times_out_once() {
    let engine = start(Duration::from_secs(2));

    let results: Vec<Message> = engine.send_cmd(work(&engine)).await.unwrap().collect().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status(), StatusCode::Error);
    assert_eq!(results[0].detail(), Some(PATH_TIMEOUT_DETAIL));
    assert!(results[0].is_completed());

    // The late answer is dropped without disturbing the graph.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let front = engine.resolve(Location::new("localhost", "", "grp", "front"));
    assert!(engine.is_running(&front));
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn answer_within_timeout_is_delivered() {
    let engine = start(Duration::from_millis(300));

    let results: Vec<Message> = engine.send_cmd(work(&engine)).await.unwrap().collect().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status(), StatusCode::Ok);
    engine.close().await;
}
