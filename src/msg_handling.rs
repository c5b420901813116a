use graph_types::{MsgType, StatusCode};
use tracing::{debug, error, trace, warn};

use crate::dispatch::dispatch_msg;
use crate::extension::{Extension, ExtensionCore, ExtensionEnv};
use crate::logger::PATH_METRICS;
use crate::message::Message;
use crate::path::PathType;

/// Entry point for every message arriving at an extension task, including
/// results synthesized locally for timed-out or flushed paths.
pub(crate) async fn handle_in_msg(core: &mut ExtensionCore, ext: &mut dyn Extension, msg: Message) {
    trace!(
        extension = %core.loc,
        msg_type = %msg.msg_type(),
        name = msg.name(),
        fields = %core.kinds.describe(&msg),
        "inbound"
    );
    match msg.msg_type() {
        MsgType::CmdResult => handle_result(core, msg),
        MsgType::Cmd => handle_cmd(core, ext, msg).await,
        MsgType::Data | MsgType::AudioFrame | MsgType::VideoFrame => {
            handle_stream_msg(core, ext, msg).await
        }
    }
}

/// Correlate a result with the OUT path of the command it answers and
/// hand the resolved result to the handler captured when it was sent.
pub(crate) fn handle_result(core: &mut ExtensionCore, mut result: Message) {
    let Some(id) = core.path_table.find_path_from_cmd_id(PathType::Out, result.cmd_id()) else {
        debug!(extension = %core.loc, cmd_id = %result.cmd_id(), "no out path for result, dropped");
        PATH_METRICS.results_dropped.add(1, &[]);
        return;
    };
    if let Some(path) = core.path_table.path(id) {
        result.name = path.cmd_name().to_string();
    }
    if let Err(e) = core.check_schema(&mut result, false) {
        warn!(extension = %core.loc, cmd = %result.name, "received result marked as error: {e}");
        result.set_status(StatusCode::Error);
    }

    let remove_path = result.is_final();
    core.path_table.set_result(PathType::Out, &result);
    let resolved = core.path_table.determine_actual_cmd_result(PathType::Out, id, remove_path);
    let Some(mut actual) = resolved else {
        trace!(
            extension = %core.loc,
            cmd_id = %result.cmd_id(),
            "result cached until its group settles"
        );
        return;
    };
    match actual.result_handler.take() {
        Some(handler) => handler.call(&mut ExtensionEnv::new(core), actual),
        None => trace!(extension = %core.loc, cmd = %actual.name, "result has no handler"),
    }
}

async fn handle_cmd(core: &mut ExtensionCore, ext: &mut dyn Extension, mut cmd: Message) {
    let conversion = cmd.result_conversion.take();
    core.path_table.add_in_path(&mut cmd, conversion);
    PATH_METRICS.paths_created.add(1, &[]);

    if let Err(e) = core.check_schema(&mut cmd, false) {
        warn!(extension = %core.loc, cmd = cmd.name(), "rejecting command: {e}");
        let result =
            Message::cmd_result_from_cmd(StatusCode::Error, &cmd).with_detail(&e.to_string());
        if let Err(e) = dispatch_msg(core, result) {
            error!(extension = %core.loc, cmd = cmd.name(), "failed to return schema error: {e}");
        }
        return;
    }

    cmd.clear_dests();
    ext.on_cmd(&mut ExtensionEnv::new(core), cmd).await;
}

async fn handle_stream_msg(core: &mut ExtensionCore, ext: &mut dyn Extension, mut msg: Message) {
    if let Err(e) = core.check_schema(&mut msg, false) {
        warn!(
            extension = %core.loc,
            msg_type = %msg.msg_type(),
            name = msg.name(),
            "dropping message: {e}"
        );
        return;
    }
    msg.clear_dests();
    let mut env = ExtensionEnv::new(core);
    match msg.msg_type() {
        MsgType::Data => ext.on_data(&mut env, msg).await,
        MsgType::AudioFrame => ext.on_audio_frame(&mut env, msg).await,
        MsgType::VideoFrame => ext.on_video_frame(&mut env, msg).await,
        MsgType::Cmd | MsgType::CmdResult => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::extension::test_support::*;
    use crate::router::MsgRouter;
    use crate::schema::ExtensionApi;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default, Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Extension for Recorder {
        async fn on_cmd(&mut self, _env: &mut ExtensionEnv<'_>, cmd: Message) {
            self.seen.lock().unwrap().push(cmd);
        }

        async fn on_data(&mut self, _env: &mut ExtensionEnv<'_>, data: Message) {
            self.seen.lock().unwrap().push(data);
        }
    }

    fn ping_api() -> ExtensionApi {
        serde_json::from_value(json!({
            "cmd_in": [{
                "name": "ping",
                "property": {
                    "type": "object",
                    "required": ["n"],
                    "properties": {
                        "n": {"type": "integer"},
                        "mode": {"type": "string", "default": "fast"}
                    }
                }
            }]
        }))
        .unwrap()
    }

    fn ping_from(sender: &str) -> Message {
        let mut cmd = Message::new_cmd("ping");
        cmd.src_loc = loc(sender);
        cmd.set_dest(loc("f"));
        cmd
    }

    #[tokio::test]
    async fn incoming_cmd_gets_in_path_and_defaults() {
        let router = MsgRouter::new();
        let (mut core, _rx) = core_at("f", routing(json!([])), &router, &ping_api());
        let mut ext = Recorder::default();

        handle_in_msg(&mut core, &mut ext, ping_from("e").with_property("n", json!(1))).await;

        let seen = ext.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].property("mode"), Some(&json!("fast")));
        assert!(seen[0].dest_locs().is_empty());
        assert_eq!(core.path_table.len(PathType::In), 1);
    }

    #[tokio::test]
    async fn invalid_cmd_is_answered_without_reaching_extension() {
        let router = MsgRouter::new();
        let routes = routing(json!([]));
        let (mut core, _rx) = core_at("f", routes.clone(), &router, &ping_api());
        let (_e, mut e_rx) = core_at("e", routes, &router, &ExtensionApi::default());
        let mut ext = Recorder::default();

        let cmd = ping_from("e").with_property("n", json!("one"));
        let cmd_id = cmd.cmd_id().to_string();
        handle_in_msg(&mut core, &mut ext, cmd).await;

        assert!(ext.seen.lock().unwrap().is_empty());
        let back = next_msg(&mut e_rx);
        assert_eq!(back.status(), StatusCode::Error);
        assert_eq!(back.cmd_id(), cmd_id);
        assert!(core.path_table.is_empty());
    }

    #[tokio::test]
    async fn result_reaches_handler_once() {
        let router = MsgRouter::new();
        let routes = routing(json!([]));
        let (mut core, _rx) = core_at("e", routes.clone(), &router, &ExtensionApi::default());
        let (_f, _f_rx) = core_at("f", routes, &router, &ExtensionApi::default());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = calls.clone();
        let mut cmd = Message::new_cmd("ping").with_result_handler(move |_, r| {
            sink.lock().unwrap().push(r);
        });
        cmd.set_dest(loc("f"));
        let cmd_id = cmd.cmd_id().to_string();
        dispatch_msg(&mut core, cmd).unwrap();

        let mut ext = Recorder::default();
        let reply = Message::new_result(StatusCode::Ok, &cmd_id, "");
        handle_in_msg(&mut core, &mut ext, reply.clone()).await;
        handle_in_msg(&mut core, &mut ext, reply).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "ping");
        assert!(calls[0].is_completed());
        assert!(core.path_table.is_empty());
    }

    #[tokio::test]
    async fn data_failing_schema_is_dropped() {
        let router = MsgRouter::new();
        let api: ExtensionApi = serde_json::from_value(json!({
            "data_in": [{"name": "frame", "property": {"type": "object", "required": ["fps"]}}]
        }))
        .unwrap();
        let (mut core, _rx) = core_at("f", routing(json!([])), &router, &api);
        let mut ext = Recorder::default();
        handle_in_msg(&mut core, &mut ext, Message::new_data("frame")).await;
        let frame = Message::new_data("frame").with_property("fps", json!(25));
        handle_in_msg(&mut core, &mut ext, frame).await;
        assert_eq!(ext.seen.lock().unwrap().len(), 1);
    }
}
