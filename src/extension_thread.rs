use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, trace};

use crate::dispatch::dispatch_msg;
use crate::error::RuntimeError;
use crate::extension::{Extension, ExtensionCore, ExtensionEnv};
use crate::logger::PATH_METRICS;
use crate::msg_handling::{handle_in_msg, handle_result};
use crate::path::AttachTo;
use crate::router::ThreadMsg;
use crate::timer::{Timer, TimerRepeat};

/// Detail of the ERROR result synthesized for an expired OUT path.
pub const PATH_TIMEOUT_DETAIL: &str = "Path timeout.";
/// Detail of the ERROR result answering OUT paths still open at close.
pub const PATH_FLUSHED_DETAIL: &str = "Path flushed on close.";

/// The task owning one extension (or the engine) together with its path
/// table. Everything touching the table runs on this task.
pub(crate) struct ExtensionThread {
    core: ExtensionCore,
    ext: Box<dyn Extension>,
    rx: UnboundedReceiver<ThreadMsg>,
    in_path_timer: Timer,
    out_path_timer: Timer,
}

impl ExtensionThread {
    pub(crate) fn new(
        core: ExtensionCore,
        ext: Box<dyn Extension>,
        rx: UnboundedReceiver<ThreadMsg>,
    ) -> Self {
        let interval = Duration::from_micros(core.path_table.timeouts().check_interval_us);
        let mut in_path_timer = Timer::new(interval, TimerRepeat::Forever, true);
        let mut out_path_timer = Timer::new(interval, TimerRepeat::Forever, true);
        if matches!(core.path_table.attach_to(), AttachTo::Engine(_)) {
            in_path_timer.close();
            out_path_timer.close();
        }
        Self { core, ext, rx, in_path_timer, out_path_timer }
    }

    pub(crate) async fn run(mut self) {
        info!(extension = %self.core.loc, "extension started");
        self.ext.on_start(&mut ExtensionEnv::new(&mut self.core)).await;

        let done = loop {
            tokio::select! {
                tmsg = self.rx.recv() => match tmsg {
                    Some(ThreadMsg::Msg(msg)) => {
                        handle_in_msg(&mut self.core, self.ext.as_mut(), msg).await;
                    }
                    Some(ThreadMsg::Client { msg, reply }) => {
                        let outcome = if self.core.closing {
                            Err(RuntimeError::Closed)
                        } else {
                            dispatch_msg(&mut self.core, msg)
                        };
                        let _ = reply.send(outcome);
                    }
                    Some(ThreadMsg::Close(done)) => break Some(done),
                    None => break None,
                },
                _ = self.in_path_timer.tick() => self.sweep_in_paths(),
                _ = self.out_path_timer.tick() => self.sweep_out_paths().await,
            }
        };

        self.close().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn sweep_in_paths(&mut self) {
        let removed = self.core.path_table.remove_expired_in_paths();
        if removed > 0 {
            debug!(target: "path", extension = %self.core.loc, removed, "expired in paths removed");
        }
    }

    /// Answer every expired OUT path with a timeout error, fed through the
    /// normal result handling so each result handler fires.
    async fn sweep_out_paths(&mut self) {
        let results = self
            .core
            .path_table
            .timeout_results_for_expired_out_paths(PATH_TIMEOUT_DETAIL);
        if results.is_empty() {
            return;
        }
        error!(target: "path", extension = %self.core.loc, "{} paths timeout", results.len());
        PATH_METRICS.paths_timed_out.add(results.len() as u64, &[]);
        for result in results {
            handle_in_msg(&mut self.core, self.ext.as_mut(), result).await;
        }
    }

    /// Stop both path timers, then flush: IN paths go away silently, every
    /// OUT path gets a final ERROR result so nothing waits forever.
    async fn close(&mut self) {
        self.core.closing = true;
        self.in_path_timer.close();
        self.out_path_timer.close();
        self.core.router.unregister(&self.core.loc);

        let cleared = self.core.path_table.clear_in_paths();
        let flushed = self.core.path_table.flush_results_for_out_paths(PATH_FLUSHED_DETAIL);
        if cleared + flushed.len() > 0 {
            debug!(
                target: "path",
                extension = %self.core.loc,
                in_paths = cleared,
                out_paths = flushed.len(),
                "flushing paths on close"
            );
            PATH_METRICS.paths_flushed.add((cleared + flushed.len()) as u64, &[]);
        }
        for result in flushed {
            handle_result(&mut self.core, result);
        }

        self.ext.on_stop(&mut ExtensionEnv::new(&mut self.core)).await;
        self.core.path_table.check_empty();
        trace!(extension = %self.core.loc, "extension stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::extension::test_support::*;
    use crate::message::Message;
    use crate::router::MsgRouter;
    use crate::schema::ExtensionApi;
    use async_trait::async_trait;
    use graph_types::StatusCode;
    use serde_json::json;
    use tokio::sync::oneshot;

    /// Sends `slow_op` to `f` on start and records what comes back.
    struct Caller {
        results: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Extension for Caller {
        async fn on_start(&mut self, env: &mut ExtensionEnv<'_>) {
            let sink = self.results.clone();
            let mut cmd = Message::new_cmd("slow_op").with_result_handler(move |_, r| {
                sink.lock().unwrap().push(r);
            });
            cmd.set_dest(loc("f"));
            env.send_cmd(cmd).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_path_timeout_reaches_handler_once() {
        let router = MsgRouter::new();
        let routes = routing(json!([]));
        let (mut core, rx) = core_at("e", routes.clone(), &router, &ExtensionApi::default());
        core.path_table = crate::path::PathTable::new(
            AttachTo::Extension(loc("e")),
            crate::config::PathTimeoutInfo {
                in_path_timeout_us: 5_000_000,
                out_path_timeout_us: 1_000_000,
                check_interval_us: 100_000,
            },
        );
        let (_f, mut f_rx) = core_at("f", routes, &router, &ExtensionApi::default());
        let results = Arc::new(Mutex::new(Vec::new()));
        let ext = Caller { results: results.clone() };
        let handle = tokio::spawn(ExtensionThread::new(core, Box::new(ext), rx).run());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].status(), StatusCode::Error);
            assert_eq!(results[0].detail(), Some(PATH_TIMEOUT_DETAIL));
            assert!(results[0].is_completed());
        }

        // The real answer shows up late and is dropped.
        let sent = next_msg(&mut f_rx);
        let late = Message::new_result(StatusCode::Ok, sent.cmd_id(), "slow_op");
        router.send(&loc("e"), ThreadMsg::Msg(late)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(results.lock().unwrap().len(), 1);

        let (tx, done) = oneshot::channel();
        router.send(&loc("e"), ThreadMsg::Close(tx)).unwrap();
        done.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_its_detail_under_result_schema() {
        let router = MsgRouter::new();
        let routes = routing(json!([]));
        let api: ExtensionApi = serde_json::from_value(json!({
            "cmd_out": [{"name": "slow_op", "result": {"type": "object", "required": ["value"]}}]
        }))
        .unwrap();
        let (mut core, rx) = core_at("e", routes.clone(), &router, &api);
        core.path_table = crate::path::PathTable::new(
            AttachTo::Extension(loc("e")),
            crate::config::PathTimeoutInfo {
                in_path_timeout_us: 5_000_000,
                out_path_timeout_us: 1_000_000,
                check_interval_us: 100_000,
            },
        );
        let (_f, _f_rx) = core_at("f", routes, &router, &ExtensionApi::default());
        let results = Arc::new(Mutex::new(Vec::new()));
        let ext = Caller { results: results.clone() };
        let handle = tokio::spawn(ExtensionThread::new(core, Box::new(ext), rx).run());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].status(), StatusCode::Error);
            assert_eq!(results[0].detail(), Some(PATH_TIMEOUT_DETAIL));
        }

        let (tx, done) = oneshot::channel();
        router.send(&loc("e"), ThreadMsg::Close(tx)).unwrap();
        done.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_flushes_open_out_paths() {
        let router = MsgRouter::new();
        let routes = routing(json!([]));
        let (core, rx) = core_at("e", routes.clone(), &router, &ExtensionApi::default());
        let (_f, _f_rx) = core_at("f", routes, &router, &ExtensionApi::default());
        let results = Arc::new(Mutex::new(Vec::new()));
        let ext = Caller { results: results.clone() };
        let handle = tokio::spawn(ExtensionThread::new(core, Box::new(ext), rx).run());

        let (tx, done) = oneshot::channel();
        router.send(&loc("e"), ThreadMsg::Close(tx)).unwrap();
        done.await.unwrap();
        handle.await.unwrap();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].detail(), Some(PATH_FLUSHED_DETAIL));
        assert!(!router.is_registered(&loc("e")));
    }
}
