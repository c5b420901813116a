use graph_types::{ResultReturnPolicy, StatusCode};
use tracing::{debug, trace, warn};

use crate::error::RuntimeError;
use crate::extension::ExtensionCore;
use crate::logger::PATH_METRICS;
use crate::message::Message;
use crate::path::{PathId, PathType};
use crate::router::ThreadMsg;

/// Detail of the ERROR result answering a command whose destination has
/// no running extension.
pub const EXTENSION_NOT_FOUND_DETAIL: &str = "Extension not found.";

/// Route one message leaving `core`'s extension.
///
/// Commands and data without explicit destinations follow the graph; a
/// name the graph does not route is a [`RuntimeError::MsgNotConnected`].
/// Results ignore any destination they carry and travel back along their
/// IN path; a result whose path is gone, or whose group is still waiting
/// for siblings, is swallowed without error.
pub(crate) fn dispatch_msg(core: &mut ExtensionCore, mut msg: Message) -> Result<(), RuntimeError> {
    msg.src_loc = core.loc.clone();

    if msg.msg_type.is_result() {
        msg.clear_dests();
        return dispatch_result(core, msg);
    }

    for dest in &mut msg.dest_locs {
        core.routing.normalize(dest);
    }
    core.check_schema(&mut msg, true)?;

    let msg_type = msg.msg_type;
    let (mut outgoing, policy) = resolve_destinations(core, msg)?;

    // Every OUT path exists before the first copy leaves, so no result can
    // beat its own bookkeeping.
    if msg_type.is_cmd() && core.kinds.tracks_paths(msg_type) {
        let ids: Vec<PathId> = outgoing
            .iter_mut()
            .map(|cmd| core.path_table.add_out_path(cmd))
            .collect();
        PATH_METRICS.paths_created.add(ids.len() as u64, &[]);
        if let Some(group) = core.path_table.create_path_group(PathType::Out, policy, &ids) {
            trace!(
                extension = %core.loc,
                ?group,
                %policy,
                members = ids.len(),
                "out paths grouped"
            );
        }
    }

    for msg in outgoing {
        deliver(core, msg);
    }
    Ok(())
}

/// One message per destination, plus the merge policy of their results.
/// Copies beyond the first are cloned as new messages; commands all keep
/// pointing at the id the sender knows them by.
fn resolve_destinations(
    core: &ExtensionCore,
    mut msg: Message,
) -> Result<(Vec<Message>, ResultReturnPolicy), RuntimeError> {
    let origin = if msg.parent_cmd_id.is_empty() {
        msg.cmd_id.clone()
    } else {
        msg.parent_cmd_id.clone()
    };
    let chain = |m: &mut Message| {
        if m.msg_type.is_cmd() && m.cmd_id != origin {
            m.parent_cmd_id = origin.clone();
        }
    };

    if !msg.dest_locs.is_empty() {
        let dests = std::mem::take(&mut msg.dest_locs);
        let mut outgoing = Vec::with_capacity(dests.len());
        for (i, dest) in dests.into_iter().enumerate() {
            let mut m = if i == 0 { msg.clone() } else { core.kinds.clone_msg(&msg) };
            m.set_dest(dest);
            chain(&mut m);
            outgoing.push(m);
        }
        return Ok((outgoing, ResultReturnPolicy::default()));
    }

    let Some(info) = core.routing.lookup(&core.loc, msg.msg_type, &msg.name) else {
        warn!(
            extension = %core.loc,
            msg_type = %msg.msg_type,
            name = %msg.name,
            "message is not connected"
        );
        return Err(RuntimeError::MsgNotConnected { msg_type: msg.msg_type, name: msg.name });
    };

    let mut outgoing = Vec::with_capacity(info.dests.len());
    for (i, dest) in info.dests.iter().enumerate() {
        let base = if i == 0 { msg.clone() } else { core.kinds.clone_msg(&msg) };
        let mut m = match &dest.msg_conversion {
            Some(conversion) => {
                let mut converted = conversion.convert_msg(&base)?;
                converted.result_conversion = conversion.result_conversion().cloned();
                converted
            }
            None => base,
        };
        m.set_dest(dest.loc.clone());
        chain(&mut m);
        outgoing.push(m);
    }
    Ok((outgoing, info.policy))
}

fn dispatch_result(core: &mut ExtensionCore, mut result: Message) -> Result<(), RuntimeError> {
    let Some(id) = core.path_table.find_path_from_cmd_id(PathType::In, &result.cmd_id) else {
        debug!(
            extension = %core.loc,
            cmd_id = %result.cmd_id,
            "no in path for returned result, dropped"
        );
        PATH_METRICS.results_dropped.add(1, &[]);
        return Ok(());
    };
    if let Some(path) = core.path_table.path(id) {
        result.name = path.cmd_name().to_string();
    }
    if let Err(e) = core.check_schema(&mut result, true) {
        warn!(extension = %core.loc, cmd = %result.name, "returned result marked as error: {e}");
        result.status = StatusCode::Error;
    }

    let remove_path = result.is_final;
    core.path_table.set_result(PathType::In, &result);
    match core.path_table.determine_actual_cmd_result(PathType::In, id, remove_path) {
        Some(actual) => deliver(core, actual),
        None => trace!(
            extension = %core.loc,
            cmd_id = %result.cmd_id,
            "result cached until its group settles"
        ),
    }
    Ok(())
}

fn deliver(core: &ExtensionCore, msg: Message) {
    let Err(msg) = core.router.deliver(msg) else {
        return;
    };
    let dest = msg.dest_locs.first().cloned().unwrap_or_default();
    if !msg.msg_type.is_cmd() {
        warn!(
            extension = %core.loc,
            %dest,
            msg_type = %msg.msg_type,
            name = %msg.name,
            "no extension at destination, dropped"
        );
        return;
    }

    warn!(
        extension = %core.loc,
        %dest,
        cmd = %msg.name,
        "no extension at destination, answering with an error"
    );
    let mut result = Message::error_result(&msg.cmd_id, &msg.name, EXTENSION_NOT_FOUND_DETAIL);
    result.src_loc = dest;
    result.set_dest(core.loc.clone());
    if core.router.send(&core.loc, ThreadMsg::Msg(result)).is_err() {
        debug!(extension = %core.loc, cmd_id = %msg.cmd_id, "sender is gone, error result dropped");
    }
}
