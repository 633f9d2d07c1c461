//! Request dispatcher.
//!
//! One loop awaits complete frames from the hub, decodes them, and
//! spawns a handler task per request so a suspending handler (child
//! output, transfer FIFO) never stalls the connection. Every request
//! gets exactly one reply with a mirrored `req_id` and a fresh monotonic
//! timestamp; the only silent outcomes are an undecodable frame (dropped,
//! connection kept) and a reply that failed to stage (promise dropped,
//! peer times out).

use std::rc::Rc;

use bytes::Bytes;
use prost::Message;
use taskplane_core::wire::{
    self, FileResp, FolderCtlResp, HubToUnit, InitResp, ListFoldersResp, ListTasksResp,
    TaskProgressResp, TaskResp, UnitToHub, file_transfer_req, folder_ctl_req, hub_to_unit,
    task_progress_resp, task_req, task_resp, unit_to_hub,
};
use taskplane_core::{ErrorKind, Result};
use tracing::{error, info, warn};

use crate::client::{Promise, UnitClient};
use crate::process::ProcEvent;
use crate::state::UnitState;

/// Hardware address reported by `init`.
pub const UNIT_MAC_ADDR: &str = "DE:AD:BE:EF:00:01";

/// Software version reported by `init`.
pub const UNIT_VERSION: &str = "0.0.0";

/// Serve requests until the hub disconnects or stop is requested.
///
/// # Errors
///
/// Returns the transport error that killed the connection; a clean peer
/// close is `Ok`.
pub async fn run(state: Rc<UnitState>, mut client: UnitClient) -> Result<()> {
    let stop = state.slots.stop_token();
    loop {
        state.slots.reap();
        tokio::select! {
            () = stop.cancelled() => {
                info!("dispatcher stopping on request");
                return Ok(());
            }
            next = client.next_request() => match next {
                None => {
                    info!("hub closed the connection");
                    return Ok(());
                }
                Some(Err(err)) => {
                    error!("connection failed: {err}");
                    return Err(err);
                }
                Some(Ok(promise)) => {
                    let handler_state = state.clone();
                    state.slots.spawn(handle_frame(handler_state, promise));
                }
            },
        }
    }
}

/// Decode, route, and answer a single frame.
///
/// The handler races the stop token, so a request suspended on child
/// output or slot I/O resolves as stopped during shutdown instead of
/// pinning the task group. Its promise drops unanswered.
async fn handle_frame(state: Rc<UnitState>, promise: Promise) {
    let msg = match wire::decode_request(&promise.data) {
        Ok(msg) => msg,
        Err(_) => {
            // A frame we cannot parse is dropped; the connection stays.
            error!("dropping undecodable frame of {} bytes", promise.data.len());
            return;
        }
    };
    let req_id = msg.req_id;
    let stop = state.slots.stop_token();
    let reply = tokio::select! {
        reply = on_msg(&state, msg) => reply,
        () = stop.cancelled() => {
            info!("request {req_id} abandoned on shutdown");
            return;
        }
    };
    send_reply(&state, promise, &reply);
}

/// Stage the encoded reply in the scratch arena and fulfil the promise.
fn send_reply(state: &UnitState, promise: Promise, reply: &UnitToHub) {
    let len = reply.encoded_len();
    let Some(span) = state.arena.borrow_mut().alloc(len, 1) else {
        error!("memory allocation failed for {len}-byte reply, dropping promise");
        return;
    };
    {
        let mut arena = state.arena.borrow_mut();
        let mut buf = arena.get_mut(span);
        if let Err(err) = reply.encode(&mut buf) {
            error!("encoding error: {err}");
            arena.release(span);
            return;
        }
    }
    let payload = Bytes::copy_from_slice(state.arena.borrow().get(span));
    if promise.fulfill(payload).is_err() {
        warn!("reply writer is gone");
    }
    state.arena.borrow_mut().release(span);
}

/// Empty reply skeleton with mirrored `req_id` and a fresh timestamp.
fn prepare_reply(state: &UnitState, req_id: u64) -> UnitToHub {
    UnitToHub {
        req_id,
        ts: Some(state.clock.timestamp()),
        sub: None,
    }
}

/// Route one decoded request to its subsystem and build the reply.
async fn on_msg(state: &UnitState, msg: HubToUnit) -> UnitToHub {
    let req_id = msg.req_id;
    let mut reply = prepare_reply(state, req_id);
    match msg.sub {
        Some(hub_to_unit::Sub::Init(_)) => {
            info!("received init message");
            reply.sub = Some(unit_to_hub::Sub::Init(InitResp {
                mac_addr: UNIT_MAC_ADDR.to_owned(),
                version: UNIT_VERSION.to_owned(),
            }));
        }
        Some(hub_to_unit::Sub::FileTransfer(ftr)) => {
            let result = handle_file_transfer(state, ftr.seq, ftr.sub).await;
            if let Err(err) = &result {
                error!("file transfer request failed: {err}");
            }
            reply.sub = Some(unit_to_hub::Sub::File(FileResp {
                success: result.is_ok(),
            }));
        }
        Some(hub_to_unit::Sub::FolderCtl(fcr)) => {
            let result = handle_folder_ctl(state, &fcr.folder, fcr.sub).await;
            if let Err(err) = &result {
                error!("folder_ctl for '{}' failed: {err}", fcr.folder);
            }
            reply.sub = Some(unit_to_hub::Sub::FolderCtl(FolderCtlResp {
                folder: fcr.folder,
                success: result.is_ok(),
            }));
        }
        Some(hub_to_unit::Sub::ListFolder(lfr)) => {
            info!(
                "list_folder request: offset={}, limit={}",
                lfr.offset, lfr.limit
            );
            let entries: Vec<String> = state
                .folders
                .names()
                .into_iter()
                .rev()
                .skip(lfr.offset as usize)
                .take(lfr.limit as usize)
                .collect();
            reply.sub = Some(unit_to_hub::Sub::ListFolder(ListFoldersResp { entries }));
        }
        Some(hub_to_unit::Sub::Task(treq)) => {
            reply.sub = Some(unit_to_hub::Sub::Task(
                handle_task(state, treq.task_id, treq.sub).await,
            ));
        }
        Some(hub_to_unit::Sub::ListTasks(ltr)) => {
            info!("list_tasks request: offset={}", ltr.offset);
            reply.sub = Some(unit_to_hub::Sub::ListTasks(ListTasksResp {
                tasks: state.procs.list(ltr.offset),
            }));
        }
        None => {
            warn!("request {req_id} carries no recognised payload");
        }
    }
    reply
}

async fn handle_file_transfer(
    state: &UnitState,
    seq: u32,
    sub: Option<file_transfer_req::Sub>,
) -> Result<()> {
    match sub {
        Some(file_transfer_req::Sub::Start(start)) => {
            info!(
                "file_transfer start: seq={seq} folder='{}' filename='{}' filesize={}",
                start.folder, start.filename, start.filesize
            );
            state
                .transfer_start(seq, &start.folder, &start.filename, start.filesize)
                .await
        }
        Some(file_transfer_req::Sub::Data(data)) => {
            info!(
                "file_transfer data: seq={seq} offset={} len={}",
                data.offset,
                data.data.len()
            );
            state.transfer_data(seq, data.offset, &data.data).await
        }
        Some(file_transfer_req::Sub::End(end)) => {
            info!("file_transfer end: seq={seq} fnv1a={:08x}", end.fnv1a);
            state.transfer_end(seq, end.fnv1a).await
        }
        None => {
            warn!("file_transfer request without a phase");
            Err(ErrorKind::InputError)
        }
    }
}

async fn handle_folder_ctl(
    state: &UnitState,
    folder: &str,
    sub: Option<folder_ctl_req::Sub>,
) -> Result<()> {
    match sub {
        Some(folder_ctl_req::Sub::Create(_)) => {
            info!("folder_ctl create '{folder}'");
            state.folders.create(folder).await
        }
        Some(folder_ctl_req::Sub::Del(_)) => {
            info!("folder_ctl delete '{folder}'");
            state.folder_delete(folder).await
        }
        Some(folder_ctl_req::Sub::Clear(_)) => {
            info!("folder_ctl clear '{folder}'");
            state.folder_clear(folder).await
        }
        None => {
            warn!("folder_ctl request without an operation");
            Err(ErrorKind::InputError)
        }
    }
}

async fn handle_task(state: &UnitState, task_id: u32, sub: Option<task_req::Sub>) -> TaskResp {
    match sub {
        Some(task_req::Sub::Start(start)) => {
            info!("task start: id={task_id} folder='{}'", start.folder);
            let result = state.task_start(task_id, &start.folder, &start.args).await;
            if let Err(err) = &result {
                error!("task start {task_id} failed: {err}");
            }
            TaskResp {
                task_id,
                sub: Some(task_resp::Sub::Success(result.is_ok())),
            }
        }
        Some(task_req::Sub::Progress(_)) => {
            info!("task progress: id={task_id}");
            match state.task_progress(task_id).await {
                Ok(report) => {
                    let sub = match report.event {
                        ProcEvent::Stdout(chunk) => task_progress_resp::Sub::Sout(chunk),
                        ProcEvent::Stderr(chunk) => task_progress_resp::Sub::Serr(chunk),
                        ProcEvent::Exit(status) => task_progress_resp::Sub::ExitStatus(status),
                    };
                    info!(
                        "task {task_id}: reporting progress, {} events left",
                        report.events_left
                    );
                    TaskResp {
                        task_id,
                        sub: Some(task_resp::Sub::Progress(TaskProgressResp {
                            sub: Some(sub),
                            events_left: report.events_left,
                        })),
                    }
                }
                Err(err) => {
                    error!("task progress {task_id} failed: {err}");
                    TaskResp {
                        task_id,
                        sub: Some(task_resp::Sub::Success(false)),
                    }
                }
            }
        }
        Some(task_req::Sub::Cancel(_)) => {
            info!("task cancel: id={task_id}");
            let result = state.task_cancel(task_id).await;
            if let Err(err) = &result {
                error!("task cancel {task_id} failed: {err}");
            }
            TaskResp {
                task_id,
                sub: Some(task_resp::Sub::Success(result.is_ok())),
            }
        }
        None => {
            warn!("task request without an operation");
            TaskResp {
                task_id,
                sub: Some(task_resp::Sub::Success(false)),
            }
        }
    }
}
