//! Scripted-protocol test harness.
//!
//! Test scenarios live as plain-text scripts next to the tests:
//!
//! ```text
//! # case title
//! > <req_id> <msg_type> key:value ...     send a request
//! < <req_id> <msg_type> key:value ...     expect a reply, match fields
//! | <check> key:value ...                 executor-side check
//! ```
//!
//! Blank lines separate cases. A `data:@file` value inlines a file from
//! the `data/` directory beside the scripts; an `offset:N` field slices
//! that file from byte `N` (and still travels as the write offset).
//!
//! Each case boots a fresh unit over a real localhost socket with a
//! temporary work directory; the test body plays the hub.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use taskplane_core::wire::{
    self, Empty, FileTransferData, FileTransferEnd, FileTransferReq, FileTransferStart,
    FolderCtlReq, HubToUnit, InitReq, ListFoldersReq, ListTasksReq, TaskReq, TaskStartReq,
    UnitToHub, file_transfer_req, folder_ctl_req, hub_to_unit, task_progress_resp, task_req,
    task_resp, unit_to_hub,
};
use taskplane_core::{CobsCodec, Fnv1a};
use taskplane_unit::client::UnitClient;
use taskplane_unit::dispatch;
use taskplane_unit::state::UnitState;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------
// Script model
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FieldsMap {
    fields: BTreeMap<String, String>,
}

impl FieldsMap {
    fn take(&mut self, name: &str) -> String {
        self.try_take(name)
            .unwrap_or_else(|| panic!("missing field '{name}'"))
    }

    fn try_take(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    fn peek(&self, name: &str) -> Option<&String> {
        self.fields.get(name)
    }

    fn finalize(&self) {
        assert!(
            self.fields.is_empty(),
            "leftover fields in command: {:?}",
            self.fields
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Init,
    FileTransferStart,
    FileTransferData,
    FileTransferEnd,
    FolderCtl,
    TaskStart,
    TaskProgress,
    TaskCancel,
    ListFolder,
    ListTasks,
    File,
    Task,
}

impl MessageType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "init" => Self::Init,
            "file_transfer_start" => Self::FileTransferStart,
            "file_transfer_data" => Self::FileTransferData,
            "file_transfer_end" => Self::FileTransferEnd,
            "folder_ctl" => Self::FolderCtl,
            "task_start" => Self::TaskStart,
            "task_progress" => Self::TaskProgress,
            "task_cancel" => Self::TaskCancel,
            "list_folder" => Self::ListFolder,
            "list_tasks" => Self::ListTasks,
            "file" => Self::File,
            "task" => Self::Task,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    Checksum,
    Exists,
    NotExists,
    FolderEmpty,
    ActiveTransfers,
    ActiveTasks,
    Skip,
}

impl CheckKind {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "checksum" => Self::Checksum,
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            "folder_empty" => Self::FolderEmpty,
            "active_transfers" => Self::ActiveTransfers,
            "active_tasks" => Self::ActiveTasks,
            "skip" => Self::Skip,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
enum Command {
    Send {
        req_id: u64,
        msg_type: MessageType,
        fields: FieldsMap,
    },
    Recv {
        req_id: u64,
        msg_type: MessageType,
        fields: FieldsMap,
    },
    Check {
        kind: CheckKind,
        fields: FieldsMap,
    },
}

#[derive(Debug, Clone, Default)]
struct TestCase {
    title: String,
    commands: Vec<Command>,
}

// ---------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------

/// Split on a delimiter, honouring backslash escapes, dropping empties.
fn split_tokens(line: &str, delim: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut escape = false;
    for ch in line.chars() {
        if escape {
            current.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        if ch == delim {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                tokens.push(trimmed.to_owned());
            }
            current.clear();
            continue;
        }
        current.push(ch);
    }
    if escape {
        current.push('\\');
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        tokens.push(trimmed.to_owned());
    }
    tokens
}

fn parse_fields(tokens: &[String], start: usize, line_num: usize) -> FieldsMap {
    let mut fields = BTreeMap::new();
    for token in &tokens[start..] {
        let Some(colon) = token.find(':') else {
            panic!("line {line_num}: invalid field '{token}'");
        };
        fields.insert(token[..colon].to_owned(), token[colon + 1..].to_owned());
    }
    FieldsMap { fields }
}

/// Inline `data:@file`, slicing from `offset:N` when present.
fn autoload_data(fields: &mut FieldsMap, data_dir: &Path) {
    let Some(value) = fields.peek("data") else {
        return;
    };
    let Some(file) = value.strip_prefix('@') else {
        return;
    };
    let path = data_dir.join(file);
    let contents =
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path:?} failed: {e}"));
    let offset = fields
        .peek("offset")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let sliced = contents
        .get(offset.min(contents.len())..)
        .unwrap_or_default()
        .to_owned();
    fields.fields.insert("data".to_owned(), sliced);
}

fn parse_script(input: &str, data_dir: &Path) -> Vec<TestCase> {
    let mut cases = Vec::new();
    let mut current = TestCase::default();
    let mut seen_command = false;

    for (idx, raw_line) in input.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            if seen_command {
                cases.push(std::mem::take(&mut current));
                seen_command = false;
            }
            continue;
        }
        let (prefix, rest) = line.split_at(1);
        match prefix {
            "#" => {
                if current.title.is_empty() {
                    current.title = rest.trim().to_owned();
                }
            }
            ">" | "<" => {
                let tokens = split_tokens(rest, ' ');
                assert!(
                    tokens.len() >= 2,
                    "line {line_num}: expected req_id and message type"
                );
                let req_id: u64 = tokens[0]
                    .parse()
                    .unwrap_or_else(|_| panic!("line {line_num}: bad req_id '{}'", tokens[0]));
                let msg_type = MessageType::parse(&tokens[1])
                    .unwrap_or_else(|| panic!("line {line_num}: bad message type '{}'", tokens[1]));
                let mut fields = parse_fields(&tokens, 2, line_num);
                autoload_data(&mut fields, data_dir);
                current.commands.push(if prefix == ">" {
                    Command::Send {
                        req_id,
                        msg_type,
                        fields,
                    }
                } else {
                    Command::Recv {
                        req_id,
                        msg_type,
                        fields,
                    }
                });
                seen_command = true;
            }
            "|" => {
                let tokens = split_tokens(rest, ' ');
                assert!(!tokens.is_empty(), "line {line_num}: expected a check kind");
                let kind = CheckKind::parse(&tokens[0])
                    .unwrap_or_else(|| panic!("line {line_num}: bad check kind '{}'", tokens[0]));
                let mut fields = parse_fields(&tokens, 1, line_num);
                autoload_data(&mut fields, data_dir);
                current.commands.push(Command::Check { kind, fields });
                seen_command = true;
            }
            _ => panic!("line {line_num}: expected '#', '>', '<', '|' or a blank line"),
        }
    }
    if seen_command {
        cases.push(current);
    }
    cases
}

// ---------------------------------------------------------------------
// Message building (hub side)
// ---------------------------------------------------------------------

fn build_request(req_id: u64, msg_type: MessageType, mut fields: FieldsMap) -> HubToUnit {
    let sub = match msg_type {
        MessageType::Init => hub_to_unit::Sub::Init(InitReq {}),
        MessageType::FileTransferStart => hub_to_unit::Sub::FileTransfer(FileTransferReq {
            seq: fields.take("seq").parse().expect("seq"),
            sub: Some(file_transfer_req::Sub::Start(FileTransferStart {
                filename: fields.take("filename"),
                folder: fields.take("folder"),
                filesize: fields.take("filesize").parse().expect("filesize"),
            })),
        }),
        MessageType::FileTransferData => hub_to_unit::Sub::FileTransfer(FileTransferReq {
            seq: fields.take("seq").parse().expect("seq"),
            sub: Some(file_transfer_req::Sub::Data(FileTransferData {
                offset: fields.take("offset").parse().expect("offset"),
                data: Bytes::from(fields.take("data").into_bytes()),
            })),
        }),
        MessageType::FileTransferEnd => hub_to_unit::Sub::FileTransfer(FileTransferReq {
            seq: fields.take("seq").parse().expect("seq"),
            sub: Some(file_transfer_req::Sub::End(FileTransferEnd {
                fnv1a: u32::from_str_radix(&fields.take("fnv1a"), 16).expect("fnv1a"),
            })),
        }),
        MessageType::FolderCtl => {
            let folder = fields.take("folder");
            let sub = if fields.try_take("create").is_some() {
                folder_ctl_req::Sub::Create(Empty {})
            } else if fields.try_take("delete").is_some() {
                folder_ctl_req::Sub::Del(Empty {})
            } else if fields.try_take("clear").is_some() {
                folder_ctl_req::Sub::Clear(Empty {})
            } else {
                panic!("folder_ctl command is missing create/delete/clear");
            };
            hub_to_unit::Sub::FolderCtl(FolderCtlReq {
                folder,
                sub: Some(sub),
            })
        }
        MessageType::ListFolder => hub_to_unit::Sub::ListFolder(ListFoldersReq {
            offset: fields.take("offset").parse().expect("offset"),
            limit: fields.take("limit").parse().expect("limit"),
        }),
        MessageType::TaskStart => hub_to_unit::Sub::Task(TaskReq {
            task_id: fields.take("task_id").parse().expect("task_id"),
            sub: Some(task_req::Sub::Start(TaskStartReq {
                folder: fields.take("folder"),
                args: split_tokens(&fields.take("args"), ','),
            })),
        }),
        MessageType::TaskProgress => hub_to_unit::Sub::Task(TaskReq {
            task_id: fields.take("task_id").parse().expect("task_id"),
            sub: Some(task_req::Sub::Progress(Empty {})),
        }),
        MessageType::TaskCancel => hub_to_unit::Sub::Task(TaskReq {
            task_id: fields.take("task_id").parse().expect("task_id"),
            sub: Some(task_req::Sub::Cancel(Empty {})),
        }),
        MessageType::ListTasks => hub_to_unit::Sub::ListTasks(ListTasksReq {
            offset: fields.take("offset").parse().expect("offset"),
        }),
        MessageType::File | MessageType::Task => {
            panic!("'{msg_type:?}' is a reply type, not a request")
        }
    };
    fields.finalize();
    HubToUnit {
        req_id,
        sub: Some(sub),
    }
}

// ---------------------------------------------------------------------
// Reply verification
// ---------------------------------------------------------------------

fn verify_eq(fields: &mut FieldsMap, key: &str, actual: &str, title: &str) {
    if let Some(expected) = fields.try_take(key) {
        assert_eq!(expected, actual, "[{title}] field mismatch: {key}");
    }
}

fn verify_contains(fields: &mut FieldsMap, key: &str, actual: &[u8], title: &str) {
    if let Some(expected) = fields.try_take(key) {
        let actual = String::from_utf8_lossy(actual);
        assert!(
            actual.contains(&expected),
            "[{title}] field {key}: expected '{actual}' to contain '{expected}'"
        );
    }
}

fn verify_reply(
    title: &str,
    req_id: u64,
    msg_type: MessageType,
    mut fields: FieldsMap,
    reply: &UnitToHub,
) {
    assert_eq!(req_id, reply.req_id, "[{title}] req_id mismatch");
    assert!(reply.ts.is_some(), "[{title}] reply is missing its timestamp");

    match msg_type {
        MessageType::Init => {
            let Some(unit_to_hub::Sub::Init(init)) = &reply.sub else {
                panic!("[{title}] expected init reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "mac_addr", &init.mac_addr, title);
            verify_eq(&mut fields, "version", &init.version, title);
        }
        MessageType::File
        | MessageType::FileTransferStart
        | MessageType::FileTransferData
        | MessageType::FileTransferEnd => {
            let Some(unit_to_hub::Sub::File(file)) = &reply.sub else {
                panic!("[{title}] expected file reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "success", &file.success.to_string(), title);
        }
        MessageType::FolderCtl => {
            let Some(unit_to_hub::Sub::FolderCtl(fc)) = &reply.sub else {
                panic!("[{title}] expected folder_ctl reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "folder", &fc.folder, title);
            verify_eq(&mut fields, "success", &fc.success.to_string(), title);
        }
        MessageType::ListFolder => {
            let Some(unit_to_hub::Sub::ListFolder(lf)) = &reply.sub else {
                panic!("[{title}] expected list_folder reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "entries", &lf.entries.join(","), title);
        }
        MessageType::Task | MessageType::TaskStart | MessageType::TaskCancel => {
            let Some(unit_to_hub::Sub::Task(task)) = &reply.sub else {
                panic!("[{title}] expected task reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "task_id", &task.task_id.to_string(), title);
            if let Some(task_resp::Sub::Success(success)) = &task.sub {
                verify_eq(&mut fields, "success", &success.to_string(), title);
            }
        }
        MessageType::TaskProgress => {
            let Some(unit_to_hub::Sub::Task(task)) = &reply.sub else {
                panic!("[{title}] expected task reply, got {:?}", reply.sub);
            };
            verify_eq(&mut fields, "task_id", &task.task_id.to_string(), title);
            let Some(task_resp::Sub::Progress(progress)) = &task.sub else {
                panic!("[{title}] expected a progress payload, got {:?}", task.sub);
            };
            match &progress.sub {
                Some(task_progress_resp::Sub::Sout(chunk)) => {
                    verify_contains(&mut fields, "sout", chunk, title);
                }
                Some(task_progress_resp::Sub::Serr(chunk)) => {
                    verify_contains(&mut fields, "serr", chunk, title);
                }
                Some(task_progress_resp::Sub::ExitStatus(status)) => {
                    verify_eq(&mut fields, "exit_status", &status.to_string(), title);
                }
                None => panic!("[{title}] progress reply without an event"),
            }
            if let Some(expected) = fields.try_take("events_left") {
                assert_eq!(
                    expected,
                    progress.events_left.to_string(),
                    "[{title}] events_left mismatch"
                );
            }
        }
        MessageType::ListTasks => {
            let Some(unit_to_hub::Sub::ListTasks(lt)) = &reply.sub else {
                panic!("[{title}] expected list_tasks reply, got {:?}", reply.sub);
            };
            let joined = lt
                .tasks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            verify_eq(&mut fields, "tasks", &joined, title);
        }
    }
    fields.finalize();
}

// ---------------------------------------------------------------------
// Executor checks
// ---------------------------------------------------------------------

fn take_path(fields: &mut FieldsMap) -> String {
    fields.take("path")
}

async fn run_check(
    title: &str,
    kind: CheckKind,
    mut fields: FieldsMap,
    workdir: &Path,
    state: &UnitState,
) -> bool {
    // Let in-flight handler tasks settle before inspecting state.
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
    match kind {
        CheckKind::Skip => return false,
        CheckKind::Checksum => {
            let path = workdir.join(take_path(&mut fields));
            let expected = u32::from_str_radix(&fields.take("fnv1a"), 16).expect("fnv1a");
            let contents =
                std::fs::read(&path).unwrap_or_else(|e| panic!("[{title}] read {path:?}: {e}"));
            assert_eq!(
                expected,
                Fnv1a::hash(&contents),
                "[{title}] checksum mismatch for {path:?}"
            );
        }
        CheckKind::Exists => {
            let path = workdir.join(take_path(&mut fields));
            assert!(path.exists(), "[{title}] path should exist: {path:?}");
        }
        CheckKind::NotExists => {
            let path = workdir.join(take_path(&mut fields));
            assert!(!path.exists(), "[{title}] path should not exist: {path:?}");
        }
        CheckKind::FolderEmpty => {
            let path = workdir.join(take_path(&mut fields));
            let entries = std::fs::read_dir(&path)
                .unwrap_or_else(|e| panic!("[{title}] read_dir {path:?}: {e}"))
                .count();
            assert_eq!(entries, 0, "[{title}] folder should be empty: {path:?}");
        }
        CheckKind::ActiveTransfers => {
            let expected: usize = fields.take("count").parse().expect("count");
            assert_eq!(
                expected,
                state.transfers.active_count(),
                "[{title}] active transfer count mismatch"
            );
        }
        CheckKind::ActiveTasks => {
            let expected: usize = fields.take("count").parse().expect("count");
            assert_eq!(
                expected,
                state.procs.active_count(),
                "[{title}] active task count mismatch"
            );
        }
    }
    fields.finalize();
    true
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

fn scripts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scripts")
}

async fn run_case(case: &TestCase) {
    let title = case.title.as_str();
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let workdir = tmp.path().join("_work");

    // The test body plays the hub on an ephemeral port.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local_addr").port();

    let state = UnitState::new(workdir.clone());
    state
        .bootstrap()
        .await
        .unwrap_or_else(|e| panic!("[{title}] bootstrap failed: {e}"));

    let accept = tokio::task::spawn_local(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        Framed::new(stream, CobsCodec::new())
    });
    let client = UnitClient::connect("127.0.0.1", port)
        .await
        .unwrap_or_else(|e| panic!("[{title}] connect failed: {e}"));
    let mut hub = accept.await.expect("accept task");

    let dispatcher = {
        let state: Rc<UnitState> = state.clone();
        tokio::task::spawn_local(async move { dispatch::run(state, client).await })
    };

    for command in &case.commands {
        match command.clone() {
            Command::Send {
                req_id,
                msg_type,
                fields,
            } => {
                let request = build_request(req_id, msg_type, fields);
                let payload = Bytes::from(wire::encode_message(&request));
                hub.send(payload)
                    .await
                    .unwrap_or_else(|e| panic!("[{title}] send failed: {e}"));
            }
            Command::Recv {
                req_id,
                msg_type,
                fields,
            } => {
                let frame = tokio::time::timeout(REPLY_TIMEOUT, hub.next())
                    .await
                    .unwrap_or_else(|_| panic!("[{title}] timed out waiting for req {req_id}"))
                    .unwrap_or_else(|| panic!("[{title}] connection closed"))
                    .unwrap_or_else(|e| panic!("[{title}] receive failed: {e}"));
                let reply = wire::decode_reply(&frame)
                    .unwrap_or_else(|e| panic!("[{title}] reply decode failed: {e}"));
                verify_reply(title, req_id, msg_type, fields, &reply);
            }
            Command::Check { kind, fields } => {
                if !run_check(title, kind, fields, &workdir, &state).await {
                    break;
                }
            }
        }
    }

    // Tear the unit down the way a signal would.
    drop(hub);
    let _ = tokio::time::timeout(REPLY_TIMEOUT, dispatcher).await;
    state.shutdown().await;
}

/// Run every case in a script file, each against a fresh unit.
pub async fn run_script_file(name: &str) {
    let dir = scripts_dir();
    let path = dir.join(name);
    let input = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path:?}: {e}"));
    let cases = parse_script(&input, &dir.join("data"));
    assert!(!cases.is_empty(), "script {name} contains no cases");

    tokio::task::LocalSet::new()
        .run_until(async {
            for case in &cases {
                eprintln!("--- case: {}", case.title);
                run_case(case).await;
            }
        })
        .await;
}
