//! Protocol buffer message types for the hub/unit wire.
//!
//! These are hand-written prost derives; `proto/taskplane.proto` is the
//! schema of record and field numbers here MUST stay in sync with it.
//! Keeping the structs in-tree avoids a `protoc` build dependency while
//! preserving the exact wire encoding.
//!
//! Requests ([`HubToUnit`]) flow hub → unit, replies ([`UnitToHub`]) flow
//! back. Every message carries `req_id`; replies additionally carry a
//! monotonic [`Timestamp`] which is always present.

use prost::Message;

use crate::error::ErrorKind;

/// Bound on a folder name, terminator included: names must be shorter
/// than this many bytes.
pub const FOLDER_NAME_MAX: usize = 32;

/// Bound on a folder path, terminator included.
pub const FOLDER_PATH_MAX: usize = 256;

/// Empty message used for parameterless oneof variants.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Empty {}

/// Reply timestamp from the unit's monotonic clock.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Timestamp {
    /// Whole seconds.
    #[prost(uint64, tag = "1")]
    pub sec: u64,
    /// Nanosecond remainder; millisecond granularity in practice.
    #[prost(uint32, tag = "2")]
    pub nsec: u32,
}

// ---------------------------------------------------------------------
// Requests (hub -> unit)
// ---------------------------------------------------------------------

/// Identity probe.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct InitReq {}

/// Opens a transfer slot.
#[derive(Clone, PartialEq, Message)]
pub struct FileTransferStart {
    /// Destination file name inside the folder.
    #[prost(string, tag = "1")]
    pub filename: String,
    /// Destination folder name.
    #[prost(string, tag = "2")]
    pub folder: String,
    /// Total size the finished file must have.
    #[prost(uint64, tag = "3")]
    pub filesize: u64,
}

/// One chunk of transfer payload.
#[derive(Clone, PartialEq, Message)]
pub struct FileTransferData {
    /// Absolute write offset.
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    /// Chunk bytes.
    #[prost(bytes = "bytes", tag = "2")]
    pub data: bytes::Bytes,
}

/// Finalises a transfer with its expected integrity hash.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct FileTransferEnd {
    /// Expected FNV-1a of the complete file.
    #[prost(uint32, tag = "1")]
    pub fnv1a: u32,
}

/// File-transfer request envelope, keyed by transfer sequence id.
#[derive(Clone, PartialEq, Message)]
pub struct FileTransferReq {
    /// Transfer slot id chosen by the hub.
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    /// Phase-specific payload.
    #[prost(oneof = "file_transfer_req::Sub", tags = "2, 3, 4")]
    pub sub: Option<file_transfer_req::Sub>,
}

/// Oneof payloads of [`FileTransferReq`].
pub mod file_transfer_req {
    /// Transfer phase.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Open the slot.
        #[prost(message, tag = "2")]
        Start(super::FileTransferStart),
        /// Write a chunk.
        #[prost(message, tag = "3")]
        Data(super::FileTransferData),
        /// Verify and close.
        #[prost(message, tag = "4")]
        End(super::FileTransferEnd),
    }
}

/// Folder create/delete/clear request.
#[derive(Clone, PartialEq, Message)]
pub struct FolderCtlReq {
    /// Folder name; must be shorter than [`FOLDER_NAME_MAX`].
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Requested operation.
    #[prost(oneof = "folder_ctl_req::Sub", tags = "2, 3, 4")]
    pub sub: Option<folder_ctl_req::Sub>,
}

/// Oneof payloads of [`FolderCtlReq`].
pub mod folder_ctl_req {
    /// Folder operation selector.
    #[derive(Clone, Copy, PartialEq, Eq, prost::Oneof)]
    pub enum Sub {
        /// Create the folder.
        #[prost(message, tag = "2")]
        Create(super::Empty),
        /// Delete the folder and everything in it.
        #[prost(message, tag = "3")]
        Del(super::Empty),
        /// Empty the folder but keep it.
        #[prost(message, tag = "4")]
        Clear(super::Empty),
    }
}

/// Paginated folder listing request.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct ListFoldersReq {
    /// Entries to skip.
    #[prost(uint32, tag = "1")]
    pub offset: u32,
    /// Maximum entries to return.
    #[prost(uint32, tag = "2")]
    pub limit: u32,
}

/// Starts a task in a folder.
#[derive(Clone, PartialEq, Message)]
pub struct TaskStartReq {
    /// Folder whose directory becomes the working directory.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Command line; the first element is the command.
    #[prost(string, repeated, tag = "2")]
    pub args: Vec<String>,
}

/// Task request envelope, keyed by task id.
#[derive(Clone, PartialEq, Message)]
pub struct TaskReq {
    /// Task id chosen by the hub.
    #[prost(uint32, tag = "1")]
    pub task_id: u32,
    /// Requested operation.
    #[prost(oneof = "task_req::Sub", tags = "2, 3, 4")]
    pub sub: Option<task_req::Sub>,
}

/// Oneof payloads of [`TaskReq`].
pub mod task_req {
    /// Task operation selector.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Spawn the task.
        #[prost(message, tag = "2")]
        Start(super::TaskStartReq),
        /// Await the next output/exit event.
        #[prost(message, tag = "3")]
        Progress(super::Empty),
        /// Terminate and reap the task.
        #[prost(message, tag = "4")]
        Cancel(super::Empty),
    }
}

/// Paginated task-id listing request.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct ListTasksReq {
    /// Ids to skip.
    #[prost(uint32, tag = "1")]
    pub offset: u32,
}

/// Top-level request message.
#[derive(Clone, PartialEq, Message)]
pub struct HubToUnit {
    /// Correlation id echoed by the reply.
    #[prost(uint64, tag = "1")]
    pub req_id: u64,
    /// Request payload.
    #[prost(oneof = "hub_to_unit::Sub", tags = "2, 3, 4, 5, 6, 7")]
    pub sub: Option<hub_to_unit::Sub>,
}

/// Oneof payloads of [`HubToUnit`].
pub mod hub_to_unit {
    /// Request variant.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Identity probe.
        #[prost(message, tag = "2")]
        Init(super::InitReq),
        /// File transfer phase.
        #[prost(message, tag = "3")]
        FileTransfer(super::FileTransferReq),
        /// Folder operation.
        #[prost(message, tag = "4")]
        FolderCtl(super::FolderCtlReq),
        /// Folder listing.
        #[prost(message, tag = "5")]
        ListFolder(super::ListFoldersReq),
        /// Task operation.
        #[prost(message, tag = "6")]
        Task(super::TaskReq),
        /// Task-id listing.
        #[prost(message, tag = "7")]
        ListTasks(super::ListTasksReq),
    }
}

// ---------------------------------------------------------------------
// Replies (unit -> hub)
// ---------------------------------------------------------------------

/// Identity probe reply.
#[derive(Clone, PartialEq, Message)]
pub struct InitResp {
    /// Unit hardware address.
    #[prost(string, tag = "1")]
    pub mac_addr: String,
    /// Unit software version.
    #[prost(string, tag = "2")]
    pub version: String,
}

/// File-transfer phase acknowledgement.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct FileResp {
    /// Whether the phase succeeded.
    #[prost(bool, tag = "1")]
    pub success: bool,
}

/// Folder operation acknowledgement.
#[derive(Clone, PartialEq, Message)]
pub struct FolderCtlResp {
    /// Folder the operation targeted.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Whether the operation succeeded.
    #[prost(bool, tag = "2")]
    pub success: bool,
}

/// Folder listing reply.
#[derive(Clone, PartialEq, Message)]
pub struct ListFoldersResp {
    /// Folder names, reverse key order.
    #[prost(string, repeated, tag = "1")]
    pub entries: Vec<String>,
}

/// One task progress event.
#[derive(Clone, PartialEq, Message)]
pub struct TaskProgressResp {
    /// The event being reported.
    #[prost(oneof = "task_progress_resp::Sub", tags = "1, 2, 3")]
    pub sub: Option<task_progress_resp::Sub>,
    /// Events still queued after this one.
    #[prost(uint32, tag = "4")]
    pub events_left: u32,
}

/// Oneof payloads of [`TaskProgressResp`].
pub mod task_progress_resp {
    /// Progress event variant.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Captured stdout chunk.
        #[prost(bytes = "bytes", tag = "1")]
        Sout(bytes::Bytes),
        /// Captured stderr chunk.
        #[prost(bytes = "bytes", tag = "2")]
        Serr(bytes::Bytes),
        /// Terminal exit status.
        #[prost(int64, tag = "3")]
        ExitStatus(i64),
    }
}

/// Task operation reply.
#[derive(Clone, PartialEq, Message)]
pub struct TaskResp {
    /// Task the reply refers to.
    #[prost(uint32, tag = "1")]
    pub task_id: u32,
    /// Acknowledgement or progress payload.
    #[prost(oneof = "task_resp::Sub", tags = "2, 3")]
    pub sub: Option<task_resp::Sub>,
}

/// Oneof payloads of [`TaskResp`].
pub mod task_resp {
    /// Task reply variant.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Start/cancel acknowledgement.
        #[prost(bool, tag = "2")]
        Success(bool),
        /// Progress event.
        #[prost(message, tag = "3")]
        Progress(super::TaskProgressResp),
    }
}

/// Task-id listing reply.
#[derive(Clone, PartialEq, Message)]
pub struct ListTasksResp {
    /// Known task ids, key order.
    #[prost(uint32, repeated, tag = "1")]
    pub tasks: Vec<u32>,
}

/// Top-level reply message.
#[derive(Clone, PartialEq, Message)]
pub struct UnitToHub {
    /// Correlation id copied from the request.
    #[prost(uint64, tag = "1")]
    pub req_id: u64,
    /// Stamp from the unit's monotonic clock; always present.
    #[prost(message, optional, tag = "2")]
    pub ts: Option<Timestamp>,
    /// Reply payload.
    #[prost(oneof = "unit_to_hub::Sub", tags = "3, 4, 5, 6, 7, 8")]
    pub sub: Option<unit_to_hub::Sub>,
}

/// Oneof payloads of [`UnitToHub`].
pub mod unit_to_hub {
    /// Reply variant.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sub {
        /// Identity probe reply.
        #[prost(message, tag = "3")]
        Init(super::InitResp),
        /// File-transfer acknowledgement.
        #[prost(message, tag = "4")]
        File(super::FileResp),
        /// Folder operation acknowledgement.
        #[prost(message, tag = "5")]
        FolderCtl(super::FolderCtlResp),
        /// Folder listing.
        #[prost(message, tag = "6")]
        ListFolder(super::ListFoldersResp),
        /// Task reply.
        #[prost(message, tag = "7")]
        Task(super::TaskResp),
        /// Task-id listing.
        #[prost(message, tag = "8")]
        ListTasks(super::ListTasksResp),
    }
}

// ---------------------------------------------------------------------
// Encode/decode helpers
// ---------------------------------------------------------------------

/// Encode any wire message to its protobuf bytes.
#[must_use]
pub fn encode_message<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a request frame.
///
/// # Errors
///
/// [`ErrorKind::DecodingFailed`] when the bytes do not parse.
pub fn decode_request(buf: &[u8]) -> Result<HubToUnit, ErrorKind> {
    HubToUnit::decode(buf).map_err(|_| ErrorKind::DecodingFailed)
}

/// Decode a reply frame.
///
/// # Errors
///
/// [`ErrorKind::DecodingFailed`] when the bytes do not parse.
pub fn decode_reply(buf: &[u8]) -> Result<UnitToHub, ErrorKind> {
    UnitToHub::decode(buf).map_err(|_| ErrorKind::DecodingFailed)
}
