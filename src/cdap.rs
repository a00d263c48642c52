// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Common Distributed Application Protocol (CDAP)
//!
//! CDAP is the request/reply protocol spoken on management flows. A
//! [`CdapInstance`] is bound to one flow; every request it sends carries an
//! invoke ID that stays reserved until the matching reply comes back.
//! Incoming messages are dispatched to a [`CdapHandler`].

use crate::bmp::IdAllocator;
use crate::error::{CdapError, FlowError};
use crate::shim::{FlowId, FlowSubstrate};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Invoke IDs available per instance
const INVOKE_ID_CAPACITY: usize = 1024;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// CDAP operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CdapOpCode {
    /// Create a new object
    Create,
    /// Delete an existing object
    Delete,
    /// Read an object's value
    Read,
    /// Update an object's value
    Write,
    /// Start an operation
    Start,
    /// Stop an operation
    Stop,
}

impl fmt::Display for CdapOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdapOpCode::Create => write!(f, "CREATE"),
            CdapOpCode::Delete => write!(f, "DELETE"),
            CdapOpCode::Read => write!(f, "READ"),
            CdapOpCode::Write => write!(f, "WRITE"),
            CdapOpCode::Start => write!(f, "START"),
            CdapOpCode::Stop => write!(f, "STOP"),
        }
    }
}

/// CDAP message, either a request or a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdapMessage {
    /// Operation code (of the request, for replies)
    pub op_code: CdapOpCode,
    /// Object name
    pub obj_name: String,
    /// Encoded object value
    pub obj_value: Option<Vec<u8>>,
    /// Request/reply correlation
    pub invoke_id: u32,
    /// Result code (0 = success)
    pub result: i32,
    /// Set on replies
    pub is_reply: bool,
}

impl CdapMessage {
    pub fn request(op_code: CdapOpCode, obj_name: &str, obj_value: Option<Vec<u8>>, invoke_id: u32) -> Self {
        Self {
            op_code,
            obj_name: obj_name.to_string(),
            obj_value,
            invoke_id,
            result: 0,
            is_reply: false,
        }
    }

    pub fn reply(op_code: CdapOpCode, invoke_id: u32, result: i32, obj_value: Option<Vec<u8>>) -> Self {
        Self {
            op_code,
            obj_name: String::new(),
            obj_value,
            invoke_id,
            result,
            is_reply: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CdapError> {
        postcard::to_allocvec(self).map_err(|e| CdapError::EncodeFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CdapError> {
        postcard::from_bytes(bytes).map_err(|e| CdapError::DecodeFailed(e.to_string()))
    }
}

/// Receiver of CDAP indications
///
/// Indications are delivered on the instance's reader task, one at a time
/// and in arrival order.
pub trait CdapHandler: Send + Sync {
    fn on_read(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str);

    fn on_write(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str, value: Option<&[u8]>);

    fn on_start(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str);

    fn on_stop(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str);

    fn on_create(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str, value: Option<&[u8]>);

    fn on_delete(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str);

    fn on_reply(
        &self,
        instance: &Arc<CdapInstance>,
        op_code: CdapOpCode,
        invoke_id: u32,
        result: i32,
        value: Option<&[u8]>,
    );
}

#[derive(Debug)]
struct InvokeTable {
    ids: IdAllocator,
    ops: HashMap<u32, CdapOpCode>,
}

/// CDAP endpoint bound to one flow
pub struct CdapInstance {
    id: u64,
    fd: FlowId,
    substrate: Arc<dyn FlowSubstrate>,
    invokes: Mutex<InvokeTable>,
}

impl fmt::Debug for CdapInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdapInstance")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl CdapInstance {
    /// Creates an instance on `fd` with a process-unique id
    pub fn new(substrate: Arc<dyn FlowSubstrate>, fd: FlowId) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            substrate,
            invokes: Mutex::new(InvokeTable {
                ids: IdAllocator::new(INVOKE_ID_CAPACITY, 1),
                ops: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> FlowId {
        self.fd
    }

    /// Number of requests awaiting a reply
    pub fn outstanding(&self) -> usize {
        self.invokes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ops
            .len()
    }

    pub fn send_read(&self, obj_name: &str) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Read, obj_name, None)
    }

    pub fn send_write(&self, obj_name: &str, value: Vec<u8>) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Write, obj_name, Some(value))
    }

    pub fn send_start(&self, obj_name: &str) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Start, obj_name, None)
    }

    pub fn send_stop(&self, obj_name: &str) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Stop, obj_name, None)
    }

    pub fn send_create(&self, obj_name: &str, value: Vec<u8>) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Create, obj_name, Some(value))
    }

    pub fn send_delete(&self, obj_name: &str) -> Result<u32, CdapError> {
        self.send_request(CdapOpCode::Delete, obj_name, None)
    }

    /// Answers an indication received on this instance
    pub fn send_reply(
        &self,
        op_code: CdapOpCode,
        invoke_id: u32,
        result: i32,
        value: Option<Vec<u8>>,
    ) -> Result<(), CdapError> {
        self.send_message(&CdapMessage::reply(op_code, invoke_id, result, value))
    }

    fn send_request(&self, op_code: CdapOpCode, obj_name: &str, value: Option<Vec<u8>>) -> Result<u32, CdapError> {
        let invoke_id = {
            let mut invokes = self.invokes.lock().unwrap_or_else(PoisonError::into_inner);
            let id = invokes
                .ids
                .allocate()
                .ok_or(CdapError::InvokeIdsExhausted(self.id))? as u32;
            invokes.ops.insert(id, op_code);
            id
        };

        let msg = CdapMessage::request(op_code, obj_name, value, invoke_id);
        if let Err(e) = self.send_message(&msg) {
            self.release_invoke_id(invoke_id);
            return Err(e);
        }

        trace!(instance = self.id, %op_code, obj_name, invoke_id, "Sent CDAP request");
        Ok(invoke_id)
    }

    fn send_message(&self, msg: &CdapMessage) -> Result<(), CdapError> {
        let frame = msg.encode()?;
        self.substrate
            .write(self.fd, Bytes::from(frame))
            .map_err(|source| CdapError::SendFailed {
                instance: self.id,
                source,
            })
    }

    fn release_invoke_id(&self, invoke_id: u32) -> Option<CdapOpCode> {
        let mut invokes = self.invokes.lock().unwrap_or_else(PoisonError::into_inner);
        let op = invokes.ops.remove(&invoke_id)?;
        invokes.ids.release(u64::from(invoke_id));
        Some(op)
    }

    /// Reads and dispatches messages until the flow fails
    pub async fn run(self: Arc<Self>, handler: Arc<dyn CdapHandler>) -> FlowError {
        loop {
            let frame = match self.substrate.read(self.fd).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(instance = self.id, fd = %self.fd, error = %e, "CDAP reader stopped");
                    return e;
                }
            };

            let msg = match CdapMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(instance = self.id, error = %e, "Dropping undecodable CDAP message");
                    continue;
                }
            };

            self.dispatch(handler.as_ref(), msg);
        }
    }

    fn dispatch(self: &Arc<Self>, handler: &dyn CdapHandler, msg: CdapMessage) {
        let value = msg.obj_value.as_deref();
        let name = msg.obj_name.as_str();

        if msg.is_reply {
            let op_code = match self.release_invoke_id(msg.invoke_id) {
                Some(op) => op,
                None => {
                    debug!(instance = self.id, invoke_id = msg.invoke_id, "Reply for unknown invoke ID");
                    msg.op_code
                }
            };
            handler.on_reply(self, op_code, msg.invoke_id, msg.result, value);
            return;
        }

        match msg.op_code {
            CdapOpCode::Read => handler.on_read(self, msg.invoke_id, name),
            CdapOpCode::Write => handler.on_write(self, msg.invoke_id, name, value),
            CdapOpCode::Start => handler.on_start(self, msg.invoke_id, name),
            CdapOpCode::Stop => handler.on_stop(self, msg.invoke_id, name),
            CdapOpCode::Create => handler.on_create(self, msg.invoke_id, name, value),
            CdapOpCode::Delete => handler.on_delete(self, msg.invoke_id, name),
        }
    }
}
