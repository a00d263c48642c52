// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! RIB Manager: enrollment
//!
//! Drives an IPCP through `INIT -> PENDING_ENROLL -> ENROLLED` over its
//! management flows. The joiner asks a member to start enrollment; the
//! member answers, pushes the static DIF information (data-transfer
//! constants, an address and a share of its own address pool) and stops
//! enrollment. An address lent to a joiner goes back to the pool unless
//! the joiner confirms the STOP.
//!
//! Asynchronous requests sent on a management flow are remembered until
//! their reply comes back, or until the flow goes away.
//!
//! Locks are always taken in the order session, flows, pending requests,
//! address lender.

use crate::bmp::{AddressPool, AddressRange};
use crate::cdap::{CdapHandler, CdapInstance, CdapOpCode};
use crate::error::{DtError, EnrollmentError};
use crate::pci::DtConstants;
use crate::shim::{FlowId, FlowSubstrate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Object started and stopped around an enrollment
pub const ENROLLMENT_OBJ: &str = "enrollment";

/// Object carrying the static DIF information
pub const STATIC_INFO_OBJ: &str = "static DIF information";

/// Enrollment state of the IPCP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentState {
    Init,
    PendingEnroll,
    Enrolled,
    Operational,
}

impl EnrollmentState {
    /// Whether the IPCP is a DIF member able to enroll others
    pub fn is_member(self) -> bool {
        matches!(self, EnrollmentState::Enrolled | EnrollmentState::Operational)
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentState::Init => write!(f, "INIT"),
            EnrollmentState::PendingEnroll => write!(f, "PENDING_ENROLL"),
            EnrollmentState::Enrolled => write!(f, "ENROLLED"),
            EnrollmentState::Operational => write!(f, "OPERATIONAL"),
        }
    }
}

/// What a member hands a joining IPCP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticInfo {
    pub dtc: DtConstants,
    pub address: u64,
    /// Addresses the joiner may hand out in turn
    pub pool: Option<AddressRange>,
}

/// Brings up the subsystems that depend on the negotiated constants
pub trait DtSetup: Send + Sync {
    fn setup(&self, dtc: &DtConstants, address: u64) -> Result<(), DtError>;

    /// Undoes [`DtSetup::setup`]
    fn teardown(&self);
}

/// An asynchronous request awaiting its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub op_code: CdapOpCode,
    pub obj_name: String,
    /// CDAP instance the request was sent on
    pub instance: u64,
    pub invoke_id: u32,
}

/// Read-only snapshot of the enrollment session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentStatus {
    pub state: EnrollmentState,
    pub address: Option<u64>,
    pub dtc: Option<DtConstants>,
    pub pending_requests: usize,
    pub mgmt_flows: usize,
    /// Range of the pool addresses are lent from
    pub address_pool: Option<AddressRange>,
}

#[derive(Debug)]
struct Session {
    state: EnrollmentState,
    dtc: Option<DtConstants>,
    address: Option<u64>,
    /// Instance the current enrollment runs on
    enrolling: Option<u64>,
}

/// Addresses lent to a joiner, not yet confirmed
#[derive(Debug, Clone, Copy)]
struct Handout {
    address: u64,
    delegated: Option<AddressRange>,
}

#[derive(Debug, Default)]
struct Lender {
    pool: Option<AddressPool>,
    /// Outstanding handouts by CDAP instance
    lent: HashMap<u64, Handout>,
}

/// Enrollment state machine and management flow table
pub struct RibManager {
    session: RwLock<Session>,
    flows: RwLock<HashMap<FlowId, Arc<CdapInstance>>>,
    pending: Mutex<Vec<PendingRequest>>,
    lender: Mutex<Lender>,
    state_tx: watch::Sender<EnrollmentState>,
    substrate: Arc<dyn FlowSubstrate>,
    dt: Arc<dyn DtSetup>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RibManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RibManager")
            .field("status", &self.status())
            .finish()
    }
}

impl RibManager {
    pub fn new(
        substrate: Arc<dyn FlowSubstrate>,
        dt: Arc<dyn DtSetup>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EnrollmentState::Init);

        Arc::new(Self {
            session: RwLock::new(Session {
                state: EnrollmentState::Init,
                dtc: None,
                address: None,
                enrolling: None,
            }),
            flows: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            lender: Mutex::new(Lender::default()),
            state_tx,
            substrate,
            dt,
            shutdown,
        })
    }

    /// Installs the pool addresses are handed out from to joining IPCPs
    pub fn set_address_pool(&self, pool: AddressPool) {
        self.lender_lock().pool = Some(pool);
    }

    pub fn state(&self) -> EnrollmentState {
        self.session_read().state
    }

    /// Own DIF address, once bootstrapped or enrolled
    pub fn address(&self) -> Option<u64> {
        self.session_read().address
    }

    /// Negotiated data-transfer constants
    pub fn dt_constants(&self) -> Option<DtConstants> {
        self.session_read().dtc
    }

    pub fn status(&self) -> EnrollmentStatus {
        let session = self.session_read();
        let mgmt_flows = self.flows.read().unwrap_or_else(PoisonError::into_inner).len();
        let pending_requests = self.pending_lock().len();
        let address_pool = self.lender_lock().pool.as_ref().and_then(AddressPool::bounds);

        EnrollmentStatus {
            state: session.state,
            address: session.address,
            dtc: session.dtc,
            pending_requests,
            mgmt_flows,
            address_pool,
        }
    }

    /// Receiver of every state change
    pub fn subscribe(&self) -> watch::Receiver<EnrollmentState> {
        self.state_tx.subscribe()
    }

    /// Requests still awaiting a reply
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.pending_lock().clone()
    }

    /// Makes this IPCP the first member of a DIF
    pub fn bootstrap(&self, dtc: DtConstants, address: u64) -> Result<(), EnrollmentError> {
        let mut session = self.session_write();
        if session.state != EnrollmentState::Init {
            return Err(invalid_state(EnrollmentState::Init, session.state));
        }

        self.dt
            .setup(&dtc, address)
            .map_err(|e| EnrollmentError::SetupFailed(e.to_string()))?;

        session.dtc = Some(dtc);
        session.address = Some(address);
        self.set_state(&mut session, EnrollmentState::Enrolled);

        info!(address, "Bootstrapped DIF");
        Ok(())
    }

    /// Promotes an enrolled IPCP to operational
    pub fn set_operational(&self) -> Result<(), EnrollmentError> {
        let mut session = self.session_write();
        if session.state != EnrollmentState::Enrolled {
            return Err(invalid_state(EnrollmentState::Enrolled, session.state));
        }
        self.set_state(&mut session, EnrollmentState::Operational);
        Ok(())
    }

    /// Takes a management flow under control
    ///
    /// The first flow added while in `INIT` starts an enrollment on it. A
    /// reader task dispatches the flow's messages until it fails or the IPCP
    /// shuts down, then removes the flow.
    pub fn add_flow(self: &Arc<Self>, fd: FlowId) -> Result<Arc<CdapInstance>, EnrollmentError> {
        let instance = CdapInstance::new(self.substrate.clone(), fd);

        {
            let mut session = self.session_write();
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);

            if session.state == EnrollmentState::Init {
                let mut pending = self.pending_lock();
                let invoke_id = match instance.send_start(ENROLLMENT_OBJ) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(%fd, error = %e, "Failed to start enrollment");
                        drop(pending);
                        drop(flows);
                        drop(session);
                        self.substrate.release(fd);
                        return Err(e.into());
                    }
                };
                pending.push(PendingRequest {
                    op_code: CdapOpCode::Start,
                    obj_name: ENROLLMENT_OBJ.to_string(),
                    instance: instance.id(),
                    invoke_id,
                });

                session.enrolling = Some(instance.id());
                self.set_state(&mut session, EnrollmentState::PendingEnroll);
                info!(%fd, "Enrollment started");
            }

            flows.insert(fd, instance.clone());
        }

        debug!(%fd, instance = instance.id(), "Added management flow");

        let this = self.clone();
        let reader = instance.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {}
                _ = reader.run(this.clone()) => {}
            }
            this.remove_flow(fd);
        });

        Ok(instance)
    }

    /// Drops a management flow and every request pending on it
    ///
    /// Returns false if the flow was not known.
    pub fn remove_flow(&self, fd: FlowId) -> bool {
        let mut session = self.session_write();

        let Some(instance) = self
            .flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd)
        else {
            return false;
        };

        let swept = {
            let mut pending = self.pending_lock();
            let before = pending.len();
            pending.retain(|req| req.instance != instance.id());
            before - pending.len()
        };
        self.reclaim(instance.id());

        if session.enrolling == Some(instance.id()) {
            session.enrolling = None;
            if session.state == EnrollmentState::PendingEnroll {
                warn!(%fd, "Enrollment flow lost, back to INIT");
                self.revert(&mut session);
            }
        }
        drop(session);

        self.substrate.release(fd);
        debug!(%fd, swept, "Removed management flow");
        true
    }

    /// Number of management flows
    pub fn flow_count(&self) -> usize {
        self.flows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn session_read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lender_lock(&self) -> std::sync::MutexGuard<'_, Lender> {
        self.lender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session: &mut Session, state: EnrollmentState) {
        debug!(from = %session.state, to = %state, "Enrollment state change");
        session.state = state;
        self.state_tx.send_replace(state);
    }

    fn reply(&self, instance: &CdapInstance, op_code: CdapOpCode, invoke_id: u32, result: i32) {
        if let Err(e) = instance.send_reply(op_code, invoke_id, result, None) {
            warn!(instance = instance.id(), invoke_id, error = %e, "Failed to send reply");
        }
    }

    /// Drops everything a failed enrollment committed and returns to `INIT`
    fn revert(&self, session: &mut Session) {
        if session.address.is_some() {
            self.dt.teardown();
        }
        session.dtc = None;
        session.address = None;
        session.enrolling = None;
        self.lender_lock().pool = None;
        self.set_state(session, EnrollmentState::Init);
    }

    /// Takes an address, and half of the free addresses when there are
    /// enough, for the joiner on `instance`
    fn lend(&self, instance: u64) -> Result<Handout, EnrollmentError> {
        let mut lender = self.lender_lock();

        // A repeated START on the same flow starts over
        if let Some(previous) = lender.lent.remove(&instance) {
            give_back(&mut lender, previous);
        }

        let pool = lender.pool.as_mut().ok_or(EnrollmentError::AddressPoolExhausted)?;
        let address = pool.allocate().ok_or(EnrollmentError::AddressPoolExhausted)?;
        let handout = Handout {
            address,
            delegated: pool.split(),
        };

        lender.lent.insert(instance, handout);
        Ok(handout)
    }

    /// The joiner on `instance` confirmed its enrollment
    fn settle(&self, instance: u64) {
        if let Some(handout) = self.lender_lock().lent.remove(&instance) {
            debug!(instance, address = handout.address, "Address handout settled");
        }
    }

    /// Returns what was lent to the joiner on `instance`, if anything
    fn reclaim(&self, instance: u64) {
        let mut lender = self.lender_lock();
        if let Some(handout) = lender.lent.remove(&instance) {
            give_back(&mut lender, handout);
            debug!(instance, address = handout.address, "Address handout reclaimed");
        }
    }

    /// Sends the static information and the end of enrollment to a joiner
    fn push_static_info(&self, instance: &CdapInstance, info: &StaticInfo) -> Result<(), EnrollmentError> {
        let value = postcard::to_allocvec(info)
            .map_err(|e| EnrollmentError::DecodeFailed(e.to_string()))?;

        let mut pending = self.pending_lock();

        let invoke_id = instance.send_write(STATIC_INFO_OBJ, value)?;
        pending.push(PendingRequest {
            op_code: CdapOpCode::Write,
            obj_name: STATIC_INFO_OBJ.to_string(),
            instance: instance.id(),
            invoke_id,
        });

        let invoke_id = instance.send_stop(ENROLLMENT_OBJ)?;
        pending.push(PendingRequest {
            op_code: CdapOpCode::Stop,
            obj_name: ENROLLMENT_OBJ.to_string(),
            instance: instance.id(),
            invoke_id,
        });

        Ok(())
    }
}

fn give_back(lender: &mut Lender, handout: Handout) {
    if let Some(pool) = lender.pool.as_mut() {
        pool.release(handout.address);
        if let Some(range) = handout.delegated {
            pool.release_range(range);
        }
    }
}

fn invalid_state(expected: EnrollmentState, actual: EnrollmentState) -> EnrollmentError {
    EnrollmentError::InvalidState {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

impl CdapHandler for RibManager {
    fn on_read(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str) {
        debug!(obj_name, "Unhandled READ");
        self.reply(instance, CdapOpCode::Read, invoke_id, -1);
    }

    fn on_write(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str, value: Option<&[u8]>) {
        let mut session = self.session_write();

        if session.state != EnrollmentState::PendingEnroll || obj_name != STATIC_INFO_OBJ {
            warn!(state = %session.state, obj_name, "Unexpected WRITE");
            self.reply(instance, CdapOpCode::Write, invoke_id, -1);
            return;
        }

        let info = match value.map(|v| postcard::from_bytes::<StaticInfo>(v)) {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                error!(error = %e, "Failed to decode static DIF information");
                self.revert(&mut session);
                self.reply(instance, CdapOpCode::Write, invoke_id, -1);
                return;
            }
            None => {
                error!("Static DIF information carries no value");
                self.revert(&mut session);
                self.reply(instance, CdapOpCode::Write, invoke_id, -1);
                return;
            }
        };

        if let Err(e) = self.dt.setup(&info.dtc, info.address) {
            error!(error = %e, "Failed to set up data transfer");
            self.revert(&mut session);
            self.reply(instance, CdapOpCode::Write, invoke_id, -1);
            return;
        }

        session.dtc = Some(info.dtc);
        session.address = Some(info.address);
        self.lender_lock().pool = info.pool.map(|r| AddressPool::new(r.first, r.last));
        info!(address = info.address, pool = ?info.pool, "Received static DIF information");

        self.reply(instance, CdapOpCode::Write, invoke_id, 0);
    }

    fn on_start(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str) {
        let session = self.session_read();

        if !session.state.is_member() || obj_name != ENROLLMENT_OBJ {
            warn!(state = %session.state, obj_name, "Unexpected START");
            self.reply(instance, CdapOpCode::Start, invoke_id, -1);
            return;
        }

        let Some(dtc) = session.dtc else {
            error!("Member without data-transfer constants");
            self.reply(instance, CdapOpCode::Start, invoke_id, -1);
            return;
        };

        let handout = match self.lend(instance.id()) {
            Ok(handout) => handout,
            Err(e) => {
                warn!(instance = instance.id(), error = %e, "Cannot enroll joining IPCP");
                self.reply(instance, CdapOpCode::Start, invoke_id, -1);
                return;
            }
        };

        self.reply(instance, CdapOpCode::Start, invoke_id, 0);

        let info = StaticInfo {
            dtc,
            address: handout.address,
            pool: handout.delegated,
        };
        match self.push_static_info(instance, &info) {
            Ok(()) => info!(
                instance = instance.id(),
                address = info.address,
                pool = ?info.pool,
                "Enrolling new member"
            ),
            Err(e) => {
                error!(instance = instance.id(), error = %e, "Failed to push static DIF information");
                self.reclaim(instance.id());
            }
        }
    }

    fn on_stop(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str) {
        let mut session = self.session_write();

        if session.state != EnrollmentState::PendingEnroll || obj_name != ENROLLMENT_OBJ {
            warn!(state = %session.state, obj_name, "Unexpected STOP");
            self.reply(instance, CdapOpCode::Stop, invoke_id, -1);
            return;
        }

        if session.dtc.is_none() {
            warn!("Enrollment stopped before static DIF information arrived");
        }

        session.enrolling = None;
        self.set_state(&mut session, EnrollmentState::Enrolled);
        info!(address = ?session.address, "Enrolled");

        self.reply(instance, CdapOpCode::Stop, invoke_id, 0);
    }

    fn on_create(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str, _: Option<&[u8]>) {
        debug!(obj_name, "Unhandled CREATE");
        self.reply(instance, CdapOpCode::Create, invoke_id, -1);
    }

    fn on_delete(&self, instance: &Arc<CdapInstance>, invoke_id: u32, obj_name: &str) {
        debug!(obj_name, "Unhandled DELETE");
        self.reply(instance, CdapOpCode::Delete, invoke_id, -1);
    }

    fn on_reply(
        &self,
        instance: &Arc<CdapInstance>,
        op_code: CdapOpCode,
        invoke_id: u32,
        result: i32,
        _: Option<&[u8]>,
    ) {
        let mut pending = self.pending_lock();

        let Some(idx) = pending
            .iter()
            .position(|req| req.instance == instance.id() && req.invoke_id == invoke_id)
        else {
            debug!(instance = instance.id(), invoke_id, %op_code, "Ignoring unmatched reply");
            return;
        };

        let req = pending.remove(idx);
        if result != 0 {
            warn!(op = %req.op_code, obj = %req.obj_name, result, "Request failed");
        } else {
            debug!(op = %req.op_code, obj = %req.obj_name, "Request completed");
        }

        match (req.op_code, result) {
            (CdapOpCode::Stop, 0) => self.settle(req.instance),
            (CdapOpCode::Write | CdapOpCode::Stop, _) if result != 0 => self.reclaim(req.instance),
            _ => {}
        }
    }
}
