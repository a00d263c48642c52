// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! IPC Process (IPCP) Management
//!
//! Owns the connection manager, the RIB manager and the data-transfer
//! engine of one normal IPCP, and runs the workers that tie them together:
//! the flow acceptor, the management-AE worker handing connections to
//! enrollment, and the data-transfer-AE worker handing flows to the SDU
//! scheduler.

use crate::bmp::AddressPool;
use crate::cacep::{ConcreteSyntax, ConnInfo, PostcardCacep};
use crate::config::IpcpConfiguration;
use crate::connmgr::{AeHandle, ConnectionManager};
use crate::dt::{DataTransfer, DtStatsSnapshot};
use crate::error::{ConnMgrError, EnrollmentError, IpcpError};
use crate::qos::QosSpec;
use crate::ribmgr::{EnrollmentState, EnrollmentStatus, RibManager};
use crate::sdu_sched::SduScheduler;
use crate::shim::{FlowId, FlowSubstrate};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Management AE, speaking CDAP
pub const MGMT_AE: &str = "management";
pub const MGMT_PROTOCOL: &str = "cdap";

/// Data-transfer AE
pub const DT_AE: &str = "dt";
pub const DT_PROTOCOL: &str = "dtp";

/// IPCP operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpcpState {
    /// Components built, workers not running
    Initializing,
    /// Workers running
    Running,
    /// Workers being stopped
    ShuttingDown,
    /// IPCP has shut down
    Shutdown,
}

impl fmt::Display for IpcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcpState::Initializing => write!(f, "INITIALIZING"),
            IpcpState::Running => write!(f, "RUNNING"),
            IpcpState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            IpcpState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Snapshot of an IPCP for reporting
#[derive(Debug, Clone, Serialize)]
pub struct IpcpStatus {
    pub name: String,
    pub state: IpcpState,
    pub enrollment: EnrollmentStatus,
    pub dt: DtStatsSnapshot,
    pub dt_flows: Vec<FlowId>,
}

/// Complete normal IPC Process
pub struct IpcProcess {
    config: IpcpConfiguration,
    state: Mutex<IpcpState>,
    connmgr: Arc<ConnectionManager>,
    rib: Arc<RibManager>,
    dt: Arc<DataTransfer>,
    sched: Arc<SduScheduler>,
    mgmt_ae: AeHandle,
    dt_ae: AeHandle,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for IpcProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcProcess")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("rib", &self.rib)
            .field("dt", &self.dt)
            .finish()
    }
}

impl IpcProcess {
    /// Builds an IPCP on top of `substrate` and registers its AEs
    pub fn new(config: IpcpConfiguration, substrate: Arc<dyn FlowSubstrate>) -> Result<Arc<Self>, IpcpError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let dt = Arc::new(DataTransfer::new(
            substrate.clone(),
            config.dt.reserved_fds,
            config.dt.default_ttl,
        ));
        let rib = RibManager::new(substrate.clone(), dt.clone(), shutdown.child_token());
        let sched = SduScheduler::new(substrate.clone(), dt.clone(), shutdown.child_token());
        let connmgr = Arc::new(ConnectionManager::new(substrate, Arc::new(PostcardCacep)));

        let mgmt_ae = connmgr.register_ae(ConnInfo::new(MGMT_AE, MGMT_PROTOCOL, 1, ConcreteSyntax::Gpb))?;
        let dt_ae = connmgr.register_ae(ConnInfo::new(DT_AE, DT_PROTOCOL, 1, ConcreteSyntax::Fixed))?;

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(IpcpState::Initializing),
            connmgr,
            rib,
            dt,
            sched,
            mgmt_ae,
            dt_ae,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &IpcpConfiguration {
        &self.config
    }

    pub fn state(&self) -> IpcpState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rib(&self) -> &Arc<RibManager> {
        &self.rib
    }

    pub fn dt(&self) -> &Arc<DataTransfer> {
        &self.dt
    }

    pub fn connmgr(&self) -> &Arc<ConnectionManager> {
        &self.connmgr
    }

    /// Own DIF address, once bootstrapped or enrolled
    pub fn address(&self) -> Option<u64> {
        self.rib.address()
    }

    pub fn status(&self) -> IpcpStatus {
        IpcpStatus {
            name: self.config.name.clone(),
            state: self.state(),
            enrollment: self.rib.status(),
            dt: self.dt.stats(),
            dt_flows: self.sched.flows(),
        }
    }

    fn transition(&self, from: &[IpcpState], to: IpcpState) -> Result<(), IpcpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !from.contains(&state) {
            return Err(IpcpError::InvalidLifecycle(state.to_string()));
        }
        *state = to;
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), IpcpError> {
        match self.state() {
            IpcpState::Running => Ok(()),
            other => Err(IpcpError::InvalidLifecycle(other.to_string())),
        }
    }

    /// Spawns the acceptor and the AE workers
    pub fn start(self: &Arc<Self>) -> Result<(), IpcpError> {
        self.transition(&[IpcpState::Initializing], IpcpState::Running)?;

        let acceptor = tokio::spawn(self.connmgr.clone().accept_loop(self.shutdown.child_token()));

        let this = self.clone();
        let mgmt = tokio::spawn(async move { this.mgmt_worker().await });

        let this = self.clone();
        let data = tokio::spawn(async move { this.dt_worker().await });

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([acceptor, mgmt, data]);

        info!(name = %self.config.name, "IPCP started");
        Ok(())
    }

    async fn mgmt_worker(&self) {
        loop {
            let conn = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                conn = self.connmgr.wait_connection(&self.mgmt_ae) => conn,
            };

            match conn {
                Ok(conn) => {
                    debug!(fd = %conn.fd, peer = %conn.peer.ae_name, "New management connection");
                    if let Err(e) = self.rib.add_flow(conn.fd) {
                        warn!(fd = %conn.fd, error = %e, "Failed to add management flow");
                    }
                }
                Err(ConnMgrError::AeClosed(_)) => break,
                Err(e) => warn!(error = %e, "Management AE wait failed"),
            }
        }
    }

    async fn dt_worker(&self) {
        loop {
            let conn = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                conn = self.connmgr.wait_connection(&self.dt_ae) => conn,
            };

            match conn {
                Ok(conn) => {
                    let qc = conn.qos.cube();
                    debug!(fd = %conn.fd, %qc, "New data-transfer connection");
                    self.sched.add(conn.fd, qc);
                }
                Err(ConnMgrError::AeClosed(_)) => break,
                Err(e) => warn!(error = %e, "Data-transfer AE wait failed"),
            }
        }
    }

    /// Makes this IPCP the first member of its DIF
    pub fn bootstrap(&self) -> Result<(), IpcpError> {
        self.rib
            .bootstrap(self.config.dt.constants(), self.config.bootstrap_address)?;
        self.rib.set_address_pool(AddressPool::new(
            self.config.address_pool_start,
            self.config.address_pool_end,
        ));
        Ok(())
    }

    /// Enrolls with the member IPCP `dst_name`, returning the own address
    ///
    /// Each attempt is bounded by the enrollment timeout; failed attempts
    /// are retried with exponential backoff.
    pub async fn enroll(&self, dst_name: &str) -> Result<u64, IpcpError> {
        self.ensure_running()?;

        let max_retries = self.config.enrollment_max_retries;
        let mut backoff = Duration::from_millis(self.config.enrollment_initial_backoff_ms);

        for attempt in 1..=max_retries {
            info!(dst = dst_name, attempt, max_retries, "Enrollment attempt");

            match self.try_enroll(dst_name).await {
                Ok(address) => {
                    info!(dst = dst_name, address, "Enrollment complete");
                    return Ok(address);
                }
                Err(e @ IpcpError::Enrollment(EnrollmentError::InvalidState { .. })) => return Err(e),
                Err(e) => warn!(dst = dst_name, attempt, error = %e, "Enrollment attempt failed"),
            }

            if attempt < max_retries {
                sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(EnrollmentError::Timeout { attempts: max_retries }.into())
    }

    async fn try_enroll(&self, dst_name: &str) -> Result<u64, IpcpError> {
        let state = self.rib.state();
        if state.is_member() {
            return self
                .rib
                .address()
                .ok_or_else(|| EnrollmentError::Rejected(dst_name.to_string()).into());
        }
        if state != EnrollmentState::Init {
            return Err(EnrollmentError::InvalidState {
                expected: EnrollmentState::Init.to_string(),
                actual: state.to_string(),
            }
            .into());
        }

        let limit = self.config.enrollment_timeout();
        let mut states = self.rib.subscribe();

        let conn = timeout(limit, self.connmgr.dial(&self.mgmt_ae, dst_name, QosSpec::default()))
            .await
            .map_err(|_| EnrollmentError::Timeout { attempts: 1 })??;
        self.rib.add_flow(conn.fd)?;

        let outcome = match timeout(limit, states.wait_for(|s| *s != EnrollmentState::PendingEnroll)).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) | Err(_) => None,
        };

        match outcome {
            Some(state) if state.is_member() => self
                .rib
                .address()
                .ok_or_else(|| EnrollmentError::Rejected(dst_name.to_string()).into()),
            Some(_) => {
                self.rib.remove_flow(conn.fd);
                Err(EnrollmentError::Rejected(dst_name.to_string()).into())
            }
            None => {
                self.rib.remove_flow(conn.fd);
                Err(EnrollmentError::Timeout { attempts: 1 }.into())
            }
        }
    }

    /// Opens a data-transfer flow to the neighbor `dst_name`
    ///
    /// The flow is read by the SDU scheduler; its id is what forwarding
    /// entries towards that neighbor point at.
    pub async fn connect_dt(&self, dst_name: &str, qos: QosSpec) -> Result<FlowId, IpcpError> {
        self.ensure_running()?;

        let conn = self.connmgr.dial(&self.dt_ae, dst_name, qos).await?;
        self.sched.add(conn.fd, qos.cube());

        info!(dst = dst_name, fd = %conn.fd, qc = %qos.cube(), "Data-transfer flow up");
        Ok(conn.fd)
    }

    /// Stops the workers, unregisters the AEs and drops all flows
    pub async fn shutdown(&self) -> Result<(), IpcpError> {
        self.transition(
            &[IpcpState::Initializing, IpcpState::Running],
            IpcpState::ShuttingDown,
        )?;

        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "IPCP worker ended abnormally");
            }
        }

        for ae in [&self.mgmt_ae, &self.dt_ae] {
            if let Err(e) = self.connmgr.unregister_ae(ae) {
                debug!(error = %e, "AE already unregistered");
            }
        }
        for fd in self.sched.flows() {
            self.sched.remove(fd);
        }

        self.transition(&[IpcpState::ShuttingDown], IpcpState::Shutdown)?;
        info!(name = %self.config.name, "IPCP shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shim::MemoryFabric;

    fn config(name: &str) -> IpcpConfiguration {
        IpcpConfiguration {
            name: name.to_string(),
            enrollment_timeout_secs: 1,
            enrollment_max_retries: 2,
            enrollment_initial_backoff_ms: 10,
            ..IpcpConfiguration::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let fabric = MemoryFabric::new();
        let ipcp = IpcProcess::new(config("a"), fabric.attach("a")).unwrap();
        assert_eq!(ipcp.state(), IpcpState::Initializing);
        assert_eq!(
            ipcp.connmgr().registered(),
            vec![MGMT_AE.to_string(), DT_AE.to_string()]
        );

        ipcp.start().unwrap();
        assert_eq!(ipcp.state(), IpcpState::Running);
        assert!(ipcp.start().is_err());

        ipcp.shutdown().await.unwrap();
        assert_eq!(ipcp.state(), IpcpState::Shutdown);
        assert!(ipcp.connmgr().registered().is_empty());
        assert!(ipcp.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_enroll_requires_running() {
        let fabric = MemoryFabric::new();
        let ipcp = IpcProcess::new(config("a"), fabric.attach("a")).unwrap();
        assert!(matches!(
            ipcp.enroll("b").await,
            Err(IpcpError::InvalidLifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_enroll_with_bootstrap() {
        let fabric = MemoryFabric::new();
        let first = IpcProcess::new(config("first"), fabric.attach("first")).unwrap();
        let second = IpcProcess::new(config("second"), fabric.attach("second")).unwrap();

        first.bootstrap().unwrap();
        first.start().unwrap();
        second.start().unwrap();

        let address = second.enroll("first").await.unwrap();
        assert_eq!(address, first.config().address_pool_start);
        assert_eq!(second.rib().state(), EnrollmentState::Enrolled);
        assert_eq!(second.rib().dt_constants(), first.rib().dt_constants());
        assert!(second.dt().is_configured());

        // Enrolling again is a no-op
        assert_eq!(second.enroll("first").await.unwrap(), address);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enroll_with_non_member_fails() {
        let fabric = MemoryFabric::new();
        let a = IpcProcess::new(config("a"), fabric.attach("a")).unwrap();
        let b = IpcProcess::new(config("b"), fabric.attach("b")).unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let result = a.enroll("b").await;
        assert!(matches!(
            result,
            Err(IpcpError::Enrollment(EnrollmentError::Timeout { attempts: 2 }))
        ));
        assert_eq!(a.rib().state(), EnrollmentState::Init);
        assert!(a.rib().pending_requests().is_empty());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
