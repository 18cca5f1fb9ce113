//! gRPC control plane using Tonic.
//!
//! Bound to loopback by default. The upstream web application that performs
//! user authentication calls it to mint and revoke sessions.

use std::net::SocketAddr;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::error::LabError;
use crate::http_server::SESSION_COOKIE;
use crate::orchestrator::LabInstance;
use crate::session::{redact, Role};
use crate::state::AppState;

// Import generated protobuf types
pub mod proto {
    tonic::include_proto!("labgate");
}

use proto::lab_control_server::{LabControl, LabControlServer};
use proto::{
    CreateSessionRequest, CreateSessionResponse, Instance, InvalidateSessionRequest, InvalidateSessionResponse,
    ListInstancesRequest, ListInstancesResponse, ReconcileRequest, ReconcileResponse,
};

pub struct LabControlService {
    state: AppState,
}

impl LabControlService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

impl From<LabInstance> for Instance {
    fn from(lab: LabInstance) -> Self {
        Self {
            status: lab.status.as_str().to_string(),
            created_at_unix: lab.created_at.timestamp(),
            endpoint: lab.endpoint.unwrap_or_default(),
            error: lab.error.unwrap_or_default(),
            id: lab.id,
            owner: lab.owner,
            classroom: lab.classroom,
            image: lab.image,
        }
    }
}

#[tonic::async_trait]
impl LabControl for LabControlService {
    async fn create_session(
        &self,
        request: Request<CreateSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let req = request.into_inner();
        if req.user_id.trim().is_empty() {
            return Err(Status::invalid_argument("user_id is required"));
        }
        let role: Role = req
            .role
            .parse()
            .map_err(|e: String| Status::invalid_argument(e))?;
        info!(user = %req.user_id, %role, "gRPC CreateSession");

        let session = self.state.sessions.create(&req.user_id, role).await?;
        Ok(Response::new(CreateSessionResponse {
            session_id: session.id,
            cookie_name: SESSION_COOKIE.to_string(),
            ttl_secs: self.state.sessions.ttl().as_secs(),
        }))
    }

    async fn invalidate_session(
        &self,
        request: Request<InvalidateSessionRequest>,
    ) -> Result<Response<InvalidateSessionResponse>, Status> {
        let req = request.into_inner();
        info!(session = %redact(&req.session_id), "gRPC InvalidateSession");
        let existed = self.state.sessions.invalidate(&req.session_id).await?;
        Ok(Response::new(InvalidateSessionResponse { existed }))
    }

    async fn list_instances(
        &self,
        request: Request<ListInstancesRequest>,
    ) -> Result<Response<ListInstancesResponse>, Status> {
        let req = request.into_inner();
        if req.user_id.is_empty() {
            return Err(LabError::InvalidRequest("user_id is required".into()).into());
        }
        let labs = self.state.orchestrator.list_owned(&req.user_id).await?;
        Ok(Response::new(ListInstancesResponse {
            instances: labs.into_iter().map(Instance::from).collect(),
        }))
    }

    async fn reconcile(&self, _request: Request<ReconcileRequest>) -> Result<Response<ReconcileResponse>, Status> {
        info!("gRPC Reconcile");
        let report = self.state.orchestrator.reconcile().await?;
        Ok(Response::new(ReconcileResponse {
            checked: u32::try_from(report.checked).unwrap_or(u32::MAX),
            marked_error: report.marked_error,
            adopted: report.adopted,
            reclaimed: report.reclaimed,
        }))
    }
}

/// Run the gRPC server on the given address with the provided state.
pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<(), tonic::transport::Error> {
    info!(%addr, "Starting gRPC control plane");

    let service = LabControlService::new(state);

    tonic::transport::Server::builder()
        .add_service(LabControlServer::new(service))
        .serve(addr)
        .await
}
