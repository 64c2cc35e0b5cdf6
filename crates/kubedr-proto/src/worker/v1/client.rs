use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{IntoRequest, Response, Status};

use super::messages::*;

const SERVICE: &str = "kubedr.worker.v1.WorkerService";

/// Unary client for `kubedr.worker.v1.WorkerService`
#[derive(Debug, Clone)]
pub struct WorkerServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl WorkerServiceClient {
    /// Wrap an established channel
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Dump the target's databases into a worker directory
    pub async fn dump_postgres(
        &mut self,
        request: impl IntoRequest<DumpPostgresRequest>,
    ) -> Result<Response<DumpPostgresResponse>, Status> {
        self.unary(request, "/kubedr.worker.v1.WorkerService/DumpPostgres")
            .await
    }

    /// Restore dumps from a worker directory into the target
    pub async fn restore_postgres(
        &mut self,
        request: impl IntoRequest<RestorePostgresRequest>,
    ) -> Result<Response<RestorePostgresResponse>, Status> {
        self.unary(request, "/kubedr.worker.v1.WorkerService/RestorePostgres")
            .await
    }

    /// Copy between a worker directory and object storage
    pub async fn sync_object_storage(
        &mut self,
        request: impl IntoRequest<SyncObjectStorageRequest>,
    ) -> Result<Response<SyncObjectStorageResponse>, Status> {
        self.unary(request, "/kubedr.worker.v1.WorkerService/SyncObjectStorage")
            .await
    }

    /// Copy files between two worker directories
    pub async fn sync_files(
        &mut self,
        request: impl IntoRequest<SyncFilesRequest>,
    ) -> Result<Response<SyncFilesResponse>, Status> {
        self.unary(request, "/kubedr.worker.v1.WorkerService/SyncFiles")
            .await
    }

    async fn unary<Req, Resp>(
        &mut self,
        request: impl IntoRequest<Req>,
        path: &'static str,
    ) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("{} not ready: {}", SERVICE, e)))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        self.inner
            .unary(request.into_request(), PathAndQuery::from_static(path), codec)
            .await
    }
}
