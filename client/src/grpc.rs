//! Single-attempt unary calls against the sequencer gRPC service.

use crate::Error;
use http::uri::PathAndQuery;
use std::time::Duration;
use tonic::{client::Grpc, codec::ProstCodec, transport::Endpoint, Request, Status};

pub const GET_SEQUENCER_BLOCK: &str = "/astria.sequencerblock.v1.SequencerService/GetSequencerBlock";
pub const GET_UPGRADES_INFO: &str = "/astria.sequencerblock.v1.SequencerService/GetUpgradesInfo";
pub const GET_VALIDATOR_NAME: &str = "/astria.sequencerblock.v1.SequencerService/GetValidatorName";

/// Upper bound on a single call (connection included).
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to `url` and issues one unary call to `path`.
pub async fn unary<Req, Resp>(url: &str, path: &'static str, request: Req) -> Result<Resp, Error>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let channel = Endpoint::from_shared(url.to_string())?
        .connect_timeout(CALL_TIMEOUT)
        .timeout(CALL_TIMEOUT)
        .connect()
        .await?;
    let mut client = Grpc::new(channel);
    client
        .ready()
        .await
        .map_err(|err| Box::new(Status::unavailable(format!("service not ready: {err}"))))?;
    let response = client
        .unary(
            Request::new(request),
            PathAndQuery::from_static(path),
            ProstCodec::default(),
        )
        .await
        .map_err(Box::new)?;
    Ok(response.into_inner())
}
