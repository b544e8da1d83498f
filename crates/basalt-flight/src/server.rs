//! Arrow Flight RPC service.
//!
//! Thin shell over the [`Dispatcher`]: the four data verbs decode their
//! command string and record batches, run the dispatcher synchronously
//! (engine calls are short and internally synchronized), and encode the
//! reply batch back into the Flight stream. Discovery verbs beyond
//! `list_actions` are not part of the protocol surface.

use std::net::SocketAddr;
use std::sync::Arc;

use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor,
    FlightInfo, HandshakeRequest, HandshakeResponse, PollInfo, PutResult,
    SchemaResult, Ticket,
};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use basalt_engine::{Engine, EngineError};

use crate::dispatch::{ActionReply, Dispatcher};
use crate::session::{ClientId, SessionConfig, SessionManager};

fn to_status(e: EngineError) -> Status {
    match e {
        EngineError::ArgsWrong(_) => Status::invalid_argument(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

fn flight_to_status(e: FlightError) -> Status {
    Status::internal(e.to_string())
}

fn client_of<T>(request: &Request<T>) -> ClientId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match request.remote_addr() {
        Some(addr) => addr.to_string().hash(&mut hasher),
        None => "<unknown-peer>".hash(&mut hasher),
    }
    hasher.finish()
}

/// The BasaltDB Flight service: one engine, one session pool.
pub struct BasaltServer {
    dispatcher: Arc<Dispatcher>,
}

impl BasaltServer {
    pub fn new(engine: Arc<dyn Engine>, config: SessionConfig) -> Self {
        let sessions = SessionManager::new(Arc::clone(&engine), config);
        Self { dispatcher: Arc::new(Dispatcher::new(engine, sessions)) }
    }

    pub fn into_service(self) -> FlightServiceServer<Self> {
        FlightServiceServer::new(self)
    }

    /// Serve until the transport shuts down.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
        info!(%addr, "flight server listening");
        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve(addr)
            .await
    }
}

/// Collect an inbound stream: the descriptor command from the first
/// message plus every decoded record batch.
async fn decode_request(
    stream: Streaming<FlightData>,
) -> Result<(String, Vec<RecordBatch>), Status> {
    let mut messages = Vec::new();
    let mut stream = stream;
    while let Some(message) = stream.message().await? {
        messages.push(message);
    }
    let command = messages
        .first()
        .and_then(|m| m.flight_descriptor.as_ref())
        .map(|d| String::from_utf8_lossy(&d.cmd).into_owned())
        .ok_or_else(|| Status::invalid_argument("first message carries no flight descriptor"))?;

    let mut decoder = FlightRecordBatchStream::new_from_flight_data(
        stream::iter(messages.into_iter().map(Ok::<_, FlightError>)),
    );
    let mut batches = Vec::new();
    while let Some(batch) = decoder.next().await {
        batches.push(batch.map_err(flight_to_status)?);
    }
    Ok((command, batches))
}

/// One atomic engine batch per call: multi-batch streams concatenate.
fn merge_batches(mut batches: Vec<RecordBatch>) -> Result<RecordBatch, Status> {
    match batches.len() {
        0 => Err(Status::invalid_argument("request stream carried no record batch")),
        1 => Ok(batches.remove(0)),
        _ => {
            let schema = batches[0].schema();
            concat_batches(&schema, batches.iter())
                .map_err(|e| Status::invalid_argument(e.to_string()))
        }
    }
}

fn encode_reply(batch: RecordBatch) -> BoxStream<'static, Result<FlightData, Status>> {
    FlightDataEncoderBuilder::new()
        .build(stream::once(async move { Ok(batch) }))
        .map_err(flight_to_status)
        .boxed()
}

#[tonic::async_trait]
impl FlightService for BasaltServer {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not part of the protocol surface"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Ok(Response::new(
            stream::iter(Vec::<Result<FlightInfo, Status>>::new()).boxed(),
        ))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("flight info is not part of the protocol surface"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("flight info is not part of the protocol surface"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("schemas are per-command"))
    }

    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        let client = client_of(&request);
        let ticket = request.into_inner();
        let command = std::str::from_utf8(&ticket.ticket)
            .map_err(|_| Status::invalid_argument("ticket must be an ascii command"))?;
        let batch = self.dispatcher.do_get(client, command).map_err(to_status)?;
        Ok(Response::new(encode_reply(batch)))
    }

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let client = client_of(&request);
        let (command, batches) = decode_request(request.into_inner()).await?;
        let batch = merge_batches(batches)?;
        self.dispatcher
            .do_put(client, &command, &batch)
            .map_err(to_status)?;
        Ok(Response::new(
            stream::iter(Vec::<Result<PutResult, Status>>::new()).boxed(),
        ))
    }

    async fn do_exchange(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        let client = client_of(&request);
        let (command, batches) = decode_request(request.into_inner()).await?;
        let batch = merge_batches(batches)?;
        let reply = self
            .dispatcher
            .do_exchange(client, &command, &batch)
            .map_err(to_status)?;
        Ok(Response::new(encode_reply(reply)))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let client = client_of(&request);
        let action = request.into_inner();
        let reply = self
            .dispatcher
            .do_action(client, &action.r#type, &action.body)
            .map_err(to_status)?;
        let results = match reply {
            ActionReply::Scalar(value) => vec![Ok(arrow_flight::Result {
                body: Bytes::copy_from_slice(&value.to_le_bytes()),
            })],
            ActionReply::Empty => Vec::new(),
        };
        Ok(Response::new(stream::iter(results).boxed()))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![
            ("col_open", "Find or create a collection by name."),
            ("col_drop", "Drop collection values, contents or the handle."),
            ("snap_open", "Freeze the committed state under a new snapshot id."),
            ("snap_drop", "Release a snapshot."),
            ("txn_begin", "Start a transaction and return its id."),
            ("txn_commit", "Commit a previously started transaction."),
        ]
        .into_iter()
        .map(|(name, description)| {
            Ok(ActionType { r#type: name.to_owned(), description: description.to_owned() })
        })
        .collect::<Vec<_>>();
        Ok(Response::new(stream::iter(actions).boxed()))
    }
}
