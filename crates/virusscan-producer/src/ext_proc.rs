//! The ext_proc gRPC adapter: translates Envoy-style `ProcessingRequest`
//! messages into `Session` transitions and `Decision`s back into
//! `ProcessingResponse` messages. Request and response direction each get
//! their own `Session` (a blocked response is sent back as an
//! `ImmediateResponse` exactly like a blocked request), sharing the same
//! cache/queue/config.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use virusscan_cache::IntelligentCache;
use virusscan_proto::ext_proc::external_processor_server::ExternalProcessor;
use virusscan_proto::ext_proc::processing_request::Request as ReqVariant;
use virusscan_proto::ext_proc::processing_response::Response as RespVariant;
use virusscan_proto::ext_proc::{
    CommonResponse, CommonStatus, HeaderValue, HttpHeaders, ImmediateResponse, ProcessingRequest,
    ProcessingResponse,
};
use virusscan_proto::{Priority, RequestMetadata};
use virusscan_queue::TaskQueue;

use crate::state_machine::{Decision, Session, SessionConfig};

pub struct ExtProcService {
    redis: virusscan_dataprovider::SharedRedis,
    keys: virusscan_proto::keys::KeySpace,
    cache: Arc<IntelligentCache>,
    queue: Arc<TaskQueue>,
    metrics: Arc<virusscan_observability::Metrics>,
    session_config: Arc<SessionConfig>,
}

impl ExtProcService {
    pub fn new(
        redis: virusscan_dataprovider::SharedRedis,
        keys: virusscan_proto::keys::KeySpace,
        cache: Arc<IntelligentCache>,
        queue: Arc<TaskQueue>,
        metrics: Arc<virusscan_observability::Metrics>,
        session_config: Arc<SessionConfig>,
    ) -> Self {
        ExtProcService {
            redis,
            keys,
            cache,
            queue,
            metrics,
            session_config,
        }
    }

    fn new_session(&self) -> Session {
        Session::new(
            self.redis.clone(),
            self.keys.clone(),
            self.cache.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            self.session_config.clone(),
        )
    }
}

fn header_value(headers: &HttpHeaders, name: &str) -> Option<String> {
    headers
        .headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn request_metadata_from_headers(headers: &HttpHeaders) -> RequestMetadata {
    let authority = header_value(headers, ":authority").or_else(|| header_value(headers, "host"));
    let path = header_value(headers, ":path").unwrap_or_default();
    let origin_uri = match authority {
        Some(authority) => format!("https://{authority}{path}"),
        None => path,
    };
    RequestMetadata {
        origin_uri,
        content_type: header_value(headers, "content-type"),
        tenant_id: header_value(headers, "x-tenant-id"),
    }
}

fn priority_from_headers(headers: &HttpHeaders) -> Priority {
    Priority::from_header_value(header_value(headers, "x-priority").as_deref())
}

fn to_common_response(headers: Vec<(String, String)>) -> RespVariant {
    RespVariant::RequestHeaders(CommonResponse {
        status: CommonStatus::Continue as i32,
        header_mutation: headers
            .into_iter()
            .map(|(key, value)| HeaderValue { key, value })
            .collect(),
    })
}

fn to_immediate_response(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> RespVariant {
    RespVariant::ImmediateResponse(ImmediateResponse {
        status_code: status as u32,
        headers: headers
            .into_iter()
            .map(|(key, value)| HeaderValue { key, value })
            .collect(),
        body,
    })
}

fn decision_to_response(decision: Decision, variant_for_continue: fn(Vec<(String, String)>) -> RespVariant) -> Option<ProcessingResponse> {
    match decision {
        Decision::Continue => None,
        Decision::Admit { headers } => Some(ProcessingResponse {
            response: Some(variant_for_continue(headers)),
        }),
        Decision::Block { status, headers, body } => Some(ProcessingResponse {
            response: Some(to_immediate_response(status, headers, body)),
        }),
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = Pin<Box<dyn futures::Stream<Item = Result<ProcessingResponse, Status>> + Send>>;

    async fn process(&self, request: Request<Streaming<ProcessingRequest>>) -> Result<Response<Self::ProcessStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        let mut request_session = self.new_session();
        let mut response_session = self.new_session();
        let mut route_disabled_known = false;

        tokio::spawn(async move {
            while let Some(message) = match inbound.message().await {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(error = %err, "ext_proc stream read failed");
                    None
                }
            } {
                let disabled = message.metadata.as_ref().map(|m| m.disabled).unwrap_or(false);

                let decision = match message.request {
                    Some(ReqVariant::RequestHeaders(headers)) => {
                        if !route_disabled_known {
                            route_disabled_known = true;
                        }
                        let metadata = request_metadata_from_headers(&headers);
                        let priority = priority_from_headers(&headers);
                        Some((
                            request_session.on_request_headers(metadata, disabled, priority),
                            to_common_response as fn(Vec<(String, String)>) -> RespVariant,
                        ))
                    }
                    Some(ReqVariant::RequestBody(body)) => {
                        match request_session.on_request_body(&body.body, body.end_of_stream).await {
                            Ok(decision) => Some((decision, to_common_response as fn(Vec<(String, String)>) -> RespVariant)),
                            Err(err) => {
                                tracing::warn!(error = %err, "request body processing failed");
                                None
                            }
                        }
                    }
                    Some(ReqVariant::ResponseHeaders(headers)) => {
                        let metadata = request_metadata_from_headers(&headers);
                        let priority = priority_from_headers(&headers);
                        Some((
                            response_session.on_request_headers(metadata, disabled, priority),
                            response_continue as fn(Vec<(String, String)>) -> RespVariant,
                        ))
                    }
                    Some(ReqVariant::ResponseBody(body)) => {
                        match response_session.on_request_body(&body.body, body.end_of_stream).await {
                            Ok(decision) => Some((decision, response_continue as fn(Vec<(String, String)>) -> RespVariant)),
                            Err(err) => {
                                tracing::warn!(error = %err, "response body processing failed");
                                None
                            }
                        }
                    }
                    None => None,
                };

                if let Some((decision, to_continue)) = decision {
                    if let Some(response) = decision_to_response(decision, to_continue) {
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }
}

fn response_continue(headers: Vec<(String, String)>) -> RespVariant {
    RespVariant::ResponseHeaders(CommonResponse {
        status: CommonStatus::Continue as i32,
        header_mutation: headers
            .into_iter()
            .map(|(key, value)| HeaderValue { key, value })
            .collect(),
    })
}
