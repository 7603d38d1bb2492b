//! # Echo Service
//!
//! The in-process service every `ferrocall` command talks to. It exposes one method per call
//! shape and answers with plain UTF-8 strings.
use ferrocall_core::{
    call::CallError,
    marshal::StringMarshaller,
    metadata::Metadata,
    method::{InvalidMethodError, Method, MethodKind},
    server::{ServerContext, ServerRequestStream, ServerResponseStream, ServiceRouter},
    tonic::Status,
};
use std::time::Duration;

const SERVICE: &str = "ferrocall.EchoService";

pub struct EchoService {
    pub unary: Method<String, String>,
    pub client_streaming: Method<String, String>,
    pub server_streaming: Method<String, String>,
    pub duplex: Method<String, String>,
    delay: Duration,
}

impl EchoService {
    /// # Arguments
    ///
    /// * `delay` - How long the service waits before each response it sends.
    pub fn new(delay: Duration) -> Result<Self, InvalidMethodError> {
        let method = |kind, name: &str| {
            Method::new(kind, SERVICE, name, StringMarshaller, StringMarshaller)
        };

        Ok(Self {
            unary: method(MethodKind::Unary, "Echo")?,
            client_streaming: method(MethodKind::ClientStreaming, "Join")?,
            server_streaming: method(MethodKind::ServerStreaming, "Split")?,
            duplex: method(MethodKind::DuplexStreaming, "Shout")?,
            delay,
        })
    }

    pub fn router(&self) -> ServiceRouter {
        let delay = self.delay;

        ServiceRouter::new()
            .add_unary(self.unary.clone(), move |request, ctx| {
                echo(request, ctx, delay)
            })
            .add_client_streaming(self.client_streaming.clone(), move |requests, ctx| {
                join(requests, ctx, delay)
            })
            .add_server_streaming(self.server_streaming.clone(), move |request, responses, ctx| {
                split(request, responses, ctx, delay)
            })
            .add_duplex_streaming(self.duplex.clone(), move |requests, responses, ctx| {
                shout(requests, responses, ctx, delay)
            })
    }
}

/// Returns the request. Request headers starting with `x-` are sent back as response headers.
async fn echo(request: String, ctx: ServerContext, delay: Duration) -> Result<String, Status> {
    let mut headers = Metadata::new();
    for (key, value) in ctx.request_metadata() {
        if let (true, Some(value)) = (key.starts_with("x-"), value.as_str()) {
            headers.insert(key, value).map_err(invalid_metadata)?;
        }
    }
    ctx.write_response_headers(headers)
        .await
        .map_err(CallError::into_status)?;

    pause(&ctx, delay).await?;
    set_count_trailer(&ctx, 1)?;
    Ok(request)
}

async fn join(
    mut requests: ServerRequestStream<String>,
    ctx: ServerContext,
    delay: Duration,
) -> Result<String, Status> {
    let mut parts = Vec::new();
    while let Some(request) = requests.message().await {
        parts.push(request.map_err(CallError::into_status)?);
    }

    pause(&ctx, delay).await?;
    set_count_trailer(&ctx, parts.len())?;
    Ok(parts.join(","))
}

async fn split(
    request: String,
    responses: ServerResponseStream<String>,
    ctx: ServerContext,
    delay: Duration,
) -> Result<(), Status> {
    let parts: Vec<String> = request
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect();

    if parts.is_empty() {
        return Err(Status::invalid_argument("Nothing to split"));
    }

    for part in &parts {
        pause(&ctx, delay).await?;
        responses.write(part).await.map_err(CallError::into_status)?;
    }

    set_count_trailer(&ctx, parts.len())
}

async fn shout(
    mut requests: ServerRequestStream<String>,
    responses: ServerResponseStream<String>,
    ctx: ServerContext,
    delay: Duration,
) -> Result<(), Status> {
    let mut count = 0;
    while let Some(request) = requests.message().await {
        let request = request.map_err(CallError::into_status)?;
        pause(&ctx, delay).await?;
        responses
            .write(&request.to_uppercase())
            .await
            .map_err(CallError::into_status)?;
        count += 1;
    }

    set_count_trailer(&ctx, count)
}

/// Waits `delay`, giving up as soon as the call is cancelled.
async fn pause(ctx: &ServerContext, delay: Duration) -> Result<(), Status> {
    if delay.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = ctx.cancelled() => {
            tracing::info!(method = ctx.method(), "call cancelled while the service was waiting");
            Err(Status::cancelled("Call cancelled"))
        }
    }
}

fn set_count_trailer(ctx: &ServerContext, count: usize) -> Result<(), Status> {
    let mut trailers = Metadata::new();
    trailers
        .insert("x-echo-count", count.to_string())
        .map_err(invalid_metadata)?;
    ctx.set_trailers(trailers);
    Ok(())
}

fn invalid_metadata(err: ferrocall_core::metadata::MetadataError) -> Status {
    Status::internal(err.to_string())
}
