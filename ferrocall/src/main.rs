//! # Ferrocall CLI Entry Point
//!
//! Runs a single RPC end to end through the Ferrocall call engine. Client and server live in this
//! process and talk over the in-memory loopback transport:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and sets up logging.
//! 2. **Serving**: Starts the [`echo::EchoService`] on a `ferrocall_core` server.
//! 3. **Execution**: Drives the requested call shape through a client `Channel`.
//! 4. **Presentation**: Prints the responses, headers, status and trailers of the call as JSON.
mod cli;
mod echo;
mod formatter;
mod logging;

use anyhow::Context;
use clap::Parser;
use cli::{CallArgs, Cli, Commands};
use echo::EchoService;
use ferrocall_core::{
    client::{CallOptions, Channel},
    environment::Environment,
    metadata::Metadata,
    server::Server,
    transport::loopback::LoopbackTransport,
};
use formatter::{CallOutcome, FormattedString, GenericError};
use std::{process, time::Duration};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    logging::init(&args.log_level, args.log_format);

    match run(args).await {
        Ok(outcome) => println!("{}", FormattedString::from(outcome)),
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}

async fn run(args: Cli) -> anyhow::Result<CallOutcome> {
    let env = Environment::new();
    let transport = LoopbackTransport::new(&env);

    let service = EchoService::new(Duration::from_millis(args.server_delay_ms))?;
    let server = Server::new(&env, transport.clone(), service.router());
    let serving = tokio::spawn(async move { server.serve().await });

    let channel = Channel::new(&env, transport.clone());
    let outcome = match args.command {
        Commands::Unary { message, call } => unary(&channel, &service, message, call).await,
        Commands::ClientStreaming { messages, call } => {
            client_streaming(&channel, &service, messages, call).await
        }
        Commands::ServerStreaming {
            message,
            call,
            cancel_after,
        } => server_streaming(&channel, &service, message, call, cancel_after).await,
        Commands::Duplex {
            messages,
            call,
            cancel_after,
        } => duplex(&channel, &service, messages, call, cancel_after).await,
    };

    env.shutdown();
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => eprintln!("{}", FormattedString::from(GenericError("Server failed", err))),
        Err(err) => eprintln!("{}", FormattedString::from(GenericError("Server panicked", err))),
    }

    outcome
}

fn call_options(args: &CallArgs) -> anyhow::Result<CallOptions> {
    let mut metadata = Metadata::new();
    for (key, value) in &args.headers {
        metadata
            .insert(key.as_str(), value.as_str())
            .with_context(|| format!("Invalid header '{key}'"))?;
    }

    let mut options = CallOptions::default().with_metadata(metadata);
    if let Some(ms) = args.deadline_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    Ok(options)
}

async fn unary(
    channel: &Channel,
    service: &EchoService,
    message: String,
    args: CallArgs,
) -> anyhow::Result<CallOutcome> {
    let mut call = channel.unary(&service.unary, &message, call_options(&args)?)?;

    let mut responses = Vec::new();
    match call.response().await {
        Ok(response) => responses.push(response),
        Err(err) => tracing::info!(%err, "unary call failed"),
    }

    Ok(CallOutcome {
        method: service.unary.path().to_string(),
        headers: call.headers().await.ok(),
        responses,
        status: call.status().await,
        trailers: call.trailers(),
    })
}

async fn client_streaming(
    channel: &Channel,
    service: &EchoService,
    messages: Vec<String>,
    args: CallArgs,
) -> anyhow::Result<CallOutcome> {
    let method = &service.client_streaming;
    let mut call = channel.client_streaming(method, call_options(&args)?)?;

    if let Err(err) = call.requests.send_all(tokio_stream::iter(messages)).await {
        tracing::info!(%err, "failed to send every request");
    }

    let mut responses = Vec::new();
    match call.response().await {
        Ok(response) => responses.push(response),
        Err(err) => tracing::info!(%err, "client streaming call failed"),
    }

    Ok(CallOutcome {
        method: method.path().to_string(),
        headers: call.headers().await.ok(),
        responses,
        status: call.status().await,
        trailers: call.trailers(),
    })
}

async fn server_streaming(
    channel: &Channel,
    service: &EchoService,
    message: String,
    args: CallArgs,
    cancel_after: Option<usize>,
) -> anyhow::Result<CallOutcome> {
    let method = &service.server_streaming;
    let mut call = channel.server_streaming(method, &message, call_options(&args)?)?;

    let mut responses = Vec::new();
    while let Some(response) = call.responses.message().await {
        match response {
            Ok(response) => {
                responses.push(response);
                if cancel_after == Some(responses.len()) {
                    tracing::info!(received = responses.len(), "cancelling the call");
                    call.cancel();
                }
            }
            Err(err) => {
                tracing::info!(%err, "response stream failed");
                break;
            }
        }
    }

    Ok(CallOutcome {
        method: method.path().to_string(),
        headers: call.headers().await.ok(),
        responses,
        status: call.status().await,
        trailers: call.trailers(),
    })
}

async fn duplex(
    channel: &Channel,
    service: &EchoService,
    messages: Vec<String>,
    args: CallArgs,
    cancel_after: Option<usize>,
) -> anyhow::Result<CallOutcome> {
    let method = &service.duplex;
    let mut call = channel.duplex_streaming(method, call_options(&args)?)?;

    let mut responses = Vec::new();
    for message in &messages {
        if let Err(err) = call.requests.write(message).await {
            tracing::info!(%err, "failed to send request");
            break;
        }

        match call.responses.message().await {
            Some(Ok(response)) => responses.push(response),
            Some(Err(err)) => {
                tracing::info!(%err, "response stream failed");
                break;
            }
            None => break,
        }

        if cancel_after == Some(responses.len()) {
            tracing::info!(received = responses.len(), "cancelling the call");
            call.cancel();
            break;
        }
    }

    if let Err(err) = call.requests.complete().await {
        tracing::debug!(%err, "request stream not completed");
    }
    while let Some(Ok(response)) = call.responses.message().await {
        responses.push(response);
    }

    Ok(CallOutcome {
        method: method.path().to_string(),
        headers: call.headers().await.ok(),
        responses,
        status: call.status().await,
        trailers: call.trailers(),
    })
}
