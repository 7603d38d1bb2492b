use super::{ServerCall, ServerContext, ServerRequestStream, ServerResponseStream};
use crate::method::{Method, MethodKind};
use futures_util::{FutureExt, future::BoxFuture};
use std::{collections::HashMap, fmt, future::Future, sync::Arc};
use tonic::Status;

pub(crate) type Handler = Arc<dyn Fn(ServerCall) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps method paths to the handlers serving them.
#[derive(Clone, Default)]
pub struct ServiceRouter {
    routes: HashMap<String, Handler>,
}

impl fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("ServiceRouter")
            .field("routes", &paths)
            .finish()
    }
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unary<Req, Resp, F, Fut>(self, method: Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(&method, MethodKind::Unary, move |call: ServerCall, method| {
            let handler = handler.clone();
            async move { call.unary(&method, |req, ctx| handler(req, ctx)).await }.boxed()
        })
    }

    pub fn add_client_streaming<Req, Resp, F, Fut>(
        self,
        method: Method<Req, Resp>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerRequestStream<Req>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            &method,
            MethodKind::ClientStreaming,
            move |call: ServerCall, method| {
                let handler = handler.clone();
                async move {
                    call.client_streaming(&method, |requests, ctx| handler(requests, ctx))
                        .await
                }
                .boxed()
            },
        )
    }

    pub fn add_server_streaming<Req, Resp, F, Fut>(
        self,
        method: Method<Req, Resp>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, ServerResponseStream<Resp>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            &method,
            MethodKind::ServerStreaming,
            move |call: ServerCall, method| {
                let handler = handler.clone();
                async move {
                    call.server_streaming(&method, |req, responses, ctx| {
                        handler(req, responses, ctx)
                    })
                    .await
                }
                .boxed()
            },
        )
    }

    pub fn add_duplex_streaming<Req, Resp, F, Fut>(
        self,
        method: Method<Req, Resp>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerRequestStream<Req>, ServerResponseStream<Resp>, ServerContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            &method,
            MethodKind::DuplexStreaming,
            move |call: ServerCall, method| {
                let handler = handler.clone();
                async move {
                    call.duplex_streaming(&method, |requests, responses, ctx| {
                        handler(requests, responses, ctx)
                    })
                    .await
                }
                .boxed()
            },
        )
    }

    /// Paths of every registered method.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub(crate) fn route(&self, path: &str) -> Option<Handler> {
        self.routes.get(path).cloned()
    }

    fn insert<Req, Resp, H>(mut self, method: &Method<Req, Resp>, shape: MethodKind, serve: H) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(ServerCall, Method<Req, Resp>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if method.kind() != shape {
            tracing::warn!(
                path = method.path(),
                kind = ?method.kind(),
                ?shape,
                "method registered with a handler of a different shape"
            );
        }

        let path = method.path().to_string();
        let method = method.clone();
        let handler: Handler = Arc::new(move |call| serve(call, method.clone()));

        if self.routes.insert(path.clone(), handler).is_some() {
            tracing::warn!(path, "replacing the handler of an already registered method");
        }

        self
    }
}
