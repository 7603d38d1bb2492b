//! # Method Descriptors
//!
//! A [`Method`] names an RPC on the wire and carries the marshallers for its request and
//! response types. Its [`MethodKind`] decides which of the four call shapes drives it.
use crate::marshal::Marshaller;
use http::uri::PathAndQuery;
use std::{fmt, str::FromStr, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum InvalidMethodError {
    #[error("Service and method names cannot be empty")]
    EmptyName,
    #[error("'{0}' is not a valid gRPC path: {1}")]
    InvalidPath(String, #[source] http::uri::InvalidUri),
}

/// The shape of an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodKind {
    pub fn is_client_streaming(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::DuplexStreaming)
    }

    pub fn is_server_streaming(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::DuplexStreaming)
    }
}

/// Describes an RPC method and how its messages are marshalled.
pub struct Method<Req, Resp> {
    kind: MethodKind,
    service: String,
    name: String,
    path: PathAndQuery,
    request_marshaller: Arc<dyn Marshaller<Req>>,
    response_marshaller: Arc<dyn Marshaller<Resp>>,
}

impl<Req, Resp> Method<Req, Resp> {
    /// Builds a method descriptor, validating its wire path `/{service}/{name}`.
    pub fn new(
        kind: MethodKind,
        service: impl Into<String>,
        name: impl Into<String>,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
    ) -> Result<Self, InvalidMethodError> {
        let service = service.into();
        let name = name.into();

        if service.trim().is_empty() || name.trim().is_empty() {
            return Err(InvalidMethodError::EmptyName);
        }

        let raw = format!("/{}/{}", service, name);
        let path =
            PathAndQuery::from_str(&raw).map_err(|e| InvalidMethodError::InvalidPath(raw, e))?;

        Ok(Self {
            kind,
            service,
            name,
            path,
            request_marshaller: Arc::new(request_marshaller),
            response_marshaller: Arc::new(response_marshaller),
        })
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The HTTP/2 path of the method, e.g. `/echo.EchoService/UnaryEcho`.
    pub fn path(&self) -> &str {
        self.path.path()
    }

    pub fn request_marshaller(&self) -> &Arc<dyn Marshaller<Req>> {
        &self.request_marshaller
    }

    pub fn response_marshaller(&self) -> &Arc<dyn Marshaller<Resp>> {
        &self.response_marshaller
    }
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            service: self.service.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            request_marshaller: self.request_marshaller.clone(),
            response_marshaller: self.response_marshaller.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("kind", &self.kind)
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::StringMarshaller;

    #[test]
    fn builds_the_wire_path() {
        let method: Method<String, String> = Method::new(
            MethodKind::Unary,
            "echo.EchoService",
            "UnaryEcho",
            StringMarshaller,
            StringMarshaller,
        )
        .unwrap();

        assert_eq!(method.path(), "/echo.EchoService/UnaryEcho");
        assert!(!method.kind().is_client_streaming());
    }

    #[test]
    fn rejects_empty_and_invalid_names() {
        let empty: Result<Method<String, String>, _> = Method::new(
            MethodKind::Unary,
            " ",
            "Call",
            StringMarshaller,
            StringMarshaller,
        );
        assert!(matches!(empty, Err(InvalidMethodError::EmptyName)));

        let invalid: Result<Method<String, String>, _> = Method::new(
            MethodKind::Unary,
            "echo Service",
            "Call",
            StringMarshaller,
            StringMarshaller,
        );
        assert!(matches!(invalid, Err(InvalidMethodError::InvalidPath(..))));
    }
}
