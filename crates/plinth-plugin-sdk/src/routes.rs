use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tower::Service;

use crate::{
    envelope::Envelope,
    error::{HandlerError, ValidationError},
    manifest::PluginManifest,
};

pub type ApiRequest = Request<Bytes>;
pub type HttpResponse = Response<Bytes>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send>>;

/// What a handler produced, before the envelope boundary sees it.
#[derive(Debug)]
pub enum Reply {
    /// Plain data, wrapped into a success envelope.
    Data { status: StatusCode, data: Value },
    /// Already shaped; forwarded unchanged.
    Envelope(Envelope),
    /// Bypasses the envelope entirely.
    Raw(HttpResponse),
}

impl Reply {
    pub fn data(data: Value) -> Self {
        Reply::Data {
            status: StatusCode::OK,
            data,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        Ok(Self::data(serde_json::to_value(value)?))
    }

    pub fn created<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        Ok(Self::json(value)?.with_status(StatusCode::CREATED))
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        match self {
            Reply::Data { data, .. } => Reply::Data { status, data },
            other => other,
        }
    }

    pub fn raw(response: HttpResponse) -> Self {
        Reply::Raw(response)
    }
}

impl From<Envelope> for Reply {
    fn from(envelope: Envelope) -> Self {
        Reply::Envelope(envelope)
    }
}

/// Request path with the query string stripped, derived once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath(pub String);

impl RequestPath {
    pub fn from_uri(uri: &Uri) -> Self {
        Self(uri.path().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        self.0 == prefix || self.0.starts_with(&format!("{prefix}/"))
    }
}

/// Values captured from `:name` segments of the matched route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(pub HashMap<String, String>);

/// Convenience accessors handlers use on incoming requests.
pub trait RequestExt {
    fn json<T: DeserializeOwned>(&self) -> Result<T, ValidationError>;
    fn param(&self, name: &str) -> Option<&str>;
    fn query_param(&self, name: &str) -> Option<String>;
    fn request_path(&self) -> Option<&str>;
    fn plugin_manifest(&self) -> Option<&PluginManifest>;
}

impl RequestExt for ApiRequest {
    fn json<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        if self.body().is_empty() {
            return Err(ValidationError::new().field("body", "request body is required"));
        }
        Ok(serde_json::from_slice(self.body())?)
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.extensions()
            .get::<PathParams>()
            .and_then(|params| params.0.get(name))
            .map(String::as_str)
    }

    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn request_path(&self) -> Option<&str> {
        self.extensions().get::<RequestPath>().map(RequestPath::as_str)
    }

    fn plugin_manifest(&self) -> Option<&PluginManifest> {
        self.extensions()
            .get::<Arc<PluginManifest>>()
            .map(|manifest| manifest.as_ref())
    }
}

/// Type-erased, cloneable async route handler.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<dyn Fn(ApiRequest) -> HandlerFuture + Send + Sync>,
}

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |req| Box::pin(f(req)) as HandlerFuture),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

impl Service<ApiRequest> for Handler {
    type Response = Reply;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        (self.inner)(req)
    }
}

#[derive(Debug, Clone)]
pub struct RouteDef {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
}

/// Routes a plugin contributes, relative to the versioned API prefix.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    defs: Vec<RouteDef>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F, Fut>(&mut self, method: Method, path: &str, f: F) -> &mut Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.defs.push(RouteDef {
            method,
            path: path.to_string(),
            handler: Handler::new(f),
        });
        self
    }

    pub fn get<F, Fut>(&mut self, path: &str, f: F) -> &mut Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.route(Method::GET, path, f)
    }

    pub fn post<F, Fut>(&mut self, path: &str, f: F) -> &mut Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.route(Method::POST, path, f)
    }

    pub fn put<F, Fut>(&mut self, path: &str, f: F) -> &mut Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.route(Method::PUT, path, f)
    }

    pub fn delete<F, Fut>(&mut self, path: &str, f: F) -> &mut Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.route(Method::DELETE, path, f)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteDef> {
        self.defs.iter()
    }
}

impl IntoIterator for Routes {
    type Item = RouteDef;
    type IntoIter = std::vec::IntoIter<RouteDef>;

    fn into_iter(self) -> Self::IntoIter {
        self.defs.into_iter()
    }
}
