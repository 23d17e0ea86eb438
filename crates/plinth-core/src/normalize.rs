use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use plinth_plugin_sdk::{
    envelope::Envelope,
    routes::{ApiRequest, HttpResponse, Reply, RequestPath},
    HandlerError,
};
use tower::{Layer, Service};

/// Wraps route handlers so every outcome leaves as an envelope, except under
/// the exempt prefix where responses pass through raw.
#[derive(Debug, Clone)]
pub struct EnvelopeLayer {
    exempt_prefix: Arc<str>,
}

impl EnvelopeLayer {
    pub fn new(exempt_prefix: &str) -> Self {
        Self {
            exempt_prefix: Arc::from(exempt_prefix),
        }
    }

    pub fn is_exempt(&self, path: &RequestPath) -> bool {
        path.is_under(&self.exempt_prefix)
    }

    /// Renders an outcome for `path`: raw under the exempt prefix, enveloped elsewhere.
    pub fn respond(&self, outcome: Result<Reply, HandlerError>, path: &RequestPath) -> HttpResponse {
        if self.is_exempt(path) {
            passthrough(outcome)
        } else {
            normalize(outcome, path.as_str())
        }
    }
}

impl<S> Layer<S> for EnvelopeLayer {
    type Service = EnvelopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EnvelopeService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvelopeService<S> {
    inner: S,
    layer: EnvelopeLayer,
}

impl<S> Service<ApiRequest> for EnvelopeService<S>
where
    S: Service<ApiRequest, Response = Reply, Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness failures are reported per request so they get classified too.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: ApiRequest) -> Self::Future {
        // The router stores the path once per request; direct callers get it derived here.
        let path = match req.extensions().get::<RequestPath>() {
            Some(path) => path.clone(),
            None => {
                let path = RequestPath::from_uri(req.uri());
                req.extensions_mut().insert(path.clone());
                path
            }
        };

        let layer = self.layer.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let outcome = match std::future::poll_fn(|cx| inner.poll_ready(cx)).await {
                Ok(()) => inner.call(req).await,
                Err(err) => Err(err),
            };
            Ok(layer.respond(outcome, &path))
        })
    }
}

/// Converts a handler outcome into the wire response for a wrapped route.
pub fn normalize(outcome: Result<Reply, HandlerError>, path: &str) -> HttpResponse {
    match outcome {
        Ok(Reply::Data { status, data }) => {
            render_envelope(&Envelope::success_with_status(data, status))
        }
        Ok(Reply::Envelope(envelope)) => render_envelope(&envelope),
        Ok(Reply::Raw(response)) => response,
        Err(err) => render_envelope(&classify(err, Some(path))),
    }
}

/// Maps a failure onto its error envelope, most specific kind first.
pub fn classify(err: HandlerError, path: Option<&str>) -> Envelope {
    match err {
        HandlerError::Validation(err) => {
            tracing::debug!(path, issues = err.issues.len(), "request failed validation");
            Envelope::from_validation(&err, path)
        }
        HandlerError::Api(err) => {
            tracing::debug!(path, status = err.status.as_u16(), code = %err.code, "request rejected");
            Envelope::from_api_error(err, path)
        }
        HandlerError::Internal(err) => {
            tracing::error!(path, error = %format!("{err:#}"), "unhandled handler error");
            Envelope::internal(Some(err.to_string()), path)
        }
    }
}

fn passthrough(outcome: Result<Reply, HandlerError>) -> HttpResponse {
    match outcome {
        Ok(Reply::Data { status, data }) => json_response(status, &data),
        Ok(Reply::Envelope(envelope)) => render_envelope(&envelope),
        Ok(Reply::Raw(response)) => response,
        Err(err) => {
            let message = match &err {
                HandlerError::Validation(err) => err.to_string(),
                HandlerError::Api(err) => err.message.clone(),
                HandlerError::Internal(err) => err.to_string(),
            };
            let message = if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message
            };
            text_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

pub fn render_envelope(envelope: &Envelope) -> HttpResponse {
    json_response(envelope.status_code(), envelope)
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => with_content_type(status, Bytes::from(bytes), "application/json"),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize response body");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
        }
    }
}

pub fn text_response(status: StatusCode, message: String) -> HttpResponse {
    with_content_type(status, Bytes::from(message), "text/plain; charset=utf-8")
}

pub fn html_response(status: StatusCode, html: String) -> HttpResponse {
    with_content_type(status, Bytes::from(html), "text/html; charset=utf-8")
}

fn with_content_type(status: StatusCode, body: Bytes, content_type: &'static str) -> HttpResponse {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;
    use plinth_plugin_sdk::{
        routes::{Handler, RequestExt},
        ApiError, ValidationError,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(handler: Handler, uri: &str) -> HttpResponse {
        EnvelopeLayer::new("/api/docs")
            .layer(handler)
            .oneshot(Request::builder().uri(uri).body(Bytes::new()).unwrap())
            .await
            .unwrap()
    }

    fn body_json(response: &HttpResponse) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn plain_data_is_wrapped_as_success() {
        let handler = Handler::new(|_req| async { Ok::<_, HandlerError>(Reply::data(json!({"foo": 1}))) });
        let response = call(handler, "/api/v1/foo").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(&response);
        assert_eq!(body["status"], "success");
        assert_eq!(body["statusCode"], 200);
        assert_eq!(body["data"], json!({"foo": 1}));
        assert_eq!(body["requestId"].as_str().unwrap().len(), 36);
        assert_eq!(body.as_object().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn caller_chosen_status_is_kept() {
        let handler = Handler::new(|_req| async {
            Ok::<_, HandlerError>(Reply::data(json!({"id": 7})).with_status(StatusCode::CREATED))
        });
        let response = call(handler, "/api/v1/items").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(&response)["statusCode"], 201);
    }

    #[tokio::test]
    async fn existing_envelopes_pass_through() {
        let handler = Handler::new(|_req| async {
            Ok::<_, HandlerError>(Reply::Envelope(Envelope::success_with_status(
                json!("done"),
                StatusCode::ACCEPTED,
            )))
        });
        let response = call(handler, "/api/v1/jobs").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(&response);
        assert_eq!(body["data"], "done");
        assert!(body.get("data").and_then(|d| d.get("status")).is_none());
    }

    #[tokio::test]
    async fn validation_failures_list_fields() {
        let handler = Handler::new(|_req| async {
            Err(HandlerError::from(
                ValidationError::new()
                    .field("title", "Required")
                    .field("tags.0", "Expected string"),
            ))
        });
        let response = call(handler, "/api/v1/notes?draft=1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(&response);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert_eq!(body["error"]["message"], "Validation failed");
        assert_eq!(body["error"]["path"], "/api/v1/notes");
        assert_eq!(
            body["error"]["fields"],
            json!([
                {"field": "title", "message": "Required"},
                {"field": "tags.0", "message": "Expected string"}
            ])
        );
        assert!(body["error"]["suggestion"].is_string());
    }

    #[tokio::test]
    async fn declared_errors_echo_their_status() {
        let handler =
            Handler::new(|_req| async { Err(HandlerError::from(ApiError::not_found("X not found"))) });
        let response = call(handler, "/api/v1/x/1").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(&response);
        assert_eq!(body["status"], "error");
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
        assert_eq!(body["error"]["message"], "X not found");
        assert!(body["error"].get("details").is_none());
        assert!(body["error"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn declared_errors_keep_explicit_extras() {
        let handler = Handler::new(|_req| async {
            Err(HandlerError::from(
                ApiError::conflict("slug taken")
                    .with_code("SLUG_TAKEN")
                    .with_details("slug `a` exists")
                    .with_suggestion("pick another slug")
                    .with_field("slug", "already used"),
            ))
        });
        let body = body_json(&call(handler, "/api/v1/pages").await);
        assert_eq!(body["error"]["code"], "SLUG_TAKEN");
        assert_eq!(body["error"]["details"], "slug `a` exists");
        assert_eq!(body["error"]["suggestion"], "pick another slug");
        assert_eq!(body["error"]["fields"][0]["field"], "slug");
    }

    #[tokio::test]
    async fn anything_else_is_internal() {
        let handler = Handler::new(|_req| async { Err(HandlerError::internal("db offline")) });
        let response = call(handler, "/api/v1/x").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(&response);
        assert_eq!(body["error"]["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(body["error"]["message"], "db offline");
    }

    #[tokio::test]
    async fn exempt_prefix_is_not_wrapped() {
        let handler = Handler::new(|_req| async { Ok::<_, HandlerError>(Reply::data(json!({"openapi": "3.0.3"}))) });
        let response = call(handler, "/api/docs/json").await;
        assert_eq!(body_json(&response), json!({"openapi": "3.0.3"}));

        let handler = Handler::new(|_req| async { Err(HandlerError::internal("viewer broke")) });
        let response = call(handler, "/api/docs").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.body().as_ref(), b"viewer broke");
    }

    #[tokio::test]
    async fn request_path_is_visible_to_handlers() {
        let handler = Handler::new(|req: ApiRequest| async move {
            Ok::<_, HandlerError>(Reply::data(json!(req.request_path().map(String::from))))
        });
        let body = body_json(&call(handler, "/api/v1/where?q=1").await);
        assert_eq!(body["data"], "/api/v1/where");
    }
}
