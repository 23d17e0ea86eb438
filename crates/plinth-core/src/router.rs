use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result};
use http::Method;
use plinth_plugin_sdk::{
    routes::{ApiRequest, Handler, HttpResponse, PathParams, RequestPath},
    ApiError, PluginManifest,
};
use tower::{Layer, ServiceExt};

use crate::{
    loader::{MountedPlugin, RouteMount},
    normalize::{EnvelopeLayer, EnvelopeService},
};

/// Immutable-after-startup route table; every entry sits behind the envelope layer.
#[derive(Clone)]
pub struct Router {
    routes: Vec<RouteHandle>,
    envelope: EnvelopeLayer,
}

#[derive(Clone)]
pub struct RouteHandle {
    pub method: Method,
    pub pattern: String,
    pub owner: Option<String>,
    segments: Vec<Segment>,
    manifest: Option<Arc<PluginManifest>>,
    service: EnvelopeService<Handler>,
}

impl RouteHandle {
    pub fn manifest(&self) -> Option<&PluginManifest> {
        self.manifest.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Router {
    /// `exempt_prefix` is the documentation surface that bypasses wrapping.
    pub fn new(exempt_prefix: &str) -> Self {
        Self {
            routes: Vec::new(),
            envelope: EnvelopeLayer::new(exempt_prefix),
        }
    }

    /// Registers a host-owned route such as the index, health or docs pages.
    pub fn add(&mut self, method: Method, pattern: &str, handler: Handler) -> Result<()> {
        let handle = self.handle(method, join_path("", pattern), None, None, handler)?;
        self.insert_all(vec![handle])
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteHandle> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn select(&self, method: &Method, path: &str) -> Option<(&RouteHandle, PathParams)> {
        let parts = split(path);
        self.routes.iter().find_map(|route| {
            if &route.method != method {
                return None;
            }
            match_segments(&route.segments, &parts).map(|params| (route, params))
        })
    }

    /// Routes one request; misses become a 404 envelope.
    pub async fn dispatch(&self, mut req: ApiRequest) -> HttpResponse {
        let path = RequestPath::from_uri(req.uri());
        let Some((route, params)) = self.select(req.method(), path.as_str()) else {
            let err = ApiError::not_found(format!("no route for {} {}", req.method(), path.as_str()));
            return self.envelope.respond(Err(err.into()), &path);
        };
        req.extensions_mut().insert(path);
        req.extensions_mut().insert(params);
        if let Some(manifest) = &route.manifest {
            req.extensions_mut().insert(manifest.clone());
        }
        match route.service.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    fn handle(
        &self,
        method: Method,
        pattern: String,
        owner: Option<String>,
        manifest: Option<Arc<PluginManifest>>,
        handler: Handler,
    ) -> Result<RouteHandle> {
        let segments = parse_pattern(&pattern)?;
        Ok(RouteHandle {
            method,
            pattern,
            owner,
            segments,
            manifest,
            service: self.envelope.layer(handler),
        })
    }

    // All-or-nothing: a conflict rejects the whole batch.
    fn insert_all(&mut self, handles: Vec<RouteHandle>) -> Result<()> {
        for (index, handle) in handles.iter().enumerate() {
            let clash = self
                .routes
                .iter()
                .chain(handles[..index].iter())
                .find(|existing| {
                    existing.method == handle.method && same_shape(&existing.segments, &handle.segments)
                });
            if let Some(existing) = clash {
                bail!(
                    "route {} {} conflicts with {} registered by {}",
                    handle.method,
                    handle.pattern,
                    existing.pattern,
                    existing.owner.as_deref().unwrap_or("the host")
                );
            }
        }
        self.routes.extend(handles);
        Ok(())
    }
}

impl RouteMount for Router {
    fn mount(&mut self, prefix: &str, plugin: MountedPlugin) -> Result<()> {
        let MountedPlugin {
            id,
            manifest,
            routes,
        } = plugin;
        let handles = routes
            .into_iter()
            .map(|def| {
                self.handle(
                    def.method,
                    join_path(prefix, &def.path),
                    Some(id.clone()),
                    Some(manifest.clone()),
                    def.handler,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let count = handles.len();
        self.insert_all(handles)?;
        tracing::debug!(plugin = %id, prefix, routes = count, "mounted plugin routes");
        Ok(())
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => prefix.to_string(),
        (true, false) => format!("/{path}"),
        (false, false) => format!("{prefix}/{path}"),
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    split(pattern)
        .into_iter()
        .map(|part| match part.strip_prefix(':') {
            Some("") => bail!("route `{pattern}` has an unnamed parameter"),
            Some(name) => Ok(Segment::Param(name.to_string())),
            None => Ok(Segment::Literal(part.to_string())),
        })
        .collect()
}

fn same_shape(a: &[Segment], b: &[Segment]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|pair| match pair {
            (Segment::Literal(x), Segment::Literal(y)) => x == y,
            (Segment::Param(_), Segment::Param(_)) => true,
            _ => false,
        })
}

// Percent-decodes one path segment; `+` stays literal. Invalid UTF-8 keeps the raw text.
fn decode_segment(part: &str) -> String {
    urlencoding::decode(part)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| part.to_string())
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<PathParams> {
    if segments.len() != parts.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(parts) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), decode_segment(part));
            }
        }
    }
    Some(PathParams(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use plinth_plugin_sdk::{HandlerError, Reply, RequestExt, Routes};
    use serde_json::{json, Value};

    fn echo_param(name: &'static str) -> Handler {
        Handler::new(move |req: ApiRequest| async move {
            Ok::<_, HandlerError>(Reply::data(json!(req.param(name))))
        })
    }

    fn plugin(id: &str, routes: Routes) -> MountedPlugin {
        let manifest = PluginManifest {
            name: id.to_uppercase(),
            version: "1.0.0".into(),
            ..PluginManifest::default()
        };
        MountedPlugin::new(id, manifest, routes)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Bytes::new()).unwrap();
        let response = router.dispatch(req).await;
        let body = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (response.status(), body)
    }

    #[test]
    fn paths_join_without_duplicate_slashes() {
        assert_eq!(join_path("/api/v1", "/notes/"), "/api/v1/notes");
        assert_eq!(join_path("/api/v1/", ""), "/api/v1");
        assert_eq!(join_path("", "health"), "/health");
    }

    #[test]
    fn params_capture_single_segments() {
        let segments = parse_pattern("/api/v1/notes/:id").unwrap();
        let params = match_segments(&segments, &split("/api/v1/notes/42")).unwrap();
        assert_eq!(params.0.get("id").map(String::as_str), Some("42"));
        assert!(match_segments(&segments, &split("/api/v1/notes/42/x")).is_none());
        assert!(parse_pattern("/a/:").is_err());
    }

    #[tokio::test]
    async fn mounts_under_prefix_and_exposes_manifest() {
        let mut routes = Routes::new();
        routes.get("/notes/:id", |req: ApiRequest| async move {
            let name = req.plugin_manifest().map(|m| m.name.clone());
            Ok::<_, HandlerError>(Reply::data(json!({"id": req.param("id"), "owner": name})))
        });
        let mut router = Router::new("/api/docs");
        router.mount("/api/v1", plugin("notes", routes)).unwrap();

        let (status, body) = get(&router, "/api/v1/notes/9?full=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"id": "9", "owner": "NOTES"}));

        let (status, _) = get(&router, "/notes/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn params_are_percent_decoded() {
        let segments = parse_pattern("/api/v1/notes/:title").unwrap();
        let params = match_segments(&segments, &split("/api/v1/notes/release%20notes")).unwrap();
        assert_eq!(params.0["title"], "release notes");
        let params = match_segments(&segments, &split("/api/v1/notes/a+b")).unwrap();
        assert_eq!(params.0["title"], "a+b");
        let params = match_segments(&segments, &split("/api/v1/notes/%FF")).unwrap();
        assert_eq!(params.0["title"], "%FF");
    }

    #[tokio::test]
    async fn handlers_see_decoded_params() {
        let mut router = Router::new("/api/docs");
        router
            .add(Method::GET, "/api/v1/tags/:tag", echo_param("tag"))
            .unwrap();
        let (status, body) = get(&router, "/api/v1/tags/caf%C3%A9%20au%20lait").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "café au lait");
    }

    #[tokio::test]
    async fn misses_under_docs_prefix_are_not_enveloped() {
        let router = Router::new("/api/docs");
        let req = Request::builder()
            .uri("/api/docs/missing")
            .body(Bytes::new())
            .unwrap();
        let response = router.dispatch(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            std::str::from_utf8(response.body()).unwrap(),
            "no route for GET /api/docs/missing"
        );
    }

    #[tokio::test]
    async fn unmatched_routes_are_not_found_envelopes() {
        let router = Router::new("/api/docs");
        let (status, body) = get(&router, "/api/v1/missing?x=1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
        assert_eq!(body["error"]["path"], "/api/v1/missing");
    }

    #[test]
    fn conflicting_mount_adds_nothing() {
        let mut router = Router::new("/api/docs");
        router
            .add(Method::GET, "/api/v1/shared", echo_param("x"))
            .unwrap();

        let mut routes = Routes::new();
        routes.get("/fresh", |_req| async { Ok::<_, HandlerError>(Reply::data(Value::Null)) });
        routes.get("/shared", |_req| async { Ok::<_, HandlerError>(Reply::data(Value::Null)) });
        let err = router.mount("/api/v1", plugin("dup", routes)).unwrap_err();
        assert!(err.to_string().contains("conflicts"));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn param_names_do_not_distinguish_routes() {
        let mut router = Router::new("/api/docs");
        router.add(Method::GET, "/items/:id", echo_param("id")).unwrap();
        assert!(router.add(Method::GET, "/items/:slug", echo_param("slug")).is_err());
        assert!(router.add(Method::POST, "/items/:slug", echo_param("slug")).is_ok());
    }
}
