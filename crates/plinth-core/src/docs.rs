use std::sync::Arc;

use anyhow::Result;
use http::{Method, StatusCode};
use plinth_plugin_sdk::{
    routes::{ApiRequest, Handler},
    HandlerError, PluginTag, Reply,
};
use serde_json::{json, Map, Value};

use crate::{config::Config, normalize, router::Router};

/// Builds an OpenAPI 3 document describing every route currently mounted.
pub fn openapi(config: &Config, router: &Router, tags: &[PluginTag]) -> Value {
    let mut paths = Map::new();
    for route in router.routes() {
        let mut operation = Map::new();
        if let Some(tag) = route.manifest().and_then(|manifest| manifest.tag.as_ref()) {
            operation.insert("tags".into(), json!([tag.name]));
        }
        if let Some(owner) = &route.owner {
            operation.insert("x-plugin".into(), json!(owner));
        }
        let params: Vec<Value> = route
            .pattern
            .split('/')
            .filter_map(|part| part.strip_prefix(':'))
            .map(|name| json!({"name": name, "in": "path", "required": true, "schema": {"type": "string"}}))
            .collect();
        if !params.is_empty() {
            operation.insert("parameters".into(), Value::Array(params));
        }
        operation.insert(
            "responses".into(),
            json!({"default": {"description": "Response envelope"}}),
        );

        let entry = paths
            .entry(openapi_path(&route.pattern))
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(methods) = entry {
            methods.insert(route.method.as_str().to_ascii_lowercase(), Value::Object(operation));
        }
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": config.api.title,
            "version": config.api.version.to_string(),
        },
        "tags": tags,
        "paths": paths,
    })
}

/// Registers the viewer page and its JSON document under the docs path.
///
/// Call after plugins are loaded so the document lists their routes and tags.
pub fn register(router: &mut Router, config: &Config, tags: &[PluginTag]) -> Result<()> {
    let document = Arc::new(openapi(config, router, tags));
    let json_path = config.docs.json_path();
    let page = Arc::new(viewer_page(&config.api.title, &json_path));

    router.add(
        Method::GET,
        &config.docs.path,
        Handler::new(move |_req: ApiRequest| {
            let page = page.clone();
            async move {
                Ok::<_, HandlerError>(Reply::raw(normalize::html_response(
                    StatusCode::OK,
                    page.as_ref().clone(),
                )))
            }
        }),
    )?;
    router.add(
        Method::GET,
        &json_path,
        Handler::new(move |_req: ApiRequest| {
            let document = document.clone();
            async move { Ok::<_, HandlerError>(Reply::data(document.as_ref().clone())) }
        }),
    )?;
    Ok(())
}

fn openapi_path(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|part| match part.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn viewer_page(title: &str, spec_url: &str) -> String {
    format!(
        r##"<!doctype html>
<html>
  <head>
    <meta charset="utf-8" />
    <title>{title}</title>
    <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
  </head>
  <body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script>window.ui = SwaggerUIBundle({{ url: "{spec_url}", dom_id: "#swagger-ui" }});</script>
  </body>
</html>
"##
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{header, Request};
    use plinth_plugin_sdk::{PluginManifest, Routes};

    use crate::loader::{MountedPlugin, RouteMount};

    #[test]
    fn viewer_page_points_at_the_json_document() {
        let page = viewer_page("Plinth API", "/api/docs/json");
        assert!(page.contains(r##"dom_id: "#swagger-ui""##));
        assert!(page.contains(r#"url: "/api/docs/json""#));
        assert!(page.contains("<title>Plinth API</title>"));
        assert!(page.trim_end().ends_with("</html>"));
    }

    #[test]
    fn params_use_openapi_braces() {
        assert_eq!(openapi_path("/api/v1/notes/:id"), "/api/v1/notes/{id}");
    }

    #[tokio::test]
    async fn docs_are_served_raw() {
        let config = Config::default();
        let mut router = Router::new(&config.docs.path);
        let mut routes = Routes::new();
        routes.get("/notes/:id", |_req| async {
            Ok::<_, HandlerError>(Reply::data(Value::Null))
        });
        let manifest = PluginManifest {
            name: "Notes".into(),
            version: "1.0.0".into(),
            tag: Some(PluginTag {
                name: "Notes".into(),
                description: "Notes API".into(),
            }),
            ..PluginManifest::default()
        };
        router
            .mount("/api/v1", MountedPlugin::new("notes", manifest.clone(), routes))
            .unwrap();
        register(&mut router, &config, &[manifest.tag.unwrap()]).unwrap();

        let req = Request::builder()
            .uri("/api/docs/json")
            .body(Bytes::new())
            .unwrap();
        let response = router.dispatch(req).await;
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["openapi"], "3.0.3");
        assert_eq!(body["tags"][0]["name"], "Notes");
        assert_eq!(
            body["paths"]["/api/v1/notes/{id}"]["get"]["tags"],
            json!(["Notes"])
        );

        let req = Request::builder().uri("/api/docs").body(Bytes::new()).unwrap();
        let response = router.dispatch(req).await;
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert!(std::str::from_utf8(response.body())
            .unwrap()
            .contains("/api/docs/json"));
    }
}
