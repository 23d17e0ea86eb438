use std::{sync::Arc, time::Instant};

use anyhow::Result;
use http::Method;
use plinth_plugin_sdk::{
    envelope::{iso_timestamp, Envelope},
    routes::{ApiRequest, Handler},
    HandlerError, Reply,
};
use serde::Serialize;
use serde_json::json;

use crate::{
    config::Config,
    docs,
    loader::{LoadReport, Loader},
    plugin::PluginRegistry,
    router::Router,
};

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: String,
    pub version: String,
    pub environment: String,
    pub uptime: f64,
}

/// Builds the full route table: host routes, every activatable plugin, docs.
pub fn build(config: &Config, registry: &PluginRegistry) -> Result<(Router, LoadReport)> {
    config.validate()?;
    let mut router = Router::new(&config.docs.path);
    register_host_routes(&mut router, config)?;

    let report = Loader::new(config, registry).load(&mut router)?;
    docs::register(&mut router, config, &report.tags)?;
    Ok((router, report))
}

fn register_host_routes(router: &mut Router, config: &Config) -> Result<()> {
    let index = Arc::new(json!({
        "message": config.api.title,
        "version": config.api.version.to_string(),
    }));
    router.add(
        Method::GET,
        "/api",
        Handler::new(move |_req: ApiRequest| {
            let index = index.clone();
            async move { Ok::<_, HandlerError>(Reply::data(index.as_ref().clone())) }
        }),
    )?;

    let started = Instant::now();
    let version = config.api.version.to_string();
    let environment = config.api.environment.clone();
    router.add(
        Method::GET,
        "/api/health",
        Handler::new(move |_req: ApiRequest| {
            let health = HealthStatus {
                status: "healthy",
                timestamp: iso_timestamp(),
                version: version.clone(),
                environment: environment.clone(),
                uptime: started.elapsed().as_secs_f64(),
            };
            async move {
                let data = serde_json::to_value(health)?;
                Ok::<_, HandlerError>(Reply::Envelope(Envelope::success(data)))
            }
        }),
    )?;
    Ok(())
}
