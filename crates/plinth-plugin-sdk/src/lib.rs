pub mod envelope;
pub mod error;
pub mod manifest;
pub mod routes;
pub mod version;

pub use envelope::{Envelope, ErrorDetails};
pub use error::{ApiError, FieldError, HandlerError, ValidationError};
pub use manifest::{PluginManifest, PluginMetadata, PluginTag};
pub use routes::{ApiRequest, HttpResponse, Reply, RequestExt, Routes};

/// Runtime half of a plugin, produced by the factory registered for its id.
///
/// `mount` only records handlers; the host decides whether they are exposed
/// and under which versioned prefix.
pub trait Plugin: Send + Sync + 'static {
    fn mount(&self, routes: &mut Routes) -> anyhow::Result<()>;
}
