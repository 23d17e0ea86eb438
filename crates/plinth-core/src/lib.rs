pub mod app;
pub mod config;
pub mod discovery;
pub mod docs;
pub mod loader;
pub mod normalize;
pub mod plugin;
pub mod router;
pub mod server;

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
