pub mod apply;
pub mod backoff;
pub mod config;
pub mod convert;
pub mod diff;
pub mod domain;
pub mod http;
pub mod id;
pub mod proxy;
pub mod proxy_supervisor;
pub mod reconcile;
pub mod render;
pub mod resources;
pub mod source;
pub mod state;
pub mod status;
pub mod version;
