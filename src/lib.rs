pub mod config;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod settings;
pub mod store;
pub mod util;
