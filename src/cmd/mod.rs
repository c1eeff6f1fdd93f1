//! CLI command implementations.
//!
//! | Module   | Commands handled                                                        |
//! |----------|-------------------------------------------------------------------------|
//! | `run`    | `Create`, `Confirm`, `Status`, `List`, `Resume`, `Cancel`, `RetryDlq`, `Purge` |
//! | `jobs`   | `Work`                                                                  |
//! | `serve`  | `Serve`                                                                 |
//! | `config` | `Config`                                                                |
//! | `export` | `Export`                                                                |
//! | `knowledge` | `Ingest`, `Documents`, `Query`, `Translate`                          |

pub mod config;
pub mod export;
pub mod jobs;
pub mod knowledge;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use export::cmd_export;
pub use jobs::cmd_work;
pub use knowledge::{cmd_documents, cmd_ingest, cmd_query, cmd_translate};
pub use run::{
    cmd_cancel, cmd_confirm, cmd_create, cmd_list, cmd_purge, cmd_resume, cmd_retry_dlq, cmd_status,
};
pub use serve::cmd_serve;
