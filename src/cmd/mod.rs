//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                  |
//! |----------|-----------------------------------|
//! | `serve`  | `Serve`, `Proxy`, `Artifacts`     |
//! | `db`     | `InitDb`                          |
//! | `config` | `Config`                          |

pub mod config;
pub mod db;
pub mod serve;

pub use config::cmd_config;
pub use db::cmd_init_db;
pub use serve::{cmd_artifacts, cmd_proxy, cmd_serve};
