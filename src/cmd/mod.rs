//! CLI command implementations.
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `serve`       | `Serve`          |
//! | `config`      | `Config`         |
//! | `transitions` | `Transitions`    |

pub mod config;
pub mod serve;
pub mod transitions;

pub use config::cmd_config;
pub use serve::{ServeOverrides, cmd_serve};
pub use transitions::cmd_transitions;
