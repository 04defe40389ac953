//! CLI command implementations.
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `run`     | `Run`                 |
//! | `submit`  | `Submit`, `Results`   |
//! | `claims`  | `Claims`              |
//! | `config`  | `Config`              |

pub mod claims;
pub mod config;
pub mod run;
pub mod submit;

pub use claims::cmd_claims;
pub use config::cmd_config;
pub use run::cmd_run;
pub use submit::{cmd_results, cmd_submit};
