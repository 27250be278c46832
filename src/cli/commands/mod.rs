mod config;
mod extract;
mod runs;
mod search;
mod serve;
mod status;

pub use config::ConfigCommand;
pub use extract::ExtractArgs;
pub use runs::CancelArgs;
pub use search::SearchArgs;
pub use serve::{ServeArgs, ServeCommand, runs_daemon};
pub use status::StatusArgs;

pub use config::handle_config;
pub use extract::handle_extract;
pub use runs::{handle_cancel, handle_health, handle_stats};
pub use search::handle_search;
pub use serve::handle_serve;
pub use status::handle_status;
