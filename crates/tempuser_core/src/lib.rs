pub mod accounts;
pub mod clock;
pub mod config;
pub mod creator;
pub mod error;
pub mod migrate;
pub mod pattern;
pub mod runtime;
pub mod serial_mapping;
pub mod serial_provider;
pub mod session;
pub mod status;
pub mod temp_user_config;
pub mod throttle;

pub use creator::{RequestContext, STASH_KEY, TempUserCreator};
pub use error::TempUserError;
pub use pattern::Pattern;
pub use status::CreateStatus;
pub use temp_user_config::RealTempUserConfig;
