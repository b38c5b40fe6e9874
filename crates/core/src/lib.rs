pub mod config;
pub mod error;
pub mod paths;
pub mod profile;

pub use config::{BrowserConfig, Config, ServiceConfig, TransportConfig};
pub use error::{Error, Result, RpcStatus};
pub use paths::{validate_profile_name, Paths};
pub use profile::{CookieJar, Profile, ProfileMetadata};
