//! Profile lifecycle: guarded persistence of harvested credentials and the
//! re-authentication hook used by the transport.

mod lock;
pub mod manager;
pub mod refresher;

pub use manager::{AuthManager, CredentialSource, SaveRequest};
pub use refresher::BrowserRefresher;
