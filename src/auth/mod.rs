pub mod fingerprint;
pub mod refresher;

pub use refresher::{RefreshError, RefreshedToken, TokenRefresher};
