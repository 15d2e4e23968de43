// Authentication module
// Manages the OAuth2 token lifecycle, persistence and renewal

pub mod clock;
pub mod events;
pub mod manager;
pub mod renewal;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{AuthEvent, AuthListener, EventBus, TracingListener};
pub use manager::{ClientSettings, TokenManager, DEFAULT_TOKEN_PATH, STORAGE_KEY};
pub use renewal::{RenewalHandle, RenewalPolicy};
pub use transport::AuthTransport;
pub use types::{
    normalize_expires_in, normalize_token_type, token_preview, AuthRequest, AuthorizationHeader,
    Grant, ResponseFormat, TokenState,
};
