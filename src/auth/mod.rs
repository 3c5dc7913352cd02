//! Authentication core
//!
//! Handles:
//! - OAuth handshake orchestration (begin / callback / logout)
//! - Sliding server-side sessions
//! - Single-use CSRF tokens

mod csrf;
mod middleware;
mod oauth;
pub mod session;
pub mod settings;

pub use csrf::{csrf_guard, rotate_csrf, verify_csrf};
pub use middleware::protect;
pub use oauth::{
    AuthRedirect, STATE_LENGTH, auth_router, begin_auth, complete_auth, generate_state,
    handshake_cookie, verify_handshake,
};
pub(crate) use oauth::session_info;
pub use session::{
    AuthContext, CurrentSession, MaybeSession, clear_session_cookie, resolve_session,
    session_cookie, slide_session,
};
pub use settings::{AuthSettings, CookieSettings, RouteSettings, SkipFn, TokenExtractor};
