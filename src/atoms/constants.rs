// ── Cojoin Atoms: Constants ────────────────────────────────────────────────
// All named constants for the crate live here.
// Collecting constants in one place keeps wire names, storage keys and
// user-visible copy out of the logic modules.

// ── Session storage keys ──────────────────────────────────────────────────
// Read by the chatbot on init and on restore. Treat as stable identifiers:
// renaming one orphans every persisted transcript in open tabs.
pub const STORAGE_CHAT_HISTORY: &str = "chatHistory";
pub const STORAGE_CHAT_STATE: &str = "chatState";
pub const STORAGE_CHAT_NONCE: &str = "chatNonce";
/// Per-tab cap, keys plus values, as browsers apply to sessionStorage.
pub const SESSION_STORE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

// ── Fixed DOM identities ──────────────────────────────────────────────────
pub const CHATBOT_ROOT_ID: &str = "chatbot-container";
pub const MODAL_ROOT_CLASS: &str = "modal-container";
pub const MODAL_CLOSE_CLASS: &str = "modal-close";
pub const MODAL_HEADER_CLASS: &str = "modal-header";
pub const OVERLAY_CLASS: &str = "modal-overlay";
pub const CHAT_OPEN_BTN_ID: &str = "chat-open-btn";
pub const CHAT_REOPEN_CLASS: &str = "chatbot-reopen";
pub const MODAL_REOPEN_CLASS: &str = "modal-reopen";
pub const CHAT_HEADER_ID: &str = "chatbot-header";
pub const CHAT_LOG_ID: &str = "chat-log";
pub const CHAT_FORM_ID: &str = "chatbot-input-grid";
pub const CHAT_INPUT_ID: &str = "chatbot-input";
pub const CHAT_SEND_ID: &str = "chatbot-send";
pub const CHAT_CLOSE_ID: &str = "chatbot-close";
pub const CHAT_MINIMIZE_ID: &str = "minimizeBtn";
pub const LANG_CTRL_ID: &str = "langCtrl";
pub const THEME_CTRL_ID: &str = "themeCtrl";
pub const FORM_STATUS_CLASS: &str = "form-status";
pub const HP_TEXT_ID: &str = "hp_text";
pub const HP_CHECK_ID: &str = "hp_check";
pub const FAB_CONTAINER_CLASS: &str = "fab-container";
pub const FAB_MAIN_CLASS: &str = "fab-main";
pub const FAB_OPTION_CLASS: &str = "fab-option";
pub const DRAG_ENABLED_CLASS: &str = "drag-enabled";
pub const DARK_THEME_CLASS: &str = "dark";

// ── CSRF ───────────────────────────────────────────────────────────────────
pub const CSRF_FIELD: &str = "csrfToken";
pub const CSRF_HEADER: &str = "X-CSRF-Token";
pub const CSRF_TOKEN_PATH: &str = "/api/csrf-token";
/// Body `error` of the 403 that refuses a token.
pub const CSRF_REFUSED_ERROR: &str = "Invalid CSRF token";

// ── Timing ─────────────────────────────────────────────────────────────────
/// Inactivity deadline while a widget is open.
pub const DEFAULT_INACTIVITY_OPEN_MS: u64 = 120_000;
/// Inactivity deadline while a widget is minimized.
pub const DEFAULT_INACTIVITY_MINIMIZED_MS: u64 = 120_000;
/// Conversation nonce lifetime, refreshed on every message.
pub const CONVERSATION_TTL_SECS: u64 = 600;
/// CSRF token lifetime on the site server.
pub const CSRF_TTL_SECS: u64 = 600;
/// Claimed nonces are remembered for a day.
pub const NONCE_RECORD_TTL_SECS: u64 = 86_400;
/// Signed session cookies expire after a day.
pub const SESSION_MAX_AGE_SECS: u64 = 86_400;

// ── Limits ─────────────────────────────────────────────────────────────────
pub const DEFAULT_NONCE_ATTEMPTS: u32 = 3;
pub const DEFAULT_DRAG_MIN_WIDTH: f64 = 768.0;
/// Distance kept from the viewport edges when dragging is disabled.
pub const SAFE_AREA_INSET: f64 = 16.0;
/// Gap between the FAB and the re-open affordance above it.
pub const REOPEN_GAP: f64 = 10.0;
/// Upper bound on a single inbound HTTP request.
pub const MAX_REQUEST_BYTES: usize = 65_536;

// ── User-visible copy ──────────────────────────────────────────────────────
// Deliberately vague. Never interpolate error details into these.
pub const MSG_BLOCKED: &str = "Security: blocked due to suspicious activity.";
pub const MSG_ALERT_BLOCKED: &str = "Security check failed. This session has been blocked.";
pub const MSG_SECURITY_UNAVAILABLE: &str = "Security check unavailable. Please try again later.";
pub const MSG_CANT_REACH: &str = "Error: Can't reach the assistant.";
pub const MSG_NO_REPLY: &str = "No reply.";
pub const MSG_PENDING: &str = "…";
pub const MSG_SECURITY_FAILED: &str = "Security check cancelled.";
pub const MSG_FORM_SENDING: &str = "Sending…";
pub const MSG_FORM_SENT: &str = "Thank you! Your message has been sent.";
pub const MSG_FORM_FAILED: &str = "Sorry, we couldn't send your message. Please try again.";
