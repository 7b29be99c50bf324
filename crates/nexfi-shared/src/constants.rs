/// Label of the ordered data channel opened for direct messages
pub const DATA_CHANNEL_LABEL: &str = "nexfi-dm";

/// Maximum serialized direct frame size in bytes (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How long a peer session may stay connecting before it is closed, in seconds
pub const SESSION_CONNECT_TIMEOUT_SECS: u64 = 15;

/// STUN servers used when no ICE servers are configured
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Signaling event names
pub const EVENT_WEBRTC_OFFER: &str = "dm:webrtc_offer";
pub const EVENT_WEBRTC_ANSWER: &str = "dm:webrtc_answer";
pub const EVENT_WEBRTC_ICE: &str = "dm:webrtc_ice";

/// Direct frame type tags
pub const FRAME_TYPE_DM: &str = "dm";
pub const FRAME_TYPE_ACK: &str = "dm:ack";

/// Backend sync endpoint path
pub const SYNC_PATH: &str = "/api/messages/sync";

/// Default backend base URL (local development server)
pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Default backend request timeout in seconds
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Periodic sync interval while online, in seconds
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// Delay before the first sync attempt after startup, in milliseconds
pub const SYNC_INITIAL_DELAY_MS: u64 = 3_000;

/// Delay between "connectivity restored" and the sync it triggers, in milliseconds
pub const SYNC_RECONNECT_DEBOUNCE_MS: u64 = 1_500;
