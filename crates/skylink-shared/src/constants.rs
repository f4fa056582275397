/// Suffix carried by every remote user id
pub const USER_SUFFIX: &str = "@s.skype.net";

/// Suffix carried by every remote group conversation id
pub const GROUP_SUFFIX: &str = "@thread.skype";

/// Remote pseudo-conversations that never become portals
pub const IGNORED_CONVERSATIONS: &[&str] = &["48:calllogs", "48:starred"];

/// Number of remote message ids remembered per portal
pub const RECENTLY_HANDLED_LEN: usize = 100;

/// Inbound queue capacity of a single portal
pub const PORTAL_QUEUE_CAPACITY: usize = 128;

/// Event queue capacity of a single connected user
pub const USER_EVENT_QUEUE_CAPACITY: usize = 256;

/// Messages older than this (seconds) never trigger room creation
pub const MAX_MESSAGE_AGE_TO_CREATE_PORTAL_SECS: i64 = 5 * 60;

/// Tolerated clock skew (seconds) before a message counts as out of order
pub const OUT_OF_ORDER_TOLERANCE_SECS: i64 = 1;

/// Typing notifications expire after this many seconds
pub const TYPING_TIMEOUT_SECS: i64 = 15;

/// Protocol identity published in bridge info state events
pub const PROTOCOL_ID: &str = "skype";
pub const PROTOCOL_NAME: &str = "Skype";
pub const PROTOCOL_URL: &str = "https://www.skype.com/";

/// Bridge info state event types
pub const BRIDGE_INFO_EVENT: &str = "m.bridge";
pub const BRIDGE_INFO_EVENT_LEGACY: &str = "uk.half-shot.bridge";

/// Topic given to private chat rooms
pub const PRIVATE_CHAT_TOPIC: &str = "skype private chat";

/// Power levels
pub const POWER_LEVEL_BOT: i64 = 100;
pub const POWER_LEVEL_OWNER: i64 = 95;
pub const POWER_LEVEL_SUPERADMIN: i64 = 95;
pub const POWER_LEVEL_ADMIN: i64 = 50;
pub const POWER_LEVEL_INVITE: i64 = 50;

/// Display name quality ranks for puppets
pub const NAME_QUALITY_DISPLAYNAME: i64 = 3;
pub const NAME_QUALITY_PERSON_ID: i64 = 1;
pub const NAME_QUALITY_NONE: i64 = 0;
