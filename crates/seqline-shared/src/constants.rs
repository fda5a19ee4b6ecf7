/// Sync protocol generation. Every sync response must declare it.
pub const SYNC_PROTOCOL_VERSION: u32 = 2;

/// Name of the per-user watermark field in sync responses.
pub const SYNC_WATERMARK_FIELD: &str = "updateId";

/// Cursor protocol generation for message listing pages.
pub const CURSOR_PROTOCOL_VERSION: u32 = 1;

/// Realtime frame version carried in every frame as `v`.
pub const REALTIME_PROTOCOL_VERSION: u32 = 1;

/// Response headers mirroring the sync contract fields.
pub const HEADER_SYNC_PROTOCOL: &str = "x-sync-protocol";
pub const HEADER_SYNC_WATERMARK: &str = "x-sync-watermark";

/// Groups with more members than this switch to read-scaling fanout.
pub const DEFAULT_GROUP_FANOUT_THRESHOLD: usize = 500;

/// Lower bound accepted for a configured fanout threshold.
pub const MIN_GROUP_FANOUT_THRESHOLD: usize = 50;

/// Default and maximum page sizes for `POST /sync/difference`.
pub const SYNC_DIFFERENCE_DEFAULT_LIMIT: u32 = 100;
pub const SYNC_DIFFERENCE_MAX_LIMIT: u32 = 500;

/// Long-poll timeouts for `GET /sync/updates` (milliseconds).
pub const SYNC_POLL_DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const SYNC_POLL_MAX_TIMEOUT_MS: u64 = 60_000;

/// Message listing page sizes.
pub const MESSAGE_PAGE_DEFAULT_LIMIT: u32 = 50;
pub const MESSAGE_PAGE_MAX_LIMIT: u32 = 100;
pub const MESSAGE_CONTEXT_DEFAULT_LIMIT: u32 = 30;

/// Send acknowledgement timeout over the realtime transport (milliseconds).
pub const SEND_ACK_TIMEOUT_MS: u64 = 10_000;
