pub mod pending;
pub mod record;
pub mod stats;

pub use pending::PendingCache;
pub use record::{
    format_latency, latency_between, snippet, ReplyEvent, ReplyMessage, ResponseRecord,
    TriggeringMessage,
};
pub use stats::{
    all_user_stats, overall_stats, user_stats, FixedOffsetCalendar, LocalCalendar, OverallStats,
    UserStats,
};
