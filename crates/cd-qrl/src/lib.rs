pub mod limiter;
pub mod redis_backend;
pub mod scoped;
pub mod sweeper;

pub use limiter::{Limits, QuotaLimiter, Ticket};
pub use redis_backend::RedisQuotaLimiter;
pub use scoped::TicketGuard;
