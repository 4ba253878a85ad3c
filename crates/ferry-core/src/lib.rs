pub mod captcha;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod limiter;
pub mod memory_queue;
pub mod proxy;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use captcha::{CaptchaConfig, CaptchaGate, Challenge, ChallengeKind};
pub use dispatcher::{
    DispatchEvent, DispatchReporter, Dispatcher, DispatcherConfig, HealthSnapshot,
    MetricsReporter, TracingReporter, Transition,
};
pub use error::{AppError, FailureKind};
pub use job::{EnqueueRequest, Job, JobState, Priority, compute_hash};
pub use job_queue::{JobQueue, QueueDepth, enqueue_batch};
pub use limiter::{DomainLimit, DomainLimitConfig, DomainRateLimiter};
pub use memory_queue::MemoryJobQueue;
pub use proxy::{ProxyLease, ProxyPool, ProxyPoolConfig};
pub use retry::RetryPolicy;
pub use traits::{AttemptOutcome, CaptchaSolver, FetchExecutor, TransportErrorKind};
