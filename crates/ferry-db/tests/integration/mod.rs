pub mod common;
mod dispatch_tests;
mod job_queue_tests;
