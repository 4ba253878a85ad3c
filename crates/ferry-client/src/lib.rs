pub mod fetcher;
pub mod solver;

pub use fetcher::ReqwestExecutor;
pub use solver::HttpCaptchaSolver;
