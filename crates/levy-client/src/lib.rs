pub mod fetcher;
pub mod notifier;
pub mod parser;

#[cfg(feature = "browser")]
pub mod browser;

#[cfg(feature = "browser")]
pub use browser::{ChromiumDriver, ChromiumDriverFactory};
pub use fetcher::ReqwestFetcher;
pub use notifier::WebhookNotifier;
pub use parser::PatternParser;

use levy_core::strategy::DirectFetchStrategy;

/// Plain HTTP fetch plus label-pattern parsing.
pub type HttpStrategy = DirectFetchStrategy<ReqwestFetcher, PatternParser>;
