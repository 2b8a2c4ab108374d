pub mod geckoterminal;
pub mod price_source;

// Re-export commonly used types
pub use geckoterminal::GeckoTerminalClient;
pub use price_source::PriceSource;
