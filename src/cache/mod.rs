pub mod property_stats;

pub use property_stats::PropertyStatsCache;
