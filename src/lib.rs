//! Property search automation, listing extraction and travel-time
//! enrichment for Australian real-estate sites.
//!
//! A run goes [`scrapers::SearchEngine`] → [`parser::ListingParser`] →
//! [`enrichment::DistanceEnricher`]. Each site is described by a
//! [`sites::SiteCapability`] rather than by code.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod models;
pub mod output;
pub mod parser;
pub mod retry;
pub mod scrapers;
pub mod sites;

pub use config::ScoutConfig;
pub use error::{Result, ScoutError};
pub use models::{ListingCollection, Location, PropertyListing, RawPage, TravelMode, TravelTime};
