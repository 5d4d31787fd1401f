//! Venue access: REST client, streaming book feed, and wire types.

pub mod client;
pub mod types;
pub mod ws;

pub use client::{Venue, VenueClient};
pub use ws::{BookTick, MarketWsFeed, UpdateHandler};
