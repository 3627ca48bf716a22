//! Order placement with inventory reservation, order queries and status management.

pub mod api;
pub mod catalog;
pub mod handlers;
pub mod models;
pub mod saga;
pub mod schema;
pub mod store;

pub use handlers::OrderService;
pub use saga::ReservationPolicy;
