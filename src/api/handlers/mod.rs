//! REST API handlers organized by domain.

pub mod drugs;
pub mod health;
pub mod manufacturers;
pub mod provenance;

pub use drugs::*;
pub use health::*;
pub use manufacturers::*;
pub use provenance::*;
