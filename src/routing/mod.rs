pub mod router;

pub use router::Router;
