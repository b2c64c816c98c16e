pub mod facade;
pub mod routes;

pub use facade::AdminFacade;
pub use routes::router;
