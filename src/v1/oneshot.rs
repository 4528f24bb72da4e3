// Oneshot api endpoints, nested under /api.
pub mod generate_oneshot;
pub mod version;
