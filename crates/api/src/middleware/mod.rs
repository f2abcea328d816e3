pub mod org;
pub mod request_id;
