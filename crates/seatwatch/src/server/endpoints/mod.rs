pub mod offerings;
pub mod status;
pub mod subscriptions;
