pub mod account;
pub mod order;
pub mod price;
pub mod ws;
